//! Packages: functions, types, and strings in a section-oriented binary
//! format, the text assembler/disassembler, the bytecode verifier, and the
//! safepoint builder.

mod asm;
mod error;
mod function;
mod package;
mod roots;
mod safepoints;
mod serial;
mod string;
mod types;
mod verify;

pub use asm::{read_package_asm, write_package_asm};
pub use error::{Error, FileError, ParseError, Position, ValidateError};
pub use function::{BoundArray, Function};
pub use package::Package;
pub use roots::{roots, Roots};
pub use safepoints::{bitmap_bytes, entry_size, Safepoints};
pub use serial::{FUNCTION_ENTRY_SIZE, MAGIC, SECTION_HEADER_SIZE};
pub use string::VmString;
pub use types::{Type, TypeKind};
pub use verify::build_safepoints;

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(source: &str) -> Result<Package, Error> {
        read_package_asm("test.csws", &mut source.as_bytes())
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("cswp-test-{}-{}", std::process::id(), name));
        path
    }

    #[test]
    fn assembles_a_minimal_function() {
        let package =
            assemble("function main() { int64 0; sys exit }").expect("asm");
        assert_eq!(package.function_count(), 1);
        let main = package
            .function_by_name("main")
            .expect("lookup")
            .expect("main exists");
        assert_eq!(main.name().as_str(), "main");
        assert!(main.param_types().is_empty());
        assert!(main.return_types().is_empty());
        // int64 0 (9 bytes) + sys exit (2 bytes)
        assert_eq!(main.insts().len(), 11);
        package.validate().expect("validates");
    }

    #[test]
    fn assembles_calls_and_branches() {
        let source = "\
function add(int64, int64) -> (int64) {
  loadarg 0
  loadarg 1
  add
  ret
}

function main() {
  int64 7
  int64 8
  call add
  sys println
  int64 0
  sys exit
}
";
        let package = assemble(source).expect("asm");
        package.validate().expect("validates");
        let main = package.function_by_name("main").unwrap().unwrap();
        // The call safepoint sits right after the call instruction.
        let sp = main.safepoints().expect("safepoints installed");
        assert_eq!(sp.count(), 2); // call add, sys println
        assert_eq!(main.frame_size(), 2);
    }

    #[test]
    fn labels_resolve_forward_and_backward() {
        let source = "function main() { int64 1; int64 1; eq; bif L1; \
                      int64 10; sys println; b L2; L1: int64 20; \
                      sys println; L2: int64 0; sys exit }";
        let package = assemble(source).expect("asm");
        package.validate().expect("validates");
    }

    #[test]
    fn rejects_unbound_labels() {
        let err = assemble("function main() { b nowhere; ret }").unwrap_err();
        match err {
            Error::Parse(e) => {
                assert!(e.message.contains("unbound label"), "{}", e.message)
            }
            other => panic!("expected parse error, got {other}"),
        }
    }

    #[test]
    fn rejects_undefined_callees() {
        let err =
            assemble("function main() { call ghost; ret }").unwrap_err();
        match err {
            Error::Parse(e) => {
                assert!(e.message.contains("undefined function"), "{}", e.message)
            }
            other => panic!("expected parse error, got {other}"),
        }
    }

    #[test]
    fn verifier_rejects_missing_operands() {
        // add with only one operand on the stack.
        let package =
            assemble("function main() { int64 1; add; ret }").expect("asm");
        let err = package.validate().unwrap_err();
        match err {
            Error::Validate(e) => {
                assert_eq!(e.def_name, "main");
                // The add sits after the 9-byte int64 at offset 0.
                assert!(e.message.contains("at offset 9"), "{}", e.message);
                assert!(e.message.contains("add"), "{}", e.message);
            }
            other => panic!("expected validate error, got {other}"),
        }
    }

    #[test]
    fn verifier_rejects_type_mismatches() {
        let package =
            assemble("function main() { true; int64 1; add; ret }")
                .expect("asm");
        assert!(package.validate().is_err());
    }

    #[test]
    fn verifier_rejects_branch_stack_mismatches() {
        // One path reaches L1 with an extra int64 on the stack.
        let source = "function main() { true; bif L1; int64 3; b L1; \
                      L1: int64 0; sys exit }";
        let package = assemble(source).expect("asm");
        let err = package.validate().unwrap_err();
        match err {
            Error::Validate(e) => {
                assert!(e.message.contains("stack depth"), "{}", e.message)
            }
            other => panic!("expected validate error, got {other}"),
        }
    }

    #[test]
    fn verifier_requires_return_types() {
        let package =
            assemble("function f() -> (int64) { ret }").expect("asm");
        assert!(package.validate().is_err());
    }

    #[test]
    fn built_safepoints_match_stored_ones() {
        let source = "\
function f() -> (int64) {
  int64 4
  ret
}

function main() {
  call f
  sys println
  int64 0
  sys exit
}
";
        let package = assemble(source).expect("asm");
        let main = package.function_by_name("main").unwrap().unwrap();
        let built = build_safepoints(&main, &package).expect("verifies");
        assert_eq!(*built, *main.safepoints().expect("stored"));
        // call at 0 (5 bytes) -> safepoint at 5; sys println at 5 (2 bytes)
        // -> safepoint at 7.
        assert_eq!(built.offset_at(0), 5);
        assert_eq!(built.offset_at(1), 7);
    }

    #[test]
    fn binary_round_trip_preserves_functions() {
        let source = "\
function add(int64, int64) -> (int64) {
  loadarg 0
  loadarg 1
  add
  ret
}

function main() {
  int64 7
  int64 8
  call add
  sys println
  int64 0
  sys exit
}
";
        let package = assemble(source).expect("asm");
        let path = temp_path("round-trip.cswp");
        package.write_to_file(&path).expect("write");

        let back = Package::read_from_file(&path).expect("read");
        assert_eq!(back.function_count(), package.function_count());
        back.validate().expect("round-tripped package validates");
        for i in 0..package.function_count() as u32 {
            let a = package.function_by_index(i).expect("orig");
            let b = back.function_by_index(i).expect("reread");
            assert_eq!(a.name().as_str(), b.name().as_str());
            assert_eq!(a.insts(), b.insts());
            assert_eq!(a.frame_size(), b.frame_size());
            assert_eq!(
                *a.safepoints().expect("orig safepoints"),
                *b.safepoints().expect("reread safepoints")
            );
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn disassembly_reassembles_to_identical_bytes() {
        let source = "function main() { int64 1; int64 1; eq; bif L1; \
                      int64 10; sys println; b L2; L1: int64 20; \
                      sys println; L2: int64 0; sys exit }";
        let package = assemble(source).expect("asm");

        let mut text = Vec::new();
        write_package_asm(&mut text, &package).expect("disassemble");
        let text = String::from_utf8(text).expect("utf8");
        let again = assemble(&text).expect("reassemble");

        let a = package.function_by_index(0).expect("orig");
        let b = again.function_by_index(0).expect("again");
        assert_eq!(a.insts(), b.insts());
    }

    #[test]
    fn function_by_name_misses_cleanly() {
        let package =
            assemble("function main() { int64 0; sys exit }").expect("asm");
        assert!(package.function_by_name("ghost").expect("lookup").is_none());
    }

    #[test]
    fn rejects_truncated_files() {
        let path = temp_path("truncated.cswp");
        std::fs::write(&path, b"CS").expect("write");
        assert!(Package::read_from_file(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
