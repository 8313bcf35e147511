//! End-to-end scenarios: assemble text, validate, interpret, and check the
//! produced output and exit status.

use package::{read_package_asm, write_package_asm, Error, Package};
use vm::{interpret, Interpreted, RuntimeError};

fn assemble(source: &str) -> Package {
    read_package_asm("e2e.csws", &mut source.as_bytes()).expect("assembles")
}

fn run(source: &str) -> (String, Interpreted) {
    let package = assemble(source);
    package.validate().expect("validates");
    let entry = package
        .function_by_name("main")
        .expect("lookup")
        .expect("main exists");
    let mut out = Vec::new();
    let result = interpret(&package, &entry, &mut out).expect("interprets");
    (String::from_utf8(out).expect("utf8 output"), result)
}

#[test]
fn identity_exit() {
    let (out, result) = run("function main() { int64 0; sys exit }");
    assert_eq!(out, "");
    assert_eq!(result, Interpreted::Exit(0));
}

#[test]
fn arithmetic_and_print() {
    let (out, result) = run(
        "function main() { int64 2; int64 3; add; sys println; int64 0; \
         sys exit }",
    );
    assert_eq!(out, "5\n");
    assert_eq!(result, Interpreted::Exit(0));
}

#[test]
fn conditional_branch() {
    let (out, result) = run(
        "function main() { int64 1; int64 1; eq; bif L1; int64 10; \
         sys println; b L2; L1: int64 20; sys println; L2: int64 0; \
         sys exit }",
    );
    assert_eq!(out, "20\n");
    assert_eq!(result, Interpreted::Exit(0));
}

#[test]
fn branch_not_taken() {
    let (out, _) = run(
        "function main() { int64 1; int64 2; eq; bif L1; int64 10; \
         sys println; b L2; L1: int64 20; sys println; L2: int64 0; \
         sys exit }",
    );
    assert_eq!(out, "10\n");
}

#[test]
fn call_with_arguments() {
    let (out, _) = run(
        "function add(int64, int64) -> (int64) { loadarg 0; loadarg 1; \
         add; ret }\n\
         function main() { int64 7; int64 8; call add; sys println; \
         int64 0; sys exit }",
    );
    assert_eq!(out, "15\n");
}

#[test]
fn verifier_rejects_arity_error() {
    let package = assemble("function main() { int64 1; add; ret }");
    match package.validate().unwrap_err() {
        Error::Validate(e) => {
            assert_eq!(e.def_name, "main");
            assert!(e.message.contains("at offset 9"), "{}", e.message);
        }
        other => panic!("expected validate error, got {other}"),
    }
}

#[test]
fn binary_round_trip_preserves_instruction_bytes() {
    let source = "function add(int64, int64) -> (int64) { loadarg 0; \
                  loadarg 1; add; ret }\n\
                  function main() { int64 7; int64 8; call add; \
                  sys println; int64 0; sys exit }";
    let first = assemble(source);

    let mut path = std::env::temp_dir();
    path.push(format!("cswp-e2e-{}.cswp", std::process::id()));
    first.write_to_file(&path).expect("write binary");
    let reread = Package::read_from_file(&path).expect("reread binary");

    let mut text = Vec::new();
    write_package_asm(&mut text, &reread).expect("disassemble");
    let text = String::from_utf8(text).expect("utf8");
    let second = assemble(&text);

    assert_eq!(first.function_count(), second.function_count());
    for i in 0..first.function_count() as u32 {
        let a = first.function_by_index(i).expect("first");
        let b = second.function_by_index(i).expect("second");
        assert_eq!(a.insts(), b.insts(), "function {i} bytes differ");
    }
    std::fs::remove_file(&path).ok();

    // The re-read package still runs.
    let entry = reread.function_by_name("main").unwrap().unwrap();
    let mut out = Vec::new();
    let result = interpret(&reread, &entry, &mut out).expect("interprets");
    assert_eq!(out, b"15\n");
    assert_eq!(result, Interpreted::Exit(0));
}

#[test]
fn locals_and_argument_stores() {
    // Locals are stack slots below the frame; storelocal overwrites one.
    let (out, _) = run(
        "function main() { int64 5; int64 6; storelocal 0; loadlocal 0; \
         sys println; int64 0; sys exit }",
    );
    assert_eq!(out, "6\n");
}

#[test]
fn storearg_updates_callee_view() {
    let (out, _) = run(
        "function f(int64) -> (int64) { int64 42; storearg 0; loadarg 0; \
         ret }\n\
         function main() { int64 1; call f; sys println; int64 0; \
         sys exit }",
    );
    assert_eq!(out, "42\n");
}

#[test]
fn loop_counts_down() {
    // while (n != 0) { println n; n = n - 1 }
    let (out, _) = run(
        "function main() { int64 3; b L2; L1: loadlocal 0; sys println; \
         loadlocal 0; int64 1; sub; storelocal 0; L2: loadlocal 0; \
         int64 0; ne; bif L1; int64 0; sys exit }",
    );
    assert_eq!(out, "3\n2\n1\n");
}

#[test]
fn comparisons_and_booleans() {
    let (out, _) = run(
        "function main() { int64 3; int64 4; lt; bif L1; int64 0; \
         sys println; b L2; L1: int64 1; sys println; L2: int64 0; \
         sys exit }",
    );
    assert_eq!(out, "1\n");
}

#[test]
fn division_by_zero_traps() {
    let package = assemble(
        "function main() { int64 1; int64 0; div; sys println; int64 0; \
         sys exit }",
    );
    package.validate().expect("validates");
    let entry = package.function_by_name("main").unwrap().unwrap();
    let mut out = Vec::new();
    let err = interpret(&package, &entry, &mut out).unwrap_err();
    assert!(matches!(err, RuntimeError::DivideByZero { .. }), "{err}");
}

#[test]
fn unbounded_recursion_overflows_the_stack() {
    let package = assemble(
        "function f() { call f; ret }\n\
         function main() { call f; int64 0; sys exit }",
    );
    package.validate().expect("validates");
    let entry = package.function_by_name("main").unwrap().unwrap();
    let mut out = Vec::new();
    let err = interpret(&package, &entry, &mut out).unwrap_err();
    assert_eq!(err, RuntimeError::StackOverflow);
}

#[test]
fn entry_with_parameters_is_rejected() {
    let package = assemble(
        "function main(int64) { ret }\n\
         function other() { int64 0; sys exit }",
    );
    let entry = package.function_by_name("main").unwrap().unwrap();
    let mut out = Vec::new();
    let err = interpret(&package, &entry, &mut out).unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidEntry { .. }), "{err}");
}

#[test]
fn multiple_return_values() {
    let (out, _) = run(
        "function two() -> (int64, int64) { int64 31; int64 11; ret }\n\
         function main() { call two; sub; sys println; int64 0; sys exit }",
    );
    assert_eq!(out, "20\n");
}

#[test]
fn negation_and_bitwise_ops() {
    let (out, _) = run(
        "function main() { int64 6; int64 3; and; neg; sys println; \
         int64 0; sys exit }",
    );
    assert_eq!(out, "-2\n");
}
