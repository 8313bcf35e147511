//! The opcode model and instruction assembler shared by the package
//! loader, the verifier, and the interpreter.

mod builder;
mod decoder;
mod op;

pub use builder::{AssembleError, Assembler, Label};
pub use decoder::{
    read_i32, read_i32_unchecked, read_i64, read_i64_unchecked, read_u16,
    read_u16_unchecked, read_u32, read_u32_unchecked, InstIter,
};
pub use op::{Op, Sys, MAX_FUNCTION_SIZE};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_byte_ops_round_trip() {
        let mut a = Assembler::new();
        a.int64(2);
        a.int64(3);
        a.add();
        a.sys(Sys::Println);
        a.int64(0);
        a.sys(Sys::Exit);
        let bytes = a.finish().expect("assemble");

        let ops: Vec<_> = InstIter::new(&bytes).map(|(_, op)| op).collect();
        assert_eq!(
            ops,
            vec![Op::Int64, Op::Int64, Op::Add, Op::Sys, Op::Int64, Op::Sys]
        );
        assert_eq!(read_i64(&bytes, 1), Some(2));
        assert_eq!(read_i64(&bytes, 10), Some(3));
        assert_eq!(bytes[20], Sys::Println as u8);
    }

    #[test]
    fn forward_branch_is_patched_on_bind() {
        let mut a = Assembler::new();
        let l = a.new_label();
        a.true_();
        a.bif(l); // at offset 1
        a.int64(10); // at offset 6
        a.bind(l); // at offset 15
        a.ret();
        let bytes = a.finish().expect("assemble");

        // Offset is measured from the bif opcode byte.
        assert_eq!(read_i32(&bytes, 2), Some(15 - 1));
    }

    #[test]
    fn backward_branch_uses_bound_offset() {
        let mut a = Assembler::new();
        let top = a.new_label();
        a.bind(top); // offset 0
        a.nop();
        a.b(top); // at offset 1
        let bytes = a.finish().expect("assemble");
        assert_eq!(read_i32(&bytes, 2), Some(0 - 1));
    }

    #[test]
    fn one_label_patches_every_use() {
        let mut a = Assembler::new();
        let l = a.new_label();
        a.b(l); // offset 0
        a.b(l); // offset 5
        a.b(l); // offset 10
        a.bind(l); // offset 15
        let bytes = a.finish().expect("assemble");

        assert_eq!(read_i32(&bytes, 1), Some(15));
        assert_eq!(read_i32(&bytes, 6), Some(10));
        assert_eq!(read_i32(&bytes, 11), Some(5));
    }

    #[test]
    fn branch_target_lands_on_labeled_instruction() {
        // Property: after patching, opcode offset + encoded delta equals the
        // labeled instruction's offset.
        let mut a = Assembler::new();
        let l1 = a.new_label();
        let l2 = a.new_label();
        a.int64(1); // 0
        a.bif(l1); // 9
        a.int64(10); // 14
        a.b(l2); // 23
        a.bind(l1); // 28
        a.int64(20); // 28
        a.bind(l2); // 37
        a.ret(); // 37
        let bytes = a.finish().expect("assemble");

        assert_eq!(9 + read_i32(&bytes, 10).unwrap(), 28);
        assert_eq!(23 + read_i32(&bytes, 24).unwrap(), 37);
    }

    #[test]
    fn unbound_used_label_is_an_error() {
        let mut a = Assembler::new();
        let l = a.new_label();
        a.b(l);
        assert_eq!(a.finish(), Err(AssembleError::UnboundLabel));
    }

    #[test]
    fn unused_unbound_label_is_fine() {
        let mut a = Assembler::new();
        let _ = a.new_label();
        a.ret();
        assert!(a.finish().is_ok());
    }
}
