//! Assembles instruction bytes into a growable buffer.
//!
//! Branches reference [`Label`]s. A bound label knows its absolute offset;
//! an unbound label threads a linked list of use sites through the emitted
//! offset immediates, which [`bind`](Assembler::bind) walks and patches.
//! Branch offsets are measured from the branch opcode byte.

use crate::op::{Op, Sys, MAX_FUNCTION_SIZE};

/// Index of a label created by [`Assembler::new_label`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy)]
struct LabelState {
    bound: bool,
    /// Bound: the absolute offset the label refers to. Unbound: the offset
    /// of the most recent use's immediate, 0 if never used.
    offset: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssembleError {
    FunctionTooLarge,
    UnboundLabel,
}

impl std::fmt::Display for AssembleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssembleError::FunctionTooLarge => {
                write!(f, "maximum function size exceeded")
            }
            AssembleError::UnboundLabel => write!(f, "use of unbound label"),
        }
    }
}

impl std::error::Error for AssembleError {}

pub struct Assembler {
    buf: Vec<u8>,
    labels: Vec<LabelState>,
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            labels: Vec::new(),
        }
    }

    /// Current byte offset in the instruction stream.
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(LabelState {
            bound: false,
            offset: 0,
        });
        Label(self.labels.len() - 1)
    }

    /// Whether `label` has been bound to an offset yet.
    pub fn is_bound(&self, label: Label) -> bool {
        self.labels[label.0].bound
    }

    /// Bind `label` to the current offset, patching every earlier use.
    pub fn bind(&mut self, label: Label) {
        let state = &mut self.labels[label.0];
        debug_assert!(!state.bound, "label bound twice");
        let label_offset = self.buf.len() as i32;
        let mut use_offset = state.offset;
        state.bound = true;
        state.offset = label_offset;
        while use_offset != 0 {
            let at = use_offset as usize;
            let next = i32::from_le_bytes(
                self.buf[at..at + 4].try_into().expect("use site in buffer"),
            );
            let inst_offset = use_offset - 1;
            self.buf[at..at + 4]
                .copy_from_slice(&(label_offset - inst_offset).to_le_bytes());
            use_offset = next;
        }
    }

    /// Take the finished bytes, failing if a used label was never bound or
    /// the function outgrew the 32-bit branch range.
    pub fn finish(self) -> Result<Vec<u8>, AssembleError> {
        if self.buf.len() > MAX_FUNCTION_SIZE {
            return Err(AssembleError::FunctionTooLarge);
        }
        for label in &self.labels {
            if !label.bound && label.offset != 0 {
                return Err(AssembleError::UnboundLabel);
            }
        }
        Ok(self.buf)
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn op(&mut self, op: Op) {
        self.buf.push(op as u8);
    }

    fn op1_8(&mut self, op: Op, a: u8) {
        self.buf.push(op as u8);
        self.buf.push(a);
    }

    fn op1_16(&mut self, op: Op, a: u16) {
        self.buf.push(op as u8);
        self.buf.extend_from_slice(&a.to_le_bytes());
    }

    fn op1_32(&mut self, op: Op, a: u32) {
        self.buf.push(op as u8);
        self.buf.extend_from_slice(&a.to_le_bytes());
    }

    fn op1_64(&mut self, op: Op, a: u64) {
        self.buf.push(op as u8);
        self.buf.extend_from_slice(&a.to_le_bytes());
    }

    fn op1_label(&mut self, op: Op, label: Label) {
        let inst_offset = self.buf.len() as i32;
        self.buf.push(op as u8);
        let state = &mut self.labels[label.0];
        if state.bound {
            // Bound: emit the final relative offset directly.
            self.buf
                .extend_from_slice(&(state.offset - inst_offset).to_le_bytes());
        } else {
            // Unbound: emit the previous use site (linked list) and record
            // this immediate as the new list head.
            self.buf.extend_from_slice(&state.offset.to_le_bytes());
            state.offset = inst_offset + 1;
        }
    }

    // ── instructions ───────────────────────────────────────────────

    pub fn add(&mut self) {
        self.op(Op::Add);
    }

    pub fn and_(&mut self) {
        self.op(Op::And);
    }

    pub fn asr(&mut self) {
        self.op(Op::Asr);
    }

    pub fn b(&mut self, label: Label) {
        self.op1_label(Op::B, label);
    }

    pub fn bif(&mut self, label: Label) {
        self.op1_label(Op::Bif, label);
    }

    pub fn call(&mut self, index: u32) {
        self.op1_32(Op::Call, index);
    }

    pub fn div(&mut self) {
        self.op(Op::Div);
    }

    pub fn eq(&mut self) {
        self.op(Op::Eq);
    }

    pub fn false_(&mut self) {
        self.op(Op::False);
    }

    pub fn ge(&mut self) {
        self.op(Op::Ge);
    }

    pub fn gt(&mut self) {
        self.op(Op::Gt);
    }

    pub fn int64(&mut self, n: i64) {
        self.op1_64(Op::Int64, n as u64);
    }

    pub fn le(&mut self) {
        self.op(Op::Le);
    }

    pub fn loadarg(&mut self, slot: u16) {
        self.op1_16(Op::LoadArg, slot);
    }

    pub fn loadlocal(&mut self, slot: u16) {
        self.op1_16(Op::LoadLocal, slot);
    }

    pub fn lt(&mut self) {
        self.op(Op::Lt);
    }

    pub fn mod_(&mut self) {
        self.op(Op::Mod);
    }

    pub fn mul(&mut self) {
        self.op(Op::Mul);
    }

    pub fn ne(&mut self) {
        self.op(Op::Ne);
    }

    pub fn neg(&mut self) {
        self.op(Op::Neg);
    }

    pub fn nop(&mut self) {
        self.op(Op::Nop);
    }

    pub fn not_(&mut self) {
        self.op(Op::Not);
    }

    pub fn or_(&mut self) {
        self.op(Op::Or);
    }

    pub fn ret(&mut self) {
        self.op(Op::Ret);
    }

    pub fn shl(&mut self) {
        self.op(Op::Shl);
    }

    pub fn shr(&mut self) {
        self.op(Op::Shr);
    }

    pub fn storearg(&mut self, slot: u16) {
        self.op1_16(Op::StoreArg, slot);
    }

    pub fn storelocal(&mut self, slot: u16) {
        self.op1_16(Op::StoreLocal, slot);
    }

    pub fn sub(&mut self) {
        self.op(Op::Sub);
    }

    pub fn sys(&mut self, sys: Sys) {
        self.op1_8(Op::Sys, sys as u8);
    }

    pub fn true_(&mut self) {
        self.op(Op::True);
    }

    pub fn unit(&mut self) {
        self.op(Op::Unit);
    }

    pub fn xor_(&mut self) {
        self.op(Op::Xor);
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}
