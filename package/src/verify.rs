//! The bytecode verifier and safepoint builder.
//!
//! A forward abstract interpretation over the function's control-flow
//! graph, carrying an abstract operand stack of type kinds. Branches
//! discover successor blocks as they are encountered; merging into a known
//! block requires the abstract stack to match it exactly. The same walk
//! records the PC after every CALL and every allocating system call, which
//! becomes the function's safepoint table.

use bytecode::{read_i32, read_u16, read_u32, Op, Sys};
use memory::Handle;

use crate::error::ValidateError;
use crate::function::Function;
use crate::package::Package;
use crate::safepoints::Safepoints;
use crate::types::TypeKind;

/// One discovered block: `begin`/`end` byte offsets and the abstract stack
/// at entry. Blocks are uniqued and kept sorted by `begin`; `end` stays 0
/// until the block has been visited.
struct Block {
    begin: usize,
    end: usize,
    types: Vec<TypeKind>,
}

struct Verifier<'a> {
    name: &'a str,
    insts: &'a [u8],
    blocks: Vec<Block>,
    worklist: Vec<usize>,
    max_frame: usize,
    safepoint_pcs: Vec<u32>,
}

/// Verify `function` and build its safepoint table from scratch.
pub fn build_safepoints(
    function: &Function,
    package: &Package,
) -> Result<Handle<Safepoints>, ValidateError> {
    let name = function.name().as_str();
    let mut v = Verifier {
        name,
        insts: function.insts(),
        blocks: vec![Block {
            begin: 0,
            end: 0,
            types: Vec::new(),
        }],
        worklist: vec![0],
        max_frame: 0,
        safepoint_pcs: Vec::new(),
    };

    while let Some(begin) = v.worklist.pop() {
        v.visit_block(begin, function, package)?;
    }
    v.check_tiling()?;

    if v.max_frame > u16::MAX as usize {
        return Err(v.error(0, "frame size overflows 16 bits".to_string()));
    }
    v.safepoint_pcs.sort_unstable();
    v.safepoint_pcs.dedup();
    Safepoints::create(v.max_frame as u16, &v.safepoint_pcs).map_err(|e| {
        ValidateError::new(name, format!("building safepoints failed: {e}"))
    })
}

impl<'a> Verifier<'a> {
    fn error(&self, offset: usize, message: String) -> ValidateError {
        ValidateError::new(self.name, format!("at offset {offset}, {message}"))
    }

    fn block_index(&self, begin: usize) -> Option<usize> {
        self.blocks.binary_search_by_key(&begin, |b| b.begin).ok()
    }

    /// Require at least `nops` operands and operand `i` (from the top) to
    /// have kind `want`.
    fn check_type(
        &self,
        offset: usize,
        op: Op,
        types: &[TypeKind],
        want: TypeKind,
        i: usize,
        nops: usize,
    ) -> Result<(), ValidateError> {
        if types.len() < nops {
            return Err(self.error(
                offset,
                format!(
                    "{} instruction needs {} operand(s) on the stack",
                    op.mnemonic(),
                    nops
                ),
            ));
        }
        let got = types[types.len() - i - 1];
        if got != want {
            return Err(self.error(
                offset,
                format!(
                    "{} instruction expects operand {} to have type {} but \
                     found {}",
                    op.mnemonic(),
                    i,
                    want,
                    got
                ),
            ));
        }
        Ok(())
    }

    /// Record a branch from the instruction at `offset` to `offset + rel`:
    /// bounds-check the target and merge into it.
    fn check_branch(
        &mut self,
        offset: usize,
        op: Op,
        rel: i32,
        types: Vec<TypeKind>,
    ) -> Result<(), ValidateError> {
        let target = offset as i64 + rel as i64;
        if target < 0 || target >= self.insts.len() as i64 {
            return Err(self.error(
                offset,
                format!(
                    "instruction {} has target offset {} out of range",
                    op.mnemonic(),
                    rel
                ),
            ));
        }
        self.merge(offset, target as usize, types)
    }

    /// Merge an edge into the block at `target`: discover a new block or
    /// require an exact match with a known one. `offset` is only used for
    /// error reporting.
    fn merge(
        &mut self,
        offset: usize,
        target: usize,
        types: Vec<TypeKind>,
    ) -> Result<(), ValidateError> {
        match self.blocks.binary_search_by_key(&target, |b| b.begin) {
            Err(insert_at) => {
                // A previously visited block may already have walked
                // straight through the new boundary; re-walk it so it stops
                // there with a fall-through merge.
                if insert_at > 0 {
                    let prev = &mut self.blocks[insert_at - 1];
                    if prev.end > target {
                        prev.end = 0;
                        let begin = prev.begin;
                        self.worklist.push(begin);
                    }
                }
                self.blocks.insert(
                    insert_at,
                    Block {
                        begin: target,
                        end: 0,
                        types,
                    },
                );
                self.worklist.push(target);
            }
            Ok(found) => {
                let known = &self.blocks[found];
                if known.types.len() != types.len() {
                    return Err(self.error(
                        offset,
                        format!(
                            "branch to block at {} with stack depth {} but \
                             another branch to the same block has stack \
                             depth {}",
                            target,
                            types.len(),
                            known.types.len()
                        ),
                    ));
                }
                for (i, (&have, &want)) in
                    types.iter().zip(known.types.iter()).enumerate()
                {
                    if have != want {
                        return Err(self.error(
                            offset,
                            format!(
                                "branch to block at {} with type {} in stack \
                                 slot {} but another branch to the same \
                                 block has type {}",
                                target,
                                have,
                                types.len() - i - 1,
                                want
                            ),
                        ));
                    }
                }
                if known.end == 0 {
                    self.worklist.push(target);
                }
            }
        }
        Ok(())
    }

    fn set_block_end(&mut self, begin: usize, end: usize) {
        let idx = self.block_index(begin).expect("visited block exists");
        self.blocks[idx].end = end;
    }

    fn push(
        &mut self,
        offset: usize,
        types: &mut Vec<TypeKind>,
        kind: TypeKind,
    ) -> Result<(), ValidateError> {
        if types.len() >= u16::MAX as usize {
            return Err(
                self.error(offset, "frame size overflows 16 bits".to_string())
            );
        }
        types.push(kind);
        self.max_frame = self.max_frame.max(types.len());
        Ok(())
    }

    fn visit_block(
        &mut self,
        begin: usize,
        function: &Function,
        package: &Package,
    ) -> Result<(), ValidateError> {
        let idx = self.block_index(begin).expect("worklist entries exist");
        if self.blocks[idx].end > 0 {
            return Ok(());
        }
        let mut types = self.blocks[idx].types.clone();
        self.max_frame = self.max_frame.max(types.len());

        let mut offset = begin;
        loop {
            // Straight-line code can fall into the start of a discovered
            // block; end this block there and treat it as a merge edge.
            if offset != begin && self.block_index(offset).is_some() {
                self.set_block_end(begin, offset);
                return self.merge(offset, offset, types);
            }
            if offset >= self.insts.len() {
                return Err(self.error(
                    offset,
                    "function runs off the end without a terminator"
                        .to_string(),
                ));
            }
            let op = Op::try_from(self.insts[offset]).map_err(|byte| {
                self.error(offset, format!("unknown opcode {byte:#04x}"))
            })?;
            if offset + op.size() > self.insts.len() {
                return Err(
                    self.error(offset, "truncated instruction".to_string())
                );
            }
            let next = offset + op.size();

            match op {
                Op::Nop => {}

                Op::Neg => {
                    self.check_type(
                        offset,
                        op,
                        &types,
                        TypeKind::Int64,
                        0,
                        1,
                    )?;
                }

                Op::Not => {
                    let want = match types.last() {
                        Some(TypeKind::Int64) => TypeKind::Int64,
                        _ => TypeKind::Bool,
                    };
                    self.check_type(offset, op, &types, want, 0, 1)?;
                }

                Op::Add
                | Op::Sub
                | Op::Mul
                | Op::Div
                | Op::Mod
                | Op::Shl
                | Op::Shr
                | Op::Asr => {
                    self.check_type(
                        offset,
                        op,
                        &types,
                        TypeKind::Int64,
                        0,
                        2,
                    )?;
                    self.check_type(
                        offset,
                        op,
                        &types,
                        TypeKind::Int64,
                        1,
                        2,
                    )?;
                    types.pop();
                }

                Op::And | Op::Or | Op::Xor => {
                    let want = match types.last() {
                        Some(TypeKind::Bool) => TypeKind::Bool,
                        _ => TypeKind::Int64,
                    };
                    self.check_type(offset, op, &types, want, 0, 2)?;
                    self.check_type(offset, op, &types, want, 1, 2)?;
                    types.pop();
                }

                Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                    self.check_type(
                        offset,
                        op,
                        &types,
                        TypeKind::Int64,
                        0,
                        2,
                    )?;
                    self.check_type(
                        offset,
                        op,
                        &types,
                        TypeKind::Int64,
                        1,
                        2,
                    )?;
                    types.pop();
                    types.pop();
                    self.push(offset, &mut types, TypeKind::Bool)?;
                }

                Op::Eq | Op::Ne => {
                    if types.len() < 2 {
                        return Err(self.error(
                            offset,
                            format!(
                                "{} needs 2 operands on the stack",
                                op.mnemonic()
                            ),
                        ));
                    }
                    let r = types[types.len() - 1];
                    let l = types[types.len() - 2];
                    if l != r {
                        return Err(self.error(
                            offset,
                            format!(
                                "{} instruction requires two operands of the \
                                 same type; got {} and {}",
                                op.mnemonic(),
                                l,
                                r
                            ),
                        ));
                    }
                    types.pop();
                    types.pop();
                    self.push(offset, &mut types, TypeKind::Bool)?;
                }

                Op::Unit => self.push(offset, &mut types, TypeKind::Unit)?,
                Op::True | Op::False => {
                    self.push(offset, &mut types, TypeKind::Bool)?
                }
                Op::Int64 => {
                    self.push(offset, &mut types, TypeKind::Int64)?;
                }

                Op::LoadArg => {
                    let index =
                        read_u16(self.insts, offset + 1).expect("sized") as usize;
                    if index >= function.param_types().len() {
                        return Err(self.error(
                            offset,
                            format!(
                                "{} instruction loads argument {} but there \
                                 are {} parameter(s)",
                                op.mnemonic(),
                                index,
                                function.param_types().len()
                            ),
                        ));
                    }
                    let kind = function.param_kind(index);
                    self.push(offset, &mut types, kind)?;
                }

                Op::StoreArg => {
                    let index =
                        read_u16(self.insts, offset + 1).expect("sized") as usize;
                    if types.is_empty() {
                        return Err(self.error(
                            offset,
                            format!(
                                "{} instruction with empty stack",
                                op.mnemonic()
                            ),
                        ));
                    }
                    let kind = types.pop().expect("nonempty");
                    if index >= function.param_types().len() {
                        return Err(self.error(
                            offset,
                            format!(
                                "{} instruction stores argument {} but there \
                                 are {} parameter(s)",
                                op.mnemonic(),
                                index,
                                function.param_types().len()
                            ),
                        ));
                    }
                    let want = function.param_kind(index);
                    if want != kind {
                        return Err(self.error(
                            offset,
                            format!(
                                "{} instruction stores argument {} with type \
                                 {} but operand has type {}",
                                op.mnemonic(),
                                index,
                                want,
                                kind
                            ),
                        ));
                    }
                }

                Op::LoadLocal => {
                    let index =
                        read_u16(self.insts, offset + 1).expect("sized") as usize;
                    if index >= types.len() {
                        return Err(self.error(
                            offset,
                            format!(
                                "{} instruction loads local {} but there are \
                                 {} locals",
                                op.mnemonic(),
                                index,
                                types.len()
                            ),
                        ));
                    }
                    let kind = types[index];
                    self.push(offset, &mut types, kind)?;
                }

                Op::StoreLocal => {
                    let index =
                        read_u16(self.insts, offset + 1).expect("sized") as usize;
                    if types.is_empty() {
                        return Err(self.error(
                            offset,
                            format!(
                                "{} instruction with empty stack",
                                op.mnemonic()
                            ),
                        ));
                    }
                    if index >= types.len() - 1 {
                        return Err(self.error(
                            offset,
                            format!(
                                "{} instruction stores local {} but there \
                                 are {} locals",
                                op.mnemonic(),
                                index,
                                types.len() - 1
                            ),
                        ));
                    }
                    let kind = types.pop().expect("nonempty");
                    types[index] = kind;
                }

                Op::Call => {
                    let index = read_u32(self.insts, offset + 1)
                        .expect("sized");
                    if index as usize >= package.function_count() {
                        return Err(self.error(
                            offset,
                            format!(
                                "{} instruction has invalid function index {}",
                                op.mnemonic(),
                                index
                            ),
                        ));
                    }
                    let callee =
                        package.function_by_index(index).map_err(|e| {
                            self.error(
                                offset,
                                format!("callee {index} cannot be loaded: {e}"),
                            )
                        })?;
                    let nparams = callee.param_types().len();
                    for i in 0..nparams {
                        self.check_type(
                            offset,
                            op,
                            &types,
                            callee.param_kind(i),
                            nparams - i - 1,
                            nparams,
                        )?;
                    }
                    types.truncate(types.len() - nparams);
                    for i in 0..callee.return_types().len() {
                        let kind = callee.return_kind(i);
                        self.push(offset, &mut types, kind)?;
                    }
                    self.safepoint_pcs.push(next as u32);
                }

                Op::B => {
                    self.set_block_end(begin, next);
                    let rel = read_i32(self.insts, offset + 1).expect("sized");
                    self.check_branch(offset, op, rel, types)?;
                    return Ok(());
                }

                Op::Bif => {
                    self.check_type(offset, op, &types, TypeKind::Bool, 0, 1)?;
                    types.pop();
                    self.set_block_end(begin, next);
                    let rel = read_i32(self.insts, offset + 1).expect("sized");
                    let fall_through = types.clone();
                    self.check_branch(offset, op, rel, types)?;
                    self.check_branch(
                        offset,
                        op,
                        op.size() as i32,
                        fall_through,
                    )?;
                    return Ok(());
                }

                Op::Ret => {
                    let nreturns = function.return_types().len();
                    for i in 0..nreturns {
                        self.check_type(
                            offset,
                            op,
                            &types,
                            function.return_kind(i),
                            nreturns - i - 1,
                            nreturns,
                        )?;
                    }
                    self.set_block_end(begin, next);
                    return Ok(());
                }

                Op::Sys => {
                    let code = self.insts[offset + 1];
                    match Sys::try_from(code) {
                        Ok(Sys::Exit) => {
                            self.check_type(
                                offset,
                                op,
                                &types,
                                TypeKind::Int64,
                                0,
                                1,
                            )?;
                            types.pop();
                            self.set_block_end(begin, next);
                            return Ok(());
                        }
                        Ok(Sys::Println) => {
                            self.check_type(
                                offset,
                                op,
                                &types,
                                TypeKind::Int64,
                                0,
                                1,
                            )?;
                            types.pop();
                            self.safepoint_pcs.push(next as u32);
                        }
                        Err(_) => {
                            return Err(self.error(
                                offset,
                                format!(
                                    "{} instruction with unknown system \
                                     function {}",
                                    op.mnemonic(),
                                    code
                                ),
                            ));
                        }
                    }
                }
            }

            offset = next;
        }
    }

    /// After the worklist drains, the visited blocks must tile
    /// `[0, insts.len())` with no gaps.
    fn check_tiling(&self) -> Result<(), ValidateError> {
        let mut prev_end = 0;
        for block in &self.blocks {
            if block.begin != prev_end {
                return Err(ValidateError::new(
                    self.name,
                    format!(
                        "block starting at {} does not start immediately \
                         after previous block",
                        block.begin
                    ),
                ));
            }
            prev_end = block.end;
        }
        if prev_end != self.insts.len() {
            return Err(ValidateError::new(
                self.name,
                format!("unreachable code at offset {prev_end}"),
            ));
        }
        Ok(())
    }
}
