//! The bytecode interpreter.
//!
//! Dispatches validated stack bytecode over a pooled interpreter stack.
//! Every push and pop is still bounds-checked against the stack buffer, so
//! running a package that skipped validation can produce wrong answers or
//! runtime errors but never unsafety.

use std::fmt;
use std::io::Write;

use tracing::debug;

use bytecode::{read_i32, read_i64, read_u16, read_u32, Op, Sys};
use memory::{stack_pool, Address, Frame, Handle, FRAME_BYTES, WORD_SIZE};
use package::{Function, Package};

/// How a program left the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpreted {
    /// The entry function returned normally.
    Finished,
    /// The program executed `sys exit` with this status.
    Exit(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The entry function takes parameters or returns values.
    InvalidEntry { name: String },
    StackOverflow,
    DivideByZero { offset: usize },
    /// Undecodable instruction or operand underflow; only reachable when
    /// validation was skipped.
    MalformedBytecode { offset: usize },
    /// A callee could not be materialized from the package.
    Load { message: String },
    Io { message: String },
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::InvalidEntry { name } => {
                write!(f, "entry function {name} must take and return nothing")
            }
            RuntimeError::StackOverflow => write!(f, "stack overflow"),
            RuntimeError::DivideByZero { offset } => {
                write!(f, "division by zero at offset {offset}")
            }
            RuntimeError::MalformedBytecode { offset } => {
                write!(f, "malformed bytecode at offset {offset}")
            }
            RuntimeError::Load { message } => {
                write!(f, "cannot load callee: {message}")
            }
            RuntimeError::Io { message } => write!(f, "output failed: {message}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

#[inline(always)]
fn push(
    sp: &mut Address,
    limit: Address,
    value: u64,
) -> Result<(), RuntimeError> {
    if *sp < limit + WORD_SIZE {
        return Err(RuntimeError::StackOverflow);
    }
    *sp -= WORD_SIZE;
    // SAFETY: sp stays inside the stack buffer, checked above.
    unsafe { *(*sp as *mut u64) = value };
    Ok(())
}

#[inline(always)]
fn pop(
    sp: &mut Address,
    start: Address,
    offset: usize,
) -> Result<u64, RuntimeError> {
    if *sp + WORD_SIZE > start {
        return Err(RuntimeError::MalformedBytecode { offset });
    }
    // SAFETY: sp stays inside the stack buffer, checked above.
    let value = unsafe { *(*sp as *const u64) };
    *sp += WORD_SIZE;
    Ok(value)
}

/// Run `entry` (which must take and return nothing) against `package`,
/// writing `sys println` output to `out`.
pub fn interpret(
    package: &Package,
    entry: &Handle<Function>,
    out: &mut dyn Write,
) -> Result<Interpreted, RuntimeError> {
    crate::init();
    if !entry.param_types().is_empty() || !entry.return_types().is_empty() {
        return Err(RuntimeError::InvalidEntry {
            name: entry.name().as_str().to_string(),
        });
    }
    debug!(target: "interpreter", entry = %entry.name().as_str(), "enter");

    let guard = stack_pool().get();
    let stack = guard.stack();
    let start = stack.start();
    let limit = stack.limit();

    stack
        .check(FRAME_BYTES + entry.frame_size() * WORD_SIZE)
        .map_err(|_| RuntimeError::StackOverflow)?;

    // The entry frame: null saved registers mark the bottom of the chain.
    let mut sp = start - FRAME_BYTES;
    let mut fp = sp;
    // SAFETY: the frame region is inside the stack buffer.
    unsafe {
        std::ptr::write(
            fp as *mut Frame,
            Frame {
                saved_fp: 0,
                saved_ip: 0,
                saved_fn: entry.address(),
                saved_pkg: package as *const Package as usize,
            },
        );
    }
    stack.set_fp(fp);
    stack.set_sp(sp);

    let mut fn_addr = entry.address();
    let mut pp: *const Package = package;
    let mut ip: usize = 0;

    loop {
        // SAFETY: fn_addr always holds a live function block (rooted by the
        // package's materialization cache).
        let function = unsafe { &*(fn_addr as *const Function) };
        let insts = function.insts();

        let byte = *insts
            .get(ip)
            .ok_or(RuntimeError::MalformedBytecode { offset: ip })?;
        let op = Op::try_from(byte)
            .map_err(|_| RuntimeError::MalformedBytecode { offset: ip })?;
        if ip + op.size() > insts.len() {
            return Err(RuntimeError::MalformedBytecode { offset: ip });
        }

        match op {
            Op::Nop => {}

            Op::Unit => push(&mut sp, limit, 0)?,
            Op::True => push(&mut sp, limit, 1)?,
            Op::False => push(&mut sp, limit, 0)?,
            Op::Int64 => {
                let n = read_i64(insts, ip + 1).expect("sized");
                push(&mut sp, limit, n as u64)?;
            }

            Op::Neg => {
                let v = pop(&mut sp, start, ip)? as i64;
                push(&mut sp, limit, v.wrapping_neg() as u64)?;
            }
            Op::Not => {
                // Logical negation; keeps booleans canonical 0/1.
                let v = pop(&mut sp, start, ip)?;
                push(&mut sp, limit, (v == 0) as u64)?;
            }

            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::Shl
            | Op::Shr | Op::Asr => {
                let r = pop(&mut sp, start, ip)? as i64;
                let l = pop(&mut sp, start, ip)? as i64;
                let v = match op {
                    Op::Add => l.wrapping_add(r),
                    Op::Sub => l.wrapping_sub(r),
                    Op::Mul => l.wrapping_mul(r),
                    Op::Div => {
                        if r == 0 {
                            return Err(RuntimeError::DivideByZero {
                                offset: ip,
                            });
                        }
                        l.wrapping_div(r)
                    }
                    Op::Mod => {
                        if r == 0 {
                            return Err(RuntimeError::DivideByZero {
                                offset: ip,
                            });
                        }
                        l.wrapping_rem(r)
                    }
                    // Shift amounts are taken modulo 64.
                    Op::Shl => l.wrapping_shl(r as u32),
                    Op::Shr => ((l as u64).wrapping_shr(r as u32)) as i64,
                    Op::Asr => l.wrapping_shr(r as u32),
                    _ => unreachable!(),
                };
                push(&mut sp, limit, v as u64)?;
            }

            Op::And | Op::Or | Op::Xor => {
                let r = pop(&mut sp, start, ip)?;
                let l = pop(&mut sp, start, ip)?;
                let v = match op {
                    Op::And => l & r,
                    Op::Or => l | r,
                    Op::Xor => l ^ r,
                    _ => unreachable!(),
                };
                push(&mut sp, limit, v)?;
            }

            Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let r = pop(&mut sp, start, ip)? as i64;
                let l = pop(&mut sp, start, ip)? as i64;
                let v = match op {
                    Op::Lt => l < r,
                    Op::Le => l <= r,
                    Op::Gt => l > r,
                    Op::Ge => l >= r,
                    _ => unreachable!(),
                };
                push(&mut sp, limit, v as u64)?;
            }

            Op::Eq | Op::Ne => {
                let r = pop(&mut sp, start, ip)?;
                let l = pop(&mut sp, start, ip)?;
                let v = if op == Op::Eq { l == r } else { l != r };
                push(&mut sp, limit, v as u64)?;
            }

            Op::LoadArg | Op::StoreArg => {
                let index =
                    read_u16(insts, ip + 1).expect("sized") as usize;
                let nparams = function.param_types().len();
                if index >= nparams {
                    return Err(RuntimeError::MalformedBytecode {
                        offset: ip,
                    });
                }
                // Argument k sits above the saved registers; the first
                // argument was pushed first and is highest.
                let at = fp + FRAME_BYTES + (nparams - 1 - index) * WORD_SIZE;
                if op == Op::LoadArg {
                    // SAFETY: inside the caller's checked frame.
                    let v = unsafe { *(at as *const u64) };
                    push(&mut sp, limit, v)?;
                } else {
                    let v = pop(&mut sp, start, ip)?;
                    // SAFETY: inside the caller's checked frame.
                    unsafe { *(at as *mut u64) = v };
                }
            }

            Op::LoadLocal | Op::StoreLocal => {
                let index =
                    read_u16(insts, ip + 1).expect("sized") as usize;
                let at = fp - (index + 1) * WORD_SIZE;
                if at < limit || at < sp {
                    return Err(RuntimeError::MalformedBytecode {
                        offset: ip,
                    });
                }
                if op == Op::LoadLocal {
                    // SAFETY: at is inside the live frame, checked above.
                    let v = unsafe { *(at as *const u64) };
                    push(&mut sp, limit, v)?;
                } else {
                    let v = pop(&mut sp, start, ip)?;
                    // SAFETY: at is inside the live frame, checked above.
                    unsafe { *(at as *mut u64) = v };
                }
            }

            Op::Call => {
                let index = read_u32(insts, ip + 1).expect("sized");
                // Commit the registers: materializing the callee can
                // allocate and therefore collect.
                stack.set_fp(fp);
                stack.set_sp(sp);
                // SAFETY: pp always points at the caller-owned package.
                let callee = unsafe { &*pp }
                    .function_by_index(index)
                    .map_err(|e| RuntimeError::Load {
                        message: e.to_string(),
                    })?;
                let callee_addr = callee.address();
                // SAFETY: callee is a live function block.
                let callee_fn = unsafe { &*(callee_addr as *const Function) };
                stack
                    .check(FRAME_BYTES + callee_fn.frame_size() * WORD_SIZE)
                    .map_err(|_| RuntimeError::StackOverflow)?;

                let nsp = sp - FRAME_BYTES;
                // SAFETY: the frame region is inside the stack buffer.
                unsafe {
                    std::ptr::write(
                        nsp as *mut Frame,
                        Frame {
                            saved_fp: fp,
                            saved_ip: ip + op.size(),
                            saved_fn: fn_addr,
                            saved_pkg: pp as usize,
                        },
                    );
                }
                fp = nsp;
                sp = nsp;
                fn_addr = callee_addr;
                ip = 0;
                stack.set_fp(fp);
                stack.set_sp(sp);
                continue;
            }

            Op::Ret => {
                let return_bytes = function.return_slot_size() * WORD_SIZE;
                // SAFETY: fp points at the frame this function was entered
                // with.
                let frame = unsafe { stack.frame_at(fp) };
                let dest = fp + FRAME_BYTES
                    + function.param_slot_size() * WORD_SIZE
                    - return_bytes;
                // SAFETY: both ranges lie inside the stack buffer; the
                // destination overwrites the consumed arguments and frame.
                unsafe {
                    std::ptr::copy(
                        sp as *const u8,
                        dest as *mut u8,
                        return_bytes,
                    );
                }
                sp = dest;
                fp = frame.saved_fp;
                if frame.saved_ip == 0 {
                    return Ok(Interpreted::Finished);
                }
                ip = frame.saved_ip;
                fn_addr = frame.saved_fn;
                pp = frame.saved_pkg as *const Package;
                stack.set_fp(fp);
                stack.set_sp(sp);
                continue;
            }

            Op::B => {
                let rel = read_i32(insts, ip + 1).expect("sized");
                let target = ip as i64 + rel as i64;
                if target < 0 || target >= insts.len() as i64 {
                    return Err(RuntimeError::MalformedBytecode {
                        offset: ip,
                    });
                }
                ip = target as usize;
                continue;
            }

            Op::Bif => {
                let condition = pop(&mut sp, start, ip)?;
                if condition != 0 {
                    let rel = read_i32(insts, ip + 1).expect("sized");
                    let target = ip as i64 + rel as i64;
                    if target < 0 || target >= insts.len() as i64 {
                        return Err(RuntimeError::MalformedBytecode {
                            offset: ip,
                        });
                    }
                    ip = target as usize;
                    continue;
                }
            }

            Op::Sys => {
                let code = insts[ip + 1];
                match Sys::try_from(code) {
                    Ok(Sys::Exit) => {
                        let status = pop(&mut sp, start, ip)? as i64;
                        debug!(target: "interpreter", status, "sys exit");
                        return Ok(Interpreted::Exit(status));
                    }
                    Ok(Sys::Println) => {
                        let value = pop(&mut sp, start, ip)? as i64;
                        writeln!(out, "{value}").map_err(|e| {
                            RuntimeError::Io {
                                message: e.to_string(),
                            }
                        })?;
                    }
                    Err(_) => {
                        return Err(RuntimeError::MalformedBytecode {
                            offset: ip,
                        });
                    }
                }
            }
        }

        ip += op.size();
    }
}
