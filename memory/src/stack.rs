//! Fixed-size interpreter stacks and the process-wide stack pool.
//!
//! `sp` and `fp` grow downward from the high end. A frame starts at `fp`
//! with the four saved registers; argument words sit above it and locals
//! and temporaries below. The pool is a root acceptor: for every in-use
//! stack it walks the frame chain, visiting each frame's function and
//! package words, and consults the per-safepoint pointer bitmaps through a
//! visitor installed by the VM layer (this crate knows nothing about
//! function objects, the same way the corpus heaps stay VM-agnostic behind
//! trace callbacks).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Once;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::StackOverflowError;
use crate::heap::{heap, Address, RootAcceptor};

/// Stack capacity in bytes.
pub const STACK_SIZE: usize = 64 * 1024;

/// Saved registers at the start of every frame.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub saved_fp: Address,
    pub saved_ip: Address,
    pub saved_fn: Address,
    pub saved_pkg: Address,
}

/// Bytes occupied by the saved registers.
pub const FRAME_BYTES: usize = std::mem::size_of::<Frame>();

/// Visits the live pointer slots of one frame, given the frame's function
/// block, the PC at which the frame is suspended, and its `fp`.
///
/// # Safety contract
///
/// Only called with `fn_addr` values previously stored by the interpreter,
/// i.e. live function blocks.
pub type SafepointVisitor =
    unsafe fn(fn_addr: Address, ip: Address, fp: Address, visit: &mut dyn FnMut(Address));

static SAFEPOINT_VISITOR: Mutex<Option<SafepointVisitor>> = Mutex::new(None);

/// Install the frame-slot visitor. Called once by the VM layer at startup.
pub fn set_safepoint_visitor(visitor: SafepointVisitor) {
    *SAFEPOINT_VISITOR.lock() = Some(visitor);
}

pub struct Stack {
    /// Keeps the buffer alive; all access goes through the address fields.
    _buf: Box<[u8]>,
    /// High end; the initial `sp` and `fp`.
    start: Address,
    /// Low end; `check` fails below this.
    limit: Address,
    sp: AtomicUsize,
    fp: AtomicUsize,
    in_use: AtomicBool,
}

impl Stack {
    fn new() -> Stack {
        let buf = vec![0u8; STACK_SIZE].into_boxed_slice();
        let limit = buf.as_ptr() as Address;
        let start = limit + STACK_SIZE;
        Stack {
            _buf: buf,
            start,
            limit,
            sp: AtomicUsize::new(start),
            fp: AtomicUsize::new(start),
            in_use: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    pub fn start(&self) -> Address {
        self.start
    }

    #[inline(always)]
    pub fn limit(&self) -> Address {
        self.limit
    }

    /// Fail if pushing `bytes` more would cross the limit.
    #[inline(always)]
    pub fn check(&self, bytes: usize) -> Result<(), StackOverflowError> {
        let sp = self.sp.load(Ordering::Relaxed);
        match sp.checked_sub(bytes) {
            Some(top) if top >= self.limit => Ok(()),
            _ => Err(StackOverflowError),
        }
    }

    /// Current committed registers. The interpreter keeps its own loop-local
    /// copies and commits on frame transitions.
    #[inline(always)]
    pub fn sp(&self) -> Address {
        self.sp.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn fp(&self) -> Address {
        self.fp.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_sp(&self, sp: Address) {
        debug_assert!(self.limit <= sp && sp <= self.start);
        self.sp.store(sp, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn set_fp(&self, fp: Address) {
        debug_assert!(self.limit <= fp && fp <= self.start);
        self.fp.store(fp, Ordering::Relaxed);
    }

    /// Read the frame at `fp`.
    ///
    /// # Safety
    ///
    /// `fp` must point at a frame previously written by the interpreter.
    #[inline(always)]
    pub unsafe fn frame_at(&self, fp: Address) -> Frame {
        debug_assert!(self.limit <= fp && fp + FRAME_BYTES <= self.start);
        std::ptr::read(fp as *const Frame)
    }

    /// Walk the frame chain, visiting each frame's `(fn, package)` words
    /// and any pointer slots flagged by the function's safepoint bitmap at
    /// the frame's resumption PC.
    fn accept(&self, visit: &mut dyn FnMut(Address)) {
        if !self.in_use.load(Ordering::Relaxed) {
            return;
        }
        let visitor = *SAFEPOINT_VISITOR.lock();
        let mut fp = self.fp();
        // A frame at `fp` stores its caller's registers, so the function
        // suspended at a frame's saved_ip owns the frame one link further
        // up the chain. Carry (saved_fn, saved_ip) into the next iteration,
        // where `fp` is that caller's own frame base.
        let mut resume_fn: Address = 0;
        let mut resume_ip: Address = 0;
        while fp != 0 && fp + FRAME_BYTES <= self.start {
            // SAFETY: fp values on the chain were written by the
            // interpreter.
            let frame = unsafe { self.frame_at(fp) };
            visit(frame.saved_fn);
            visit(frame.saved_pkg);
            if resume_ip != 0 {
                if let Some(visitor) = visitor {
                    // SAFETY: resume_fn is a live function block stored by
                    // the interpreter one frame below; fp is its frame
                    // base.
                    unsafe { visitor(resume_fn, resume_ip, fp, visit) };
                }
            }
            resume_fn = frame.saved_fn;
            resume_ip = frame.saved_ip;
            fp = frame.saved_fp;
        }
    }
}

/// Hands out stacks and releases them on drop.
pub struct StackGuard {
    stack: &'static Stack,
}

impl StackGuard {
    pub fn stack(&self) -> &'static Stack {
        self.stack
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        self.stack.set_sp(self.stack.start);
        self.stack.set_fp(self.stack.start);
        self.stack.in_use.store(false, Ordering::Relaxed);
    }
}

pub struct StackPool {
    stacks: Mutex<Vec<&'static Stack>>,
}

static POOL: Lazy<StackPool> = Lazy::new(|| StackPool {
    stacks: Mutex::new(Vec::new()),
});

static REGISTER: Once = Once::new();

/// The process-wide stack pool, registered with the heap on first use.
pub fn stack_pool() -> &'static StackPool {
    let pool = &*POOL;
    REGISTER.call_once(|| heap().register_roots(pool));
    pool
}

impl StackPool {
    /// Borrow an idle stack, growing the pool if all are busy. Stacks are
    /// leaked into the pool and live for the process lifetime.
    pub fn get(&self) -> StackGuard {
        let mut stacks = self.stacks.lock();
        for stack in stacks.iter() {
            if !stack.in_use.swap(true, Ordering::Relaxed) {
                return StackGuard { stack };
            }
        }
        let stack: &'static Stack = Box::leak(Box::new(Stack::new()));
        stack.in_use.store(true, Ordering::Relaxed);
        stacks.push(stack);
        StackGuard { stack }
    }
}

impl RootAcceptor for StackPool {
    fn accept(&self, visit: &mut dyn FnMut(Address)) {
        let stacks = self.stacks.lock();
        for stack in stacks.iter() {
            stack.accept(visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WORD_SIZE;

    #[test]
    fn check_guards_the_limit() {
        let stack = Stack::new();
        assert!(stack.check(0).is_ok());
        assert!(stack.check(STACK_SIZE).is_ok());
        assert!(stack.check(STACK_SIZE + 1).is_err());
        stack.set_sp(stack.start() - STACK_SIZE + 8);
        assert!(stack.check(8).is_ok());
        assert!(stack.check(9).is_err());
    }

    #[test]
    fn pool_reuses_idle_stacks() {
        let _guard = crate::TEST_HEAP_LOCK.lock();
        let pool = stack_pool();
        let first = pool.get();
        let first_start = first.stack().start();
        let second = pool.get();
        assert_ne!(first_start, second.stack().start());
        drop(first);
        let third = pool.get();
        assert_eq!(third.stack().start(), first_start);
        drop(second);
        drop(third);
    }

    /// Reports every `(fn, ip, fp)` triple through the visit callback so
    /// the test below can assert the exact pairings.
    unsafe fn echo_visitor(
        fn_addr: Address,
        ip: Address,
        fp: Address,
        visit: &mut dyn FnMut(Address),
    ) {
        visit(fn_addr);
        visit(ip);
        visit(fp);
    }

    #[test]
    fn accept_walks_the_frame_chain() {
        const FN_MAIN: Address = 0x1111_0000;
        const FN_A: Address = 0x3333_0000;
        const FN_B: Address = 0x5555_0000;
        const PKG: Address = 0x2222_0000;

        let _lock = crate::TEST_HEAP_LOCK.lock();
        let guard = stack_pool().get();
        let stack = guard.stack();

        // Hand-build three frames, the way the interpreter would for
        // main -> a -> b -> (innermost callee): each frame stores its
        // CALLER's registers. The entry frame stores main itself with a
        // null resumption ip.
        let outer_fp = stack.start() - FRAME_BYTES;
        // SAFETY: the frame region is inside the stack buffer.
        unsafe {
            std::ptr::write(
                outer_fp as *mut Frame,
                Frame {
                    saved_fp: 0,
                    saved_ip: 0,
                    saved_fn: FN_MAIN,
                    saved_pkg: PKG,
                },
            );
        }
        let mid_fp = outer_fp - 2 * WORD_SIZE - FRAME_BYTES;
        // SAFETY: see above.
        unsafe {
            std::ptr::write(
                mid_fp as *mut Frame,
                Frame {
                    saved_fp: outer_fp,
                    saved_ip: 7,
                    saved_fn: FN_A,
                    saved_pkg: PKG,
                },
            );
        }
        let inner_fp = mid_fp - FRAME_BYTES;
        // SAFETY: see above.
        unsafe {
            std::ptr::write(
                inner_fp as *mut Frame,
                Frame {
                    saved_fp: mid_fp,
                    saved_ip: 9,
                    saved_fn: FN_B,
                    saved_pkg: PKG,
                },
            );
        }
        stack.set_fp(inner_fp);
        stack.set_sp(inner_fp);

        // Without a visitor: only the saved function and package words.
        let mut seen = Vec::new();
        stack.accept(&mut |addr| seen.push(addr));
        assert_eq!(seen, vec![FN_B, PKG, FN_A, PKG, FN_MAIN, PKG]);

        // With a visitor: each suspended function is paired with its own
        // resumption pc and its own frame base. FN_B (saved in the inner
        // frame) is suspended at ip 9 and owns the frame at mid_fp; FN_A
        // at ip 7 owns the frame at outer_fp. FN_MAIN's saved_ip is null,
        // so the entry frame is never reported.
        set_safepoint_visitor(echo_visitor);
        let mut seen = Vec::new();
        stack.accept(&mut |addr| seen.push(addr));
        assert_eq!(
            seen,
            vec![
                FN_B, PKG, // inner frame's saved words
                FN_A, PKG, // middle frame's saved words
                FN_B, 9, mid_fp, // FN_B suspended at 9, frame at mid_fp
                FN_MAIN, PKG, // entry frame's saved words
                FN_A, 7, outer_fp, // FN_A suspended at 7, frame at outer_fp
            ]
        );
    }
}
