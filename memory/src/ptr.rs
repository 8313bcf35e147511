//! Barrier-recording pointer wrapper for words stored inside heap blocks.

use std::fmt;
use std::marker::PhantomData;

use crate::heap::{heap, Address};

/// A one-word pointer field.
///
/// Every store must go through [`set`](Ptr::set) **on the slot where the
/// pointer lives**, which records the write so the collector can trace it.
/// A `Ptr` held on the Rust stack records harmlessly (the barrier
/// short-circuits off-heap), so the call is uniform.
///
/// Bitwise copies (`Copy`) are fine for reads; placing a copied `Ptr` into
/// a heap block without going through `set` on the destination slot loses
/// the barrier and is a bug.
#[repr(transparent)]
pub struct Ptr<T> {
    p: Address,
    _marker: PhantomData<*mut T>,
}

impl<T> Ptr<T> {
    pub const fn null() -> Self {
        Self {
            p: 0,
            _marker: PhantomData,
        }
    }

    /// Store `target` into this slot and record the write.
    #[inline(always)]
    pub fn set(&mut self, target: Address) {
        self.p = target;
        heap().record_write(&self.p as *const Address as Address, target);
    }

    #[inline(always)]
    pub fn address(&self) -> Address {
        self.p
    }

    #[inline(always)]
    pub fn is_null(&self) -> bool {
        self.p == 0
    }

    /// # Safety
    ///
    /// The slot must hold the address of a live, properly initialized `T`.
    #[inline(always)]
    pub unsafe fn as_ref(&self) -> &T {
        debug_assert!(!self.is_null());
        &*(self.p as *const T)
    }
}

impl<T> Clone for Ptr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Ptr<T> {}

impl<T> Default for Ptr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> PartialEq for Ptr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.p == other.p
    }
}

impl<T> Eq for Ptr<T> {}

impl<T> fmt::Debug for Ptr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ptr({:#x})", self.p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_equality() {
        let a: Ptr<u64> = Ptr::null();
        assert!(a.is_null());
        let mut b: Ptr<u64> = Ptr::null();
        assert_eq!(a, b);
        b.set(0x12345678);
        assert_ne!(a, b);
        assert_eq!(b.address(), 0x12345678);
    }

    #[test]
    fn set_inside_block_records_pointer_bit() {
        let _guard = crate::TEST_HEAP_LOCK.lock();
        let block = heap().allocate(16).unwrap();
        // SAFETY: block is a live zeroed 16-byte block; a Ptr is one word.
        let slot = unsafe { &mut *(block as *mut Ptr<u64>) };
        let target = heap().allocate(16).unwrap();
        slot.set(target);
        let chunk =
            unsafe { crate::Chunk::from_base(crate::Chunk::base_of(block)) };
        assert!(chunk.is_pointer(block));
    }
}
