//! The handle table: traced root slots for off-heap code.
//!
//! Code outside the heap cannot carry barrier-recorded pointer words, so it
//! holds blocks through handles instead. A handle points at a slot in the
//! table; the table is a registered root acceptor, so every live slot keeps
//! its target alive across collections.
//!
//! Slots live in boxed slabs so their addresses stay stable as the table
//! grows. Freed slots thread a free list through their own words, with the
//! low bit set to distinguish links from live targets (block addresses are
//! always 8-byte aligned).

use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Once;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::AllocationError;
use crate::heap::{heap, Address, RootAcceptor};

const SLAB_SLOTS: usize = 512;

struct Slab {
    slots: [usize; SLAB_SLOTS],
}

struct TableState {
    slabs: Vec<Box<Slab>>,
    /// Slots handed out so far (freed slots stay counted; they are skipped
    /// by the acceptor via the free-list tag bit).
    len: usize,
    /// Address of the first free slot, 0 when none.
    free: usize,
}

pub struct HandleTable {
    state: Mutex<TableState>,
}

static TABLE: Lazy<HandleTable> = Lazy::new(|| HandleTable {
    state: Mutex::new(TableState {
        slabs: Vec::new(),
        len: 0,
        free: 0,
    }),
});

static REGISTER: Once = Once::new();

/// The process-wide handle table, registered with the heap on first use.
pub fn handle_table() -> &'static HandleTable {
    let table = &*TABLE;
    REGISTER.call_once(|| heap().register_roots(table));
    table
}

impl HandleTable {
    /// Allocate a slot holding `value` and return its stable address.
    pub fn alloc_slot(&self, value: Address) -> *mut usize {
        debug_assert_eq!(value & 1, 0, "slot targets are word aligned");
        let mut state = self.state.lock();

        if state.free != 0 {
            let slot = state.free as *mut usize;
            // SAFETY: free slots hold the tagged address of the next free
            // slot (or the bare tag bit at the end of the list).
            unsafe {
                state.free = *slot & !1;
                *slot = value;
            }
            return slot;
        }

        if state.len == state.slabs.len() * SLAB_SLOTS {
            state.slabs.push(Box::new(Slab {
                slots: [0; SLAB_SLOTS],
            }));
        }
        let index = state.len;
        state.len += 1;
        let slab = state.slabs.last_mut().expect("slab just ensured");
        &mut slab.slots[index % SLAB_SLOTS] as *mut usize
    }

    /// Return a slot to the free list.
    ///
    /// # Safety
    ///
    /// `slot` must have come from [`alloc_slot`](Self::alloc_slot) and must
    /// not be used afterwards.
    pub unsafe fn free_slot(&self, slot: *mut usize) {
        let mut state = self.state.lock();
        *slot = state.free | 1;
        state.free = slot as usize;
    }

    #[cfg(test)]
    fn live_slot_count(&self) -> usize {
        let state = self.state.lock();
        let mut live = state.len;
        let mut free = state.free;
        while free != 0 {
            live -= 1;
            // SAFETY: the free list only links freed slots.
            free = unsafe { *(free as *const usize) & !1 };
        }
        live
    }
}

impl RootAcceptor for HandleTable {
    fn accept(&self, visit: &mut dyn FnMut(Address)) {
        let state = self.state.lock();
        for (i, slab) in state.slabs.iter().enumerate() {
            let filled = (state.len - i * SLAB_SLOTS).min(SLAB_SLOTS);
            for &slot in &slab.slots[..filled] {
                if slot != 0 && slot & 1 == 0 {
                    visit(slot);
                }
            }
        }
    }
}

/// A traced reference to a heap block of type `T`.
///
/// Cloning allocates a fresh slot; dropping frees one. Handles must not
/// outlive the handle table, which lives for the whole process.
pub struct Handle<T> {
    slot: *mut usize,
    _marker: PhantomData<*const T>,
}

// SAFETY: the slot is stable, the table is global, and targets are only
// read through shared references.
unsafe impl<T: Sync> Send for Handle<T> {}
// SAFETY: see above.
unsafe impl<T: Sync> Sync for Handle<T> {}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("slot", &self.slot).finish()
    }
}

impl<T> Handle<T> {
    /// Root `target` in the handle table.
    ///
    /// # Safety
    ///
    /// `target` must be the address of a live heap block holding a properly
    /// initialized `T` (dereferences assume it).
    pub unsafe fn from_address(target: Address) -> Handle<T> {
        Handle {
            slot: handle_table().alloc_slot(target),
            _marker: PhantomData,
        }
    }

    /// Allocate a zeroed heap block of `size` bytes already rooted by a
    /// fresh handle. The block address lands in the slot before the heap
    /// lock is released, so no collection can sweep it first.
    ///
    /// # Safety
    ///
    /// The block comes back zeroed; the caller must initialize it as a
    /// valid `T` before dereferencing the handle.
    pub unsafe fn alloc(size: usize) -> Result<Handle<T>, AllocationError> {
        let slot = handle_table().alloc_slot(0);
        match heap().allocate_into(size, slot) {
            Ok(_) => Ok(Handle {
                slot,
                _marker: PhantomData,
            }),
            Err(err) => {
                handle_table().free_slot(slot);
                Err(err)
            }
        }
    }

    /// The target's address; chases the one slot indirection.
    #[inline(always)]
    pub fn address(&self) -> Address {
        // SAFETY: the slot stays valid until drop.
        unsafe { *self.slot }
    }
}

impl<T> Deref for Handle<T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        // SAFETY: from_address's contract — the slot holds a live T.
        unsafe { &*(self.address() as *const T) }
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        // SAFETY: the target is live per this handle's own invariant.
        unsafe { Handle::from_address(self.address()) }
    }
}

impl<T> Drop for Handle<T> {
    fn drop(&mut self) {
        // SAFETY: the slot came from alloc_slot and is abandoned here.
        unsafe { handle_table().free_slot(self.slot) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_recycle_through_the_free_list() {
        let _guard = crate::TEST_HEAP_LOCK.lock();
        let table = handle_table();
        let before = table.live_slot_count();
        let a = table.alloc_slot(0x1000);
        let b = table.alloc_slot(0x2000);
        assert_ne!(a, b);
        // SAFETY: freshly allocated above.
        unsafe {
            assert_eq!(*a, 0x1000);
            table.free_slot(a);
        }
        let c = table.alloc_slot(0x3000);
        assert_eq!(c, a, "freed slot is reused first");
        assert_eq!(table.live_slot_count(), before + 2);
        // SAFETY: both slots are live here.
        unsafe {
            table.free_slot(b);
            table.free_slot(c);
        }
        assert_eq!(table.live_slot_count(), before);
    }

    #[test]
    fn handles_root_their_targets() {
        let _guard = crate::TEST_HEAP_LOCK.lock();
        // 56-byte blocks are unique to this test (see TEST_HEAP_LOCK note).
        let block = heap().allocate(56).unwrap();
        // SAFETY: block is live.
        let handle = unsafe { Handle::<u64>::from_address(block) };
        heap().collect_garbage();
        assert!(heap().is_live_block(block));

        let copy = handle.clone();
        assert_eq!(copy.address(), handle.address());
        drop(handle);
        drop(copy);
        heap().collect_garbage();
        assert!(!heap().is_live_block(block), "unrooted block is swept");
    }

    #[test]
    fn acceptor_skips_freed_slots() {
        let _guard = crate::TEST_HEAP_LOCK.lock();
        let table = handle_table();
        let slot = table.alloc_slot(0xAAA0);
        // SAFETY: slot is live until the free below.
        unsafe { table.free_slot(slot) };
        let mut seen = Vec::new();
        table.accept(&mut |addr| seen.push(addr));
        assert!(!seen.contains(&0xAAA0));
    }
}
