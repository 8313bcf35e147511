//! The process-wide managed heap: a segregated-size registry of chunks with
//! a stop-the-world, non-moving mark-sweep collector.
//!
//! Collection is driven by registered root acceptors (the handle table, the
//! stack pool, the interned roots); from those the collector traces through
//! the pointer bitmaps maintained by [`record_write`](Heap::record_write).

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::chunk::{Chunk, CHUNK_SIZE, MAX_BLOCK_SIZE};
use crate::error::AllocationError;
use crate::{align_up, WORD_SIZE};

/// A machine address, on or off the heap.
pub type Address = usize;

/// Blocks are never allocated below this address, so lesser values can
/// encode sentinels.
pub const MIN_ADDRESS: Address = 1 << 20;

/// Address returned for zero-byte allocations. Never inside a chunk.
pub const ZERO_ALLOC_ADDRESS: Address = MIN_ADDRESS;

const INITIAL_ALLOCATION_LIMIT: usize = CHUNK_SIZE;

/// A source of GC roots. Acceptors may pass any word; the collector ignores
/// addresses that are not inside live heap blocks. Registration does not
/// transfer ownership — roots are weak from the heap's point of view.
pub trait RootAcceptor: Sync {
    fn accept(&self, visit: &mut dyn FnMut(Address));
}

struct HeapState {
    chunks_by_size: HashMap<usize, Vec<Chunk>>,
    bytes_allocated: usize,
    allocation_limit: usize,
    acceptors: Vec<&'static dyn RootAcceptor>,
    gc_locked: bool,
    mark_stack: Vec<Address>,
}

pub struct Heap {
    state: Mutex<HeapState>,
    /// Base addresses of all live chunks. Separate from the main lock so the
    /// write barrier and the pointee checks during marking stay cheap.
    chunk_bases: RwLock<HashSet<Address>>,
}

static HEAP: Lazy<Heap> = Lazy::new(Heap::new);

/// The process-wide heap.
pub fn heap() -> &'static Heap {
    &HEAP
}

impl Heap {
    fn new() -> Heap {
        Heap {
            state: Mutex::new(HeapState {
                chunks_by_size: HashMap::new(),
                bytes_allocated: 0,
                allocation_limit: INITIAL_ALLOCATION_LIMIT,
                acceptors: Vec::new(),
                gc_locked: false,
                mark_stack: Vec::new(),
            }),
            chunk_bases: RwLock::new(HashSet::new()),
        }
    }

    /// Allocate a zeroed block of at least `size` bytes.
    ///
    /// Sizes are rounded up to the word size. Zero-byte requests return
    /// [`ZERO_ALLOC_ADDRESS`]; requests over [`MAX_BLOCK_SIZE`] fail
    /// non-retryably. Crossing the allocation limit triggers a collection
    /// first (unless the GC lock is held).
    pub fn allocate(&self, size: usize) -> Result<Address, AllocationError> {
        let mut slot = 0usize;
        // SAFETY: the slot is a local, writable for the whole call.
        unsafe { self.allocate_into(size, &mut slot) }
    }

    /// Like [`allocate`](Heap::allocate), but stores the resulting address
    /// into `slot` before the heap lock is released. With `slot` registered
    /// as a root (e.g. a handle-table slot) there is no window in which a
    /// collection on another thread could sweep the fresh block.
    ///
    /// # Safety
    ///
    /// `slot` must stay writable for the duration of the call.
    pub unsafe fn allocate_into(
        &self,
        size: usize,
        slot: *mut usize,
    ) -> Result<Address, AllocationError> {
        let size = align_up(size, WORD_SIZE);
        if size == 0 {
            *slot = ZERO_ALLOC_ADDRESS;
            return Ok(ZERO_ALLOC_ADDRESS);
        }
        if size > MAX_BLOCK_SIZE {
            return Err(AllocationError {
                retry_after_gc: false,
            });
        }

        let mut state = self.state.lock();
        if !state.gc_locked
            && state.bytes_allocated + size >= state.allocation_limit
        {
            self.collect_garbage_locked(&mut state);
        }
        let mut addr = self.allocate_locked(&mut state, size);
        // Out of chunk memory: collect once more and retry before giving up.
        if addr.is_none() && !state.gc_locked {
            self.collect_garbage_locked(&mut state);
            addr = self.allocate_locked(&mut state, size);
        }
        match addr {
            Some(addr) => {
                *slot = addr;
                Ok(addr)
            }
            None => Err(AllocationError {
                retry_after_gc: true,
            }),
        }
    }

    fn allocate_locked(
        &self,
        state: &mut HeapState,
        size: usize,
    ) -> Option<Address> {
        let chunks = state.chunks_by_size.entry(size).or_default();
        for chunk in chunks.iter() {
            if let Some(addr) = chunk.allocate() {
                state.bytes_allocated += size;
                return Some(addr);
            }
        }

        let chunk = Chunk::map(size).ok()?;
        self.chunk_bases.write().insert(chunk.base());
        let addr = chunk.allocate();
        debug_assert!(addr.is_some(), "fresh chunk refused an allocation");
        state.chunks_by_size.entry(size).or_default().push(chunk);
        state.bytes_allocated += size;
        addr
    }

    /// The write barrier: record that the word at `from` now holds a
    /// pointer. A no-op when `from` is not inside a chunk, so callers may
    /// record stores to off-heap words uniformly.
    ///
    /// Holds the heap lock so recording never races a sweep. Coarse, and
    /// an optimization hazard once write rates grow.
    pub fn record_write(&self, from: Address, _to: Address) {
        let _state = self.state.lock();
        let base = Chunk::base_of(from);
        if !self.chunk_bases.read().contains(&base) {
            return;
        }
        // SAFETY: base is registered and the heap lock excludes unmapping.
        let chunk = unsafe { Chunk::from_base(base) };
        chunk.set_pointer(from, true);
    }

    /// Whether `addr` lies inside a live chunk.
    pub fn is_on_heap(&self, addr: Address) -> bool {
        self.chunk_bases.read().contains(&Chunk::base_of(addr))
    }

    /// Whether `addr` lies inside a currently allocated block. Takes the
    /// heap lock; meant for validation and tests, not hot paths.
    pub fn is_live_block(&self, addr: Address) -> bool {
        let _state = self.state.lock();
        self.is_live_block_unlocked(addr)
    }

    fn is_live_block_unlocked(&self, addr: Address) -> bool {
        let base = Chunk::base_of(addr);
        if !self.chunk_bases.read().contains(&base) {
            return false;
        }
        // SAFETY: base is registered and the caller holds the heap lock,
        // which excludes unmapping.
        let chunk = unsafe { Chunk::from_base(base) };
        if addr < chunk.data_start() || addr >= chunk.free_frontier_unlocked() {
            return false;
        }
        !chunk.is_free_block_unlocked(chunk.block_containing(addr))
    }

    /// Register a source of roots. Acceptors live for the process lifetime
    /// and are called with the heap lock held.
    pub fn register_roots(&self, acceptor: &'static dyn RootAcceptor) {
        self.state.lock().acceptors.push(acceptor);
    }

    /// Coarse collection toggle used during bootstrap, while globally
    /// reachable objects are still being wired up.
    pub fn set_gc_lock(&self, locked: bool) {
        self.state.lock().gc_locked = locked;
    }

    pub fn bytes_allocated(&self) -> usize {
        self.state.lock().bytes_allocated
    }

    /// Run a full stop-the-world mark-sweep collection.
    pub fn collect_garbage(&self) {
        let mut state = self.state.lock();
        if state.gc_locked {
            return;
        }
        self.collect_garbage_locked(&mut state);
    }

    fn collect_garbage_locked(&self, state: &mut HeapState) {
        let before = state.bytes_allocated;

        // Scan roots: queue every root that targets an unmarked live block.
        let mut mark_stack = std::mem::take(&mut state.mark_stack);
        mark_stack.clear();
        for acceptor in &state.acceptors {
            acceptor.accept(&mut |addr| {
                if let Some((chunk, block)) = self.block_of(addr) {
                    if !chunk.is_marked(block) {
                        mark_stack.push(block);
                    }
                }
            });
        }

        // Mark: trace pointer-bit words transitively.
        while let Some(addr) = mark_stack.pop() {
            let Some((chunk, block)) = self.block_of(addr) else {
                continue;
            };
            if chunk.is_marked(block) {
                continue;
            }
            chunk.set_mark(block);
            chunk.scan_pointer_words(block, &mut |target| {
                if let Some((tc, tb)) = self.block_of(target) {
                    if !tc.is_marked(tb) {
                        mark_stack.push(tb);
                    }
                }
            });
        }
        state.mark_stack = mark_stack;

        // Sweep: drop wholly unmarked chunks, sweep the rest.
        let mut bytes_allocated = 0;
        for chunks in state.chunks_by_size.values_mut() {
            chunks.retain(|chunk| {
                if chunk.has_mark() {
                    true
                } else {
                    self.chunk_bases.write().remove(&chunk.base());
                    chunk.unmap();
                    false
                }
            });
            for chunk in chunks.iter() {
                chunk.sweep();
                bytes_allocated += chunk.bytes_allocated();
            }
        }
        state.chunks_by_size.retain(|_, chunks| !chunks.is_empty());
        state.bytes_allocated = bytes_allocated;
        // Doubling with a floor keeps a near-empty heap from collecting on
        // every allocation.
        state.allocation_limit =
            (2 * bytes_allocated).max(INITIAL_ALLOCATION_LIMIT);

        debug!(
            target: "gc",
            before, after = bytes_allocated, limit = state.allocation_limit,
            "collection finished"
        );
    }

    fn block_of(&self, addr: Address) -> Option<(Chunk, Address)> {
        let base = Chunk::base_of(addr);
        if !self.chunk_bases.read().contains(&base) {
            return None;
        }
        // SAFETY: base is registered; chunks are only unmapped under the
        // heap lock, which collection holds.
        let chunk = unsafe { Chunk::from_base(base) };
        if addr < chunk.data_start() || addr >= chunk.free_frontier_unlocked() {
            return None;
        }
        Some((chunk, chunk.block_containing(addr)))
    }

    /// Walk every chunk asserting the heap invariants. Holds the heap lock
    /// for the whole walk. Test support.
    pub fn validate(&self) {
        let state = self.state.lock();
        let live = |addr: Address| {
            addr == ZERO_ALLOC_ADDRESS || self.is_live_block_unlocked(addr)
        };
        for chunk in state.chunks_by_size.values().flatten() {
            chunk.validate(&live);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{handle_table, Handle};

    #[test]
    fn zero_allocation_returns_sentinel() {
        let _guard = crate::TEST_HEAP_LOCK.lock();
        assert_eq!(heap().allocate(0).unwrap(), ZERO_ALLOC_ADDRESS);
        assert!(!heap().is_on_heap(ZERO_ALLOC_ADDRESS));
    }

    #[test]
    fn oversized_allocation_fails_without_retry() {
        let _guard = crate::TEST_HEAP_LOCK.lock();
        let err = heap().allocate(MAX_BLOCK_SIZE + 1).unwrap_err();
        assert!(!err.retry_after_gc);
    }

    #[test]
    fn allocations_are_aligned_and_distinct() {
        let _guard = crate::TEST_HEAP_LOCK.lock();
        let mut seen = std::collections::HashSet::new();
        let mut handles = Vec::new();
        for size in [1, 7, 8, 9, 64, 4096, MAX_BLOCK_SIZE] {
            let addr = heap().allocate(size).unwrap();
            assert_eq!(addr % WORD_SIZE, 0);
            assert!(seen.insert(addr), "duplicate live address {addr:#x}");
            // Root the block so later tests' collections can't recycle it
            // while `seen` still refers to it.
            // SAFETY: the block is live and untyped access is never made.
            handles.push(unsafe { Handle::<u64>::from_address(addr) });
        }
    }

    #[test]
    fn record_write_sets_pointer_bit() {
        let _guard = crate::TEST_HEAP_LOCK.lock();
        let addr = heap().allocate(16).unwrap();
        let target = heap().allocate(16).unwrap();
        // SAFETY: both blocks are live.
        let _roots = unsafe {
            (
                Handle::<u64>::from_address(addr),
                Handle::<u64>::from_address(target),
            )
        };
        heap().record_write(addr, target);
        let chunk = unsafe { Chunk::from_base(Chunk::base_of(addr)) };
        assert!(chunk.is_pointer(addr));
        assert!(!chunk.is_pointer(addr + WORD_SIZE));
    }

    #[test]
    fn record_write_ignores_off_heap_words() {
        let _guard = crate::TEST_HEAP_LOCK.lock();
        let slot = 0usize;
        heap().record_write(&slot as *const usize as Address, 0);
    }

    #[test]
    fn collection_retains_reachable_blocks_and_sweeps_garbage() {
        let _guard = crate::TEST_HEAP_LOCK.lock();
        // 48-byte blocks are unique to this test, so no concurrently running
        // test can recycle the swept block before the final assertion.
        let root = heap().allocate(48).unwrap();
        let child = heap().allocate(48).unwrap();
        // SAFETY: root is a live 48-byte block.
        unsafe { *(root as *mut usize) = child };
        heap().record_write(root, child);
        // SAFETY: root is live.
        let root_handle = unsafe { Handle::<u64>::from_address(root) };
        let _ = handle_table();

        let garbage = heap().allocate(48).unwrap();

        heap().collect_garbage();
        heap().validate();

        assert!(heap().is_live_block(root));
        assert!(heap().is_live_block(child), "traced through pointer bit");
        // The unrooted block must be gone (freed or its chunk dropped).
        assert!(!heap().is_live_block(garbage));
        drop(root_handle);
    }
}
