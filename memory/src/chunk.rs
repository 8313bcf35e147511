//! Chunks: 1 MiB aligned regions carved into equal-size blocks.
//!
//! A chunk's first 32 KiB hold two bitmaps with one bit per word of the
//! whole chunk: the pointer bitmap (set by the write barrier) and the mark
//! bitmap (set by the collector). The chunk header sits right after the
//! bitmaps; bits covering the bitmaps and the header are never used. Blocks
//! start at the 8-byte-aligned data offset and are handed out from a free
//! list or by bumping the free frontier.

use std::mem::size_of;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::bitmap::Bitmap;
use crate::error::SystemAllocationError;
use crate::system;
use crate::{align_up, Address, WORD_SIZE};

/// Chunk size and alignment.
pub const CHUNK_SIZE: usize = 1 << 20;

/// Largest block a chunk (and therefore the heap) will hold.
pub const MAX_BLOCK_SIZE: usize = 128 * 1024;

const WORDS_PER_CHUNK: usize = CHUNK_SIZE / WORD_SIZE;
const BITMAP_BYTES: usize = WORDS_PER_CHUNK / 8;

const POINTER_BITMAP_OFFSET: usize = 0;
const MARK_BITMAP_OFFSET: usize = BITMAP_BYTES;
const HEADER_OFFSET: usize = 2 * BITMAP_BYTES;
const DATA_OFFSET: usize =
    align_up(HEADER_OFFSET + size_of::<Header>(), WORD_SIZE);

// Both bitmaps must fit in the first 32 KiB.
const _: () = assert!(2 * BITMAP_BYTES == 32 * 1024);
const _: () = assert!(MAX_BLOCK_SIZE <= CHUNK_SIZE - DATA_OFFSET);

#[repr(C)]
struct Header {
    block_size: usize,
    bytes_allocated: usize,
    /// Address of the first free block, 0 when the list is empty. Each free
    /// block's first word holds the next free block's address.
    free_list: usize,
    /// First never-allocated address; everything above it up to the chunk
    /// end is zeroed with no bits set.
    free_frontier: usize,
    lock: Mutex<()>,
}

/// A view over one mapped chunk. Copyable; ownership (mapping and unmapping)
/// is managed by the heap's chunk registry.
#[derive(Clone, Copy)]
pub struct Chunk {
    base: NonNull<u8>,
}

// SAFETY: all mutation goes through the per-chunk lock or the heap lock.
unsafe impl Send for Chunk {}
// SAFETY: see above.
unsafe impl Sync for Chunk {}

impl Chunk {
    /// Map a fresh chunk for blocks of `block_size` bytes (a multiple of 8,
    /// at most [`MAX_BLOCK_SIZE`]).
    pub fn map(block_size: usize) -> Result<Chunk, SystemAllocationError> {
        debug_assert!(block_size % WORD_SIZE == 0);
        debug_assert!(0 < block_size && block_size <= MAX_BLOCK_SIZE);
        let base = system::map_aligned(CHUNK_SIZE, CHUNK_SIZE)?;
        let chunk = Chunk { base };
        // SAFETY: the mapping is fresh, zeroed, and exclusively ours.
        unsafe {
            std::ptr::write(
                chunk.header_ptr(),
                Header {
                    block_size,
                    bytes_allocated: 0,
                    free_list: 0,
                    free_frontier: chunk.data_start(),
                    lock: Mutex::new(()),
                },
            );
        }
        Ok(chunk)
    }

    /// Reconstruct a view from a chunk base address.
    ///
    /// # Safety
    ///
    /// `base` must be the base address of a live chunk produced by [`map`]
    /// that has not been [`unmap`]ped.
    ///
    /// [`map`]: Chunk::map
    /// [`unmap`]: Chunk::unmap
    pub unsafe fn from_base(base: Address) -> Chunk {
        debug_assert_eq!(base % CHUNK_SIZE, 0);
        Chunk {
            base: NonNull::new_unchecked(base as *mut u8),
        }
    }

    /// Base address of the chunk containing `addr`.
    #[inline(always)]
    pub fn base_of(addr: Address) -> Address {
        addr & !(CHUNK_SIZE - 1)
    }

    /// Return the chunk's memory to the kernel. The view (and all copies of
    /// it) must not be used afterwards.
    pub fn unmap(self) {
        system::unmap(self.base, CHUNK_SIZE);
    }

    #[inline(always)]
    pub fn base(&self) -> Address {
        self.base.as_ptr() as Address
    }

    #[inline(always)]
    fn header_ptr(&self) -> *mut Header {
        (self.base() + HEADER_OFFSET) as *mut Header
    }

    #[inline(always)]
    fn header(&self) -> &Header {
        // SAFETY: the header is initialized in map() and lives as long as
        // the mapping.
        unsafe { &*self.header_ptr() }
    }

    #[inline(always)]
    fn header_mut(&self) -> *mut Header {
        self.header_ptr()
    }

    #[inline(always)]
    pub fn block_size(&self) -> usize {
        self.header().block_size
    }

    pub fn bytes_allocated(&self) -> usize {
        let _guard = self.header().lock.lock();
        self.header().bytes_allocated
    }

    #[inline(always)]
    pub fn data_start(&self) -> Address {
        self.base() + DATA_OFFSET
    }

    #[inline(always)]
    pub fn end(&self) -> Address {
        self.base() + CHUNK_SIZE
    }

    /// First never-allocated address. Blocks live in `[data_start, frontier)`.
    pub fn free_frontier(&self) -> Address {
        let _guard = self.header().lock.lock();
        self.header().free_frontier
    }

    pub(crate) fn free_frontier_unlocked(&self) -> Address {
        self.header().free_frontier
    }

    /// Start address of the block containing `p`.
    #[inline(always)]
    pub fn block_containing(&self, p: Address) -> Address {
        debug_assert!(self.data_start() <= p && p < self.end());
        let data = self.data_start();
        data + (p - data) / self.block_size() * self.block_size()
    }

    // ── bitmaps ────────────────────────────────────────────────────

    #[inline(always)]
    fn word_index(&self, addr: Address) -> usize {
        debug_assert!(self.base() <= addr && addr < self.end());
        (addr - self.base()) / WORD_SIZE
    }

    #[inline(always)]
    fn pointer_bitmap(&self) -> Bitmap {
        // SAFETY: the bitmap storage is part of the mapping.
        unsafe {
            Bitmap::new(
                (self.base() + POINTER_BITMAP_OFFSET) as *mut usize,
                WORDS_PER_CHUNK,
            )
        }
    }

    #[inline(always)]
    fn mark_bitmap(&self) -> Bitmap {
        // SAFETY: the bitmap storage is part of the mapping.
        unsafe {
            Bitmap::new(
                (self.base() + MARK_BITMAP_OFFSET) as *mut usize,
                WORDS_PER_CHUNK,
            )
        }
    }

    /// Set or clear the pointer bit for the word at `addr`.
    #[inline(always)]
    pub fn set_pointer(&self, addr: Address, value: bool) {
        self.pointer_bitmap().set(self.word_index(addr), value);
    }

    #[inline(always)]
    pub fn is_pointer(&self, addr: Address) -> bool {
        self.pointer_bitmap().at(self.word_index(addr))
    }

    /// Mark the block starting at `block` (bit on its first word).
    #[inline(always)]
    pub fn set_mark(&self, block: Address) {
        debug_assert_eq!(block, self.block_containing(block));
        self.mark_bitmap().set(self.word_index(block), true);
    }

    #[inline(always)]
    pub fn is_marked(&self, block: Address) -> bool {
        self.mark_bitmap().at(self.word_index(block))
    }

    /// Whether any block in the chunk is marked. Wholly unmarked chunks are
    /// dropped during sweep rather than swept.
    pub fn has_mark(&self) -> bool {
        let _guard = self.header().lock.lock();
        let m = self.mark_bitmap();
        (0..m.word_count()).any(|i| m.word_at(i) != 0)
    }

    // ── allocation ─────────────────────────────────────────────────

    /// Allocate one zeroed block, from the free list if possible, else by
    /// bumping the free frontier. Returns `None` when the chunk is full.
    pub fn allocate(&self) -> Option<Address> {
        let _guard = self.header().lock.lock();
        // SAFETY: we hold the chunk lock.
        let header = unsafe { &mut *self.header_mut() };

        if header.free_list != 0 {
            let block = header.free_list;
            // SAFETY: free blocks store the next free address in word 0.
            unsafe {
                header.free_list = *(block as *const usize);
                *(block as *mut usize) = 0;
            }
            header.bytes_allocated += header.block_size;
            return Some(block);
        }

        if header.free_frontier + header.block_size <= self.end() {
            let block = header.free_frontier;
            header.free_frontier += header.block_size;
            header.bytes_allocated += header.block_size;
            return Some(block);
        }

        None
    }

    /// Visit every word of `block` whose pointer bit is set.
    pub fn scan_pointer_words(
        &self,
        block: Address,
        visit: &mut dyn FnMut(Address),
    ) {
        let ptr = self.pointer_bitmap();
        let words = self.block_size() / WORD_SIZE;
        let first = self.word_index(block);
        for i in first..first + words {
            if ptr.at(i) {
                // SAFETY: i indexes a word inside the chunk's data area.
                let value = unsafe { *((self.base() + i * WORD_SIZE) as *const usize) };
                visit(value);
            }
        }
    }

    // ── sweeping ───────────────────────────────────────────────────

    /// Reclaim unmarked blocks.
    ///
    /// The frontier first expands downward through contiguous unmarked
    /// blocks at the tail (zeroing words and pointer bits). Remaining
    /// unmarked blocks are zeroed, stripped of pointer bits, and pushed on
    /// the free list. Marked blocks keep their contents and re-account
    /// `bytes_allocated`. All mark bits are cleared at the end.
    pub fn sweep(&self) {
        let _guard = self.header().lock.lock();
        // SAFETY: we hold the chunk lock.
        let header = unsafe { &mut *self.header_mut() };
        let mark = self.mark_bitmap();
        let ptr = self.pointer_bitmap();
        let words = self.base() as *mut usize;
        let words_per_block = header.block_size / WORD_SIZE;

        let begin_index = DATA_OFFSET / WORD_SIZE;
        let orig_free_index = (header.free_frontier - self.base()) / WORD_SIZE;

        // Expand the free frontier through the unmarked tail.
        let mut free_index = orig_free_index;
        while free_index > begin_index {
            let prev = free_index - words_per_block;
            if mark.at(prev) {
                break;
            }
            free_index = prev;
        }
        for i in free_index..orig_free_index {
            // SAFETY: i indexes a word inside the chunk.
            unsafe { *words.add(i) = 0 };
            ptr.set(i, false);
        }
        header.free_frontier = self.base() + free_index * WORD_SIZE;

        // Rebuild the free list below the frontier.
        header.bytes_allocated = 0;
        header.free_list = 0;
        let mut block_index = free_index;
        while block_index > begin_index {
            block_index -= words_per_block;
            if mark.at(block_index) {
                header.bytes_allocated += header.block_size;
                continue;
            }
            ptr.set(block_index, false);
            // SAFETY: block_index and the words after it index the block's
            // words inside the chunk.
            unsafe {
                *words.add(block_index) = header.free_list;
                header.free_list = words.add(block_index) as usize;
                for i in 1..words_per_block {
                    ptr.set(block_index + i, false);
                    *words.add(block_index + i) = 0;
                }
            }
        }

        // Pointer bits in freed blocks were cleared above; bits in live
        // blocks stay set.
        mark.clear();
    }

    /// Whether `block` is currently on the free list.
    pub fn is_free_block(&self, block: Address) -> bool {
        let _guard = self.header().lock.lock();
        self.is_free_block_unlocked(block)
    }

    /// Lock-free variant for validation paths, where the asking chunk may
    /// already hold its own lock and the pointee may be in the same chunk.
    pub(crate) fn is_free_block_unlocked(&self, block: Address) -> bool {
        let mut free = self.header().free_list;
        while free != 0 {
            if free == block {
                return true;
            }
            // SAFETY: free-list links always point at free blocks.
            free = unsafe { *(free as *const usize) };
        }
        false
    }

    // ── validation ─────────────────────────────────────────────────

    /// Walk the chunk asserting the block invariants: pointer words in live
    /// blocks reference live blocks (checked through `is_live_block`), free
    /// blocks are zeroed with clear bits and linked on the free list, and
    /// the frontier holds nothing but zeroes.
    pub fn validate(&self, is_live_block: &dyn Fn(Address) -> bool) {
        let _guard = self.header().lock.lock();
        let header = self.header();
        let words = self.base() as *const usize;
        let words_per_block = header.block_size / WORD_SIZE;
        let begin_index = DATA_OFFSET / WORD_SIZE;
        let frontier_index = (header.free_frontier - self.base()) / WORD_SIZE;
        let ptr = self.pointer_bitmap();
        let mark = self.mark_bitmap();

        let mut bytes_allocated = 0;
        let mut index = begin_index;
        while index + words_per_block <= frontier_index {
            let block = self.base() + index * WORD_SIZE;
            if self.is_free_block_unlocked(block) {
                assert!(!ptr.at(index), "free block {block:#x} has a pointer bit");
                assert!(!mark.at(index), "free block {block:#x} has a mark bit");
                for i in 1..words_per_block {
                    // SAFETY: in-bounds chunk word.
                    let w = unsafe { *words.add(index + i) };
                    assert_eq!(w, 0, "free block {block:#x} has a nonzero word");
                    assert!(!ptr.at(index + i));
                    assert!(!mark.at(index + i));
                }
            } else {
                bytes_allocated += header.block_size;
                for i in 0..words_per_block {
                    if !ptr.at(index + i) {
                        continue;
                    }
                    // SAFETY: in-bounds chunk word.
                    let value = unsafe { *words.add(index + i) };
                    if value != 0 {
                        assert!(
                            is_live_block(value),
                            "pointer word {:#x} in block {block:#x} targets \
                             non-live address {value:#x}",
                            self.base() + (index + i) * WORD_SIZE,
                        );
                    }
                }
            }
            index += words_per_block;
        }
        assert_eq!(bytes_allocated, header.bytes_allocated);

        for i in frontier_index..WORDS_PER_CHUNK {
            // SAFETY: in-bounds chunk word.
            let w = unsafe { *words.add(i) };
            assert_eq!(w, 0, "frontier word {i} is nonzero");
            assert!(!ptr.at(i), "frontier word {i} has a pointer bit");
            assert!(!mark.at(i), "frontier word {i} has a mark bit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_is_aligned_and_zeroed() {
        let chunk = Chunk::map(64).expect("map chunk");
        assert_eq!(chunk.base() % CHUNK_SIZE, 0);
        assert_eq!(chunk.free_frontier(), chunk.data_start());
        assert_eq!(chunk.bytes_allocated(), 0);
        chunk.unmap();
    }

    #[test]
    fn allocate_bumps_frontier_then_uses_free_list() {
        let chunk = Chunk::map(32).expect("map chunk");
        let a = chunk.allocate().expect("first block");
        let b = chunk.allocate().expect("second block");
        assert_eq!(a, chunk.data_start());
        assert_eq!(b, a + 32);
        assert_eq!(chunk.bytes_allocated(), 64);

        // Mark only `b` live and sweep: `a` goes back on the free list.
        chunk.set_mark(b);
        chunk.sweep();
        assert_eq!(chunk.bytes_allocated(), 32);
        assert!(chunk.is_free_block(a));

        let c = chunk.allocate().expect("recycled block");
        assert_eq!(c, a);
        // Recycled blocks come back zeroed.
        // SAFETY: c is a live 32-byte block.
        unsafe {
            for i in 0..4 {
                assert_eq!(*((c + i * WORD_SIZE) as *const usize), 0);
            }
        }
        chunk.unmap();
    }

    #[test]
    fn sweep_expands_frontier_over_unmarked_tail() {
        let chunk = Chunk::map(64).expect("map chunk");
        let a = chunk.allocate().unwrap();
        let _b = chunk.allocate().unwrap();
        let _c = chunk.allocate().unwrap();
        chunk.set_mark(a);
        chunk.sweep();
        // b and c were the tail: the frontier swallows both.
        assert_eq!(chunk.free_frontier(), a + 64);
        assert_eq!(chunk.bytes_allocated(), 64);
        chunk.validate(&|_| true);
        chunk.unmap();
    }

    #[test]
    fn sweep_clears_pointer_bits_of_freed_blocks() {
        let chunk = Chunk::map(32).expect("map chunk");
        let a = chunk.allocate().unwrap();
        let b = chunk.allocate().unwrap();
        chunk.set_pointer(a, true);
        chunk.set_pointer(a + WORD_SIZE, true);
        chunk.set_pointer(b, true);
        chunk.set_mark(b);
        chunk.sweep();
        assert!(!chunk.is_pointer(a));
        assert!(!chunk.is_pointer(a + WORD_SIZE));
        assert!(chunk.is_pointer(b), "live block keeps its pointer bits");
        assert!(!chunk.is_marked(b), "mark bits are cleared after sweep");
        chunk.unmap();
    }

    #[test]
    fn block_containing_resolves_interior_pointers() {
        let chunk = Chunk::map(64).expect("map chunk");
        let a = chunk.allocate().unwrap();
        assert_eq!(chunk.block_containing(a), a);
        assert_eq!(chunk.block_containing(a + 40), a);
        assert_eq!(chunk.block_containing(a + 63), a);
        chunk.unmap();
    }
}
