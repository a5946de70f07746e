//! This module provides the heap engine and its support types.
//!
//! The engine carves the arena into a sequence of abutting blocks, each
//! framed by a pair of boundary-tag words (see [`tags`]), and threads a
//! doubly-linked list through the payloads of the free ones. Allocation is
//! a first-fit scan of that list with a split of the residue; freeing
//! immediately merges the block with any free physical neighbor. Blocks
//! are named by the byte offset of their payload into the arena, never by
//! address, so all navigation is plain offset arithmetic.

mod arena;
mod check;
mod tags;

pub use arena::MAX_ARENA;
pub use check::CheckError;

use arena::Arena;
use tags::Tag;

use core::mem;

/// One boundary-tag word.
const WORD: usize = 4;

/// A header/footer pair; also the alignment of every block and payload.
const DWORD: usize = 8;

/// Default arena growth in bytes. Requests larger than this grow the
/// arena by exactly their adjusted size instead.
const CHUNK: usize = 4096;

/// The null link. Offset 0 is the alignment pad below the prologue and
/// never names a payload.
const NIL: usize = 0;

/// The smallest block that can carry header, footer and the two free-list
/// links: 24 bytes on 64-bit targets, 16 on 32-bit ones. Residues below
/// this size are not split off.
pub(crate) const MIN_BLOCK: usize =
    (DWORD + 2 * mem::size_of::<usize>() + (DWORD - 1)) & !(DWORD - 1);

/// Bytes taken from the arena by [`Heap::init`]: the pad/sentinel region
/// plus the initial free chunk.
pub(crate) const INIT_FOOTPRINT: usize = 2 * DWORD + CHUNK;

/// The arena could not satisfy a growth request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

/// An error occurred when calling `free()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    /// There is a double-free detected: the pointer refers into a block
    /// that is already free.
    DoubleFreeDetected,
    /// An invalid pointer was freed up (either a pointer outside of the
    /// heap memory or a pointer into the block metadata).
    AllocationNotFound,
}

/// Map a requested payload size to an internal block size.
///
/// Zero-byte requests are rejected. Requests up to 8 bytes take the
/// 16-byte floor; larger ones get the 8 bytes of header and footer added
/// and are rounded up to the next multiple of 8.
const fn adjust(size: usize) -> Option<usize> {
    if size == 0 {
        None
    } else if size <= DWORD {
        Some(2 * DWORD)
    } else {
        match size.checked_add(DWORD + (DWORD - 1)) {
            Some(padded) => Some(padded & !(DWORD - 1)),
            None => None,
        }
    }
}

/// The heap engine: block formatting, free-list bookkeeping and the
/// allocate/free/resize triad, all in terms of arena offsets.
///
/// The engine is single-threaded and runs every operation to completion;
/// shared use has to be serialized externally (the public [`Allocator`]
/// does so with a spin mutex).
///
/// [`Allocator`]: crate::Allocator
pub struct Heap<const N: usize> {
    arena: Arena<N>,
    /// Offset of the prologue payload, the anchor of every heap walk.
    heap_start: usize,
    /// Offset of the first free block, or [`NIL`].
    free_head: usize,
    initialized: bool,
}

impl<const N: usize> Heap<N> {
    /// Create a new, uninitialized heap.
    ///
    /// # Panics
    /// This function panics if the arena capacity `N` is not divisible by
    /// 8 or exceeds [`MAX_ARENA`].
    pub const fn new() -> Self {
        Self {
            arena: Arena::new(),
            heap_start: 0,
            free_head: NIL,
            initialized: false,
        }
    }

    /// Whether [`Heap::init`] has completed on this heap.
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Set up the empty heap: reset the arena, lay down the sentinels and
    /// grow the first free chunk.
    ///
    /// The bottom of the arena is formatted as one pad word, the 8-byte
    /// prologue block and the epilogue header:
    ///
    /// ```text
    ///  0: pad           = 0
    ///  4: prologue hdr  = (8 | 1)
    ///  8: prologue ftr  = (8 | 1)
    /// 12: epilogue hdr  = (0 | 1)
    /// ```
    ///
    /// The prologue is the permanent "previous" neighbor of the first real
    /// block and the epilogue the "next" neighbor of the last one, so the
    /// coalescer never has to special-case the heap boundaries.
    pub fn init(&mut self) -> Result<(), OutOfMemory> {
        self.arena.reset();
        self.free_head = NIL;
        self.initialized = false;

        let start = self
            .arena
            .extend((2 * DWORD) as i32)
            .ok_or(OutOfMemory)?;
        self.arena.set_word_at(start, 0);
        self.set_tag(start + WORD, Tag::used(DWORD));
        self.set_tag(start + 2 * WORD, Tag::used(DWORD));
        self.set_tag(start + 3 * WORD, Tag::used(0));
        self.heap_start = start + 2 * WORD;

        if self.extend_heap(CHUNK / WORD).is_none() {
            return Err(OutOfMemory);
        }
        self.initialized = true;
        Ok(())
    }

    /// Allocate a block with at least `size` payload bytes.
    ///
    /// Returns the payload offset of the block, which is always a multiple
    /// of 8. Fails for zero-size requests, on an uninitialized heap and
    /// when the arena is exhausted.
    pub fn malloc(&mut self, size: usize) -> Option<usize> {
        if !self.initialized {
            return None;
        }
        let asize = adjust(size)?;

        if let Some(bp) = self.find_fit(asize) {
            self.place(bp, asize);
            return Some(bp);
        }

        let grow = if asize > CHUNK { asize } else { CHUNK };
        let bp = self.extend_heap(grow / WORD)?;
        self.place(bp, asize);
        Some(bp)
    }

    /// Release the block with payload offset `bp`.
    ///
    /// `bp` must be a payload offset previously returned by
    /// [`Heap::malloc`] or [`Heap::realloc`] and still live; callers with
    /// untrusted pointers resolve them via [`Heap::resolve_payload`]
    /// first.
    pub fn free(&mut self, bp: usize) {
        let size = self.block_size(bp);
        self.set_tag(Self::header_at(bp), Tag::free(size));
        self.set_tag(self.footer_at(bp), Tag::free(size));
        self.coalesce(bp);
    }

    /// Resize the block at `bp` to at least `size` payload bytes.
    ///
    /// Always moves: a fresh block is allocated, the common prefix of the
    /// payloads is copied over and the old block is freed. On failure the
    /// old block is left untouched.
    pub fn realloc(&mut self, bp: usize, size: usize) -> Option<usize> {
        let new_bp = self.malloc(size)?;
        let old_payload = self.block_size(bp) - DWORD;
        self.arena.copy(new_bp, bp, size.min(old_payload));
        self.free(bp);
        Some(new_bp)
    }

    /// Find the live block whose payload contains `offset`.
    ///
    /// Walks the block sequence from the bottom of the heap. Offsets into
    /// headers, footers or the sentinels resolve to nothing; offsets into
    /// a free block report the double free.
    pub fn resolve_payload(&self, offset: usize) -> Result<usize, FreeError> {
        if !self.initialized {
            return Err(FreeError::AllocationNotFound);
        }
        let mut bp = self.heap_start + DWORD;
        loop {
            let size = self.block_size(bp);
            if size == 0 {
                return Err(FreeError::AllocationNotFound);
            }
            if offset >= bp && offset < bp + size - DWORD {
                return if self.tag(Self::header_at(bp)).is_used() {
                    Ok(bp)
                } else {
                    Err(FreeError::DoubleFreeDetected)
                };
            }
            bp += size;
        }
    }

    /// A raw pointer to the payload at offset `bp`.
    pub fn payload_ptr(&mut self, bp: usize) -> *mut u8 {
        self.arena.ptr_at(bp)
    }

    /// Translate an address back into a payload offset candidate.
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        self.arena.offset_of(ptr)
    }

    /// The advisory page size of the backing arena.
    pub const fn pagesize(&self) -> usize {
        self.arena.pagesize()
    }

    /// Grow the heap by `words` 4-byte words, rounded up to keep the byte
    /// count 8-aligned, and format the new region as one free block.
    ///
    /// The word below the old break is the previous epilogue header; it
    /// becomes the header of the new block, and a fresh epilogue is
    /// written at the new break. The new block is merged backward in case
    /// the old last block was free.
    fn extend_heap(&mut self, words: usize) -> Option<usize> {
        let words = if words % 2 == 1 { words + 1 } else { words };
        let bytes = words.checked_mul(WORD)?;
        let incr = i32::try_from(bytes).ok()?;
        let bp = self.arena.extend(incr)?;

        self.set_tag(Self::header_at(bp), Tag::free(bytes));
        self.set_tag(self.footer_at(bp), Tag::free(bytes));
        self.set_tag(Self::header_at(bp + bytes), Tag::used(0));

        Some(self.coalesce(bp))
    }

    /// First-fit scan of the free list.
    fn find_fit(&self, asize: usize) -> Option<usize> {
        let mut bp = self.free_head;
        while bp != NIL {
            if self.block_size(bp) >= asize {
                return Some(bp);
            }
            bp = self.next_link(bp);
        }
        None
    }

    /// Allocate `asize` bytes inside the free block at `bp`.
    ///
    /// The block is unlinked and marked used. If the residue would make a
    /// viable free block it is split off and re-listed; otherwise the
    /// whole block is handed out.
    fn place(&mut self, bp: usize, asize: usize) {
        let csize = self.block_size(bp);
        self.unlink(bp);

        if csize - asize >= MIN_BLOCK {
            self.set_tag(Self::header_at(bp), Tag::used(asize));
            self.set_tag(self.footer_at(bp), Tag::used(asize));
            let rest = bp + asize;
            self.set_tag(Self::header_at(rest), Tag::free(csize - asize));
            self.set_tag(self.footer_at(rest), Tag::free(csize - asize));
            self.push_front(rest);
        } else {
            self.set_tag(Self::header_at(bp), Tag::used(csize));
            self.set_tag(self.footer_at(bp), Tag::used(csize));
        }
    }

    /// Merge the free block at `bp` with its free physical neighbors and
    /// LIFO-insert the result into the free list.
    ///
    /// Precondition: `bp`'s header and footer are already marked free and
    /// the block is not in the list. The previous neighbor is resolved
    /// before any tag of `bp` is rewritten, and neighbors are unlinked
    /// before the merged sizes go in.
    fn coalesce(&mut self, mut bp: usize) -> usize {
        let prev_used = self.tag(bp - DWORD).is_used();
        let next = self.next_block(bp);
        let next_used = self.tag(Self::header_at(next)).is_used();
        let size = self.block_size(bp);

        match (prev_used, next_used) {
            (true, true) => {}
            (true, false) => {
                let merged = size + self.block_size(next);
                self.unlink(next);
                self.set_tag(Self::header_at(bp), Tag::free(merged));
                self.set_tag(self.footer_at(bp), Tag::free(merged));
            }
            (false, true) => {
                let prev = self.prev_block(bp);
                let merged = self.block_size(prev) + size;
                self.unlink(prev);
                self.set_tag(Self::header_at(prev), Tag::free(merged));
                self.set_tag(self.footer_at(prev), Tag::free(merged));
                bp = prev;
            }
            (false, false) => {
                let prev = self.prev_block(bp);
                let merged = self.block_size(prev) + size + self.block_size(next);
                self.unlink(prev);
                self.unlink(next);
                self.set_tag(Self::header_at(prev), Tag::free(merged));
                self.set_tag(self.footer_at(prev), Tag::free(merged));
                bp = prev;
            }
        }

        self.push_front(bp);
        bp
    }

    /// LIFO-insert `bp` at the head of the free list.
    fn push_front(&mut self, bp: usize) {
        let head = self.free_head;
        self.set_next_link(bp, head);
        self.set_prev_link(bp, NIL);
        if head != NIL {
            self.set_prev_link(head, bp);
        }
        self.free_head = bp;
    }

    /// Unlink `bp` from the free list. Its link fields are stale
    /// afterwards and must not be read again.
    fn unlink(&mut self, bp: usize) {
        let prev = self.prev_link(bp);
        let next = self.next_link(bp);
        if prev == NIL {
            self.free_head = next;
        } else {
            self.set_next_link(prev, next);
        }
        if next != NIL {
            self.set_prev_link(next, prev);
        }
    }

    fn tag(&self, word_offset: usize) -> Tag {
        Tag::from_raw(self.arena.word_at(word_offset))
    }

    fn set_tag(&mut self, word_offset: usize, tag: Tag) {
        self.arena.set_word_at(word_offset, tag.as_raw());
    }

    /// Offset of the header word of the block with payload `bp`.
    const fn header_at(bp: usize) -> usize {
        bp - WORD
    }

    /// Offset of the footer word of the block with payload `bp`.
    fn footer_at(&self, bp: usize) -> usize {
        bp + self.block_size(bp) - DWORD
    }

    /// Total size of the block with payload `bp`.
    fn block_size(&self, bp: usize) -> usize {
        self.tag(Self::header_at(bp)).size()
    }

    /// Payload offset of the physically next block.
    fn next_block(&self, bp: usize) -> usize {
        bp + self.block_size(bp)
    }

    /// Payload offset of the physically previous block, read from its
    /// footer directly below `bp`'s header.
    fn prev_block(&self, bp: usize) -> usize {
        bp - self.tag(bp - DWORD).size()
    }

    fn next_link(&self, bp: usize) -> usize {
        self.arena.link_at(bp)
    }

    fn prev_link(&self, bp: usize) -> usize {
        self.arena.link_at(bp + mem::size_of::<usize>())
    }

    fn set_next_link(&mut self, bp: usize, link: usize) {
        self.arena.set_link_at(bp, link);
    }

    fn set_prev_link(&mut self, bp: usize, link: usize) {
        self.arena.set_link_at(bp + mem::size_of::<usize>(), link);
    }
}

#[cfg(test)]
mod tests {
    use super::{adjust, FreeError, Heap, Tag, CHUNK, DWORD, NIL};

    /// Payload offset of the first real block after `init`.
    const FIRST: usize = 16;

    fn fresh() -> Heap<8192> {
        let mut heap = Heap::new();
        heap.init().unwrap();
        heap
    }

    #[test]
    fn init_lays_out_sentinels_and_first_block() {
        let heap = fresh();

        assert_eq!(heap.heap_start, 8);
        assert_eq!(heap.tag(4), Tag::used(8));
        assert_eq!(heap.tag(8), Tag::used(8));

        // one free chunk, framed by matching tags, epilogue at the break
        assert_eq!(heap.free_head, FIRST);
        assert_eq!(heap.tag(12), Tag::free(CHUNK));
        assert_eq!(heap.tag(heap.footer_at(FIRST)), Tag::free(CHUNK));
        assert_eq!(heap.arena.size(), 16 + CHUNK);
        assert_eq!(heap.tag(heap.arena.size() - 4), Tag::used(0));

        heap.check().unwrap();
    }

    #[test]
    fn adjust_rounds_requests() {
        assert_eq!(adjust(0), None);
        assert_eq!(adjust(1), Some(16));
        assert_eq!(adjust(8), Some(16));
        assert_eq!(adjust(9), Some(24));
        assert_eq!(adjust(16), Some(24));
        assert_eq!(adjust(17), Some(32));
        assert_eq!(adjust(1024), Some(1032));
        assert_eq!(adjust(usize::MAX), None);
    }

    #[test]
    fn malloc_rejects_zero_size_requests() {
        let mut heap = fresh();
        assert_eq!(heap.malloc(0), None);
        heap.check().unwrap();
    }

    #[test]
    fn malloc_rejects_uninitialized_heaps() {
        let mut heap = Heap::<8192>::new();
        assert_eq!(heap.malloc(8), None);
    }

    #[test]
    fn payloads_are_eight_byte_aligned() {
        let mut heap = fresh();
        for size in [1, 2, 3, 7, 8, 9, 31, 64, 100] {
            let bp = heap.malloc(size).unwrap();
            assert_eq!(bp % DWORD, 0);
        }
        heap.check().unwrap();
    }

    #[test]
    fn first_fit_splits_the_first_large_enough_block() {
        let mut heap = fresh();
        let a = heap.malloc(64).unwrap();
        let _b = heap.malloc(64).unwrap();
        heap.free(a);

        // the freed 72-byte block is at the list head and serves the next
        // small request, with the residue split off and re-listed
        let c = heap.malloc(8).unwrap();
        assert_eq!(c, a);
        assert_eq!(heap.block_size(c), 16);
        assert_eq!(heap.free_head, a + 16);
        assert_eq!(heap.block_size(a + 16), 56);

        heap.check().unwrap();
    }

    #[test]
    fn placement_skips_the_split_for_small_residues() {
        let mut heap = fresh();
        let a = heap.malloc(64).unwrap();
        let _b = heap.malloc(64).unwrap();
        heap.free(a);

        // 56 bytes need a 64-byte block; the 8-byte residue of the
        // 72-byte hole is below the minimum block size
        let c = heap.malloc(56).unwrap();
        assert_eq!(c, a);
        assert_eq!(heap.block_size(c), 72);

        heap.check().unwrap();
    }

    #[test]
    fn just_freed_block_is_reused_first() {
        let mut heap = fresh();
        let _a = heap.malloc(64).unwrap();
        let b = heap.malloc(64).unwrap();
        let _c = heap.malloc(64).unwrap();
        heap.free(b);

        let d = heap.malloc(64).unwrap();
        assert_eq!(d, b);
        heap.check().unwrap();
    }

    #[test]
    fn free_merges_with_the_next_block() {
        let mut heap = fresh();
        let a = heap.malloc(64).unwrap();
        let b = heap.malloc(64).unwrap();
        let _c = heap.malloc(64).unwrap();

        heap.free(b);
        heap.free(a);

        assert_eq!(heap.free_head, a);
        assert_eq!(heap.block_size(a), 144);
        heap.check().unwrap();
    }

    #[test]
    fn free_merges_with_the_previous_block() {
        let mut heap = fresh();
        let a = heap.malloc(64).unwrap();
        let b = heap.malloc(64).unwrap();
        let _c = heap.malloc(64).unwrap();

        heap.free(a);
        heap.free(b);

        assert_eq!(heap.free_head, a);
        assert_eq!(heap.block_size(a), 144);
        heap.check().unwrap();
    }

    #[test]
    fn free_merges_with_both_neighbors() {
        let mut heap = fresh();
        let a = heap.malloc(64).unwrap();
        let b = heap.malloc(64).unwrap();

        heap.free(a);
        heap.free(b);

        // the two blocks and the split residue collapse back into the one
        // initial chunk
        assert_eq!(heap.free_head, a);
        assert_eq!(heap.block_size(a), CHUNK);
        assert_eq!(heap.next_link(a), NIL);
        assert_eq!(heap.tag(heap.epilogue_header()), Tag::used(0));
        heap.check().unwrap();
    }

    #[test]
    fn growth_merges_with_the_trailing_free_block() {
        let mut heap = Heap::<16384>::new();
        heap.init().unwrap();

        let a = heap.malloc(6000).unwrap();
        assert_eq!(a, FIRST);
        assert_eq!(heap.block_size(a), 6008);
        assert_eq!(heap.arena.size(), 16 + CHUNK + 6008);

        // the residue of the merged initial chunk survives as one block
        assert_eq!(heap.free_head, a + 6008);
        assert_eq!(heap.block_size(a + 6008), CHUNK);
        heap.check().unwrap();
    }

    #[test]
    fn exhaustion_is_reported_and_harmless() {
        let mut heap = fresh();
        assert_eq!(heap.malloc(8000), None);

        // the failed growth mutated nothing; small requests still work
        let a = heap.malloc(64).unwrap();
        assert_eq!(a, FIRST);
        heap.check().unwrap();
    }

    #[test]
    fn free_restores_the_initial_state() {
        let mut heap = fresh();
        let a = heap.malloc(8).unwrap();
        heap.free(a);

        assert_eq!(heap.free_head, FIRST);
        assert_eq!(heap.block_size(FIRST), CHUNK);
        heap.check().unwrap();
    }

    #[test]
    fn realloc_moves_and_preserves_the_payload() {
        let mut heap = fresh();
        let a = heap.malloc(16).unwrap();
        unsafe { heap.payload_ptr(a).write_bytes(0xAB, 16) };

        let b = heap.realloc(a, 100).unwrap();
        assert_ne!(a, b);
        for i in 0..16 {
            assert_eq!(unsafe { heap.payload_ptr(b).add(i).read() }, 0xAB);
        }
        heap.check().unwrap();
    }

    #[test]
    fn realloc_shrink_keeps_the_prefix() {
        let mut heap = fresh();
        let a = heap.malloc(64).unwrap();
        for i in 0..64 {
            unsafe { heap.payload_ptr(a).add(i).write(i as u8) };
        }

        let b = heap.realloc(a, 8).unwrap();
        assert_eq!(heap.block_size(b), 16);
        for i in 0..8 {
            assert_eq!(unsafe { heap.payload_ptr(b).add(i).read() }, i as u8);
        }
        heap.check().unwrap();
    }

    #[test]
    fn resolve_payload_finds_live_blocks() {
        let mut heap = fresh();
        let a = heap.malloc(64).unwrap();
        let b = heap.malloc(64).unwrap();

        assert_eq!(heap.resolve_payload(a), Ok(a));
        assert_eq!(heap.resolve_payload(b + 17), Ok(b));
    }

    #[test]
    fn resolve_payload_rejects_metadata_offsets() {
        let mut heap = fresh();
        let a = heap.malloc(64).unwrap();

        // header word and prologue are not payload
        assert_eq!(
            heap.resolve_payload(a - 4),
            Err(FreeError::AllocationNotFound)
        );
        assert_eq!(
            heap.resolve_payload(heap.heap_start),
            Err(FreeError::AllocationNotFound)
        );
    }

    #[test]
    fn resolve_payload_detects_double_frees() {
        let mut heap = fresh();
        let a = heap.malloc(64).unwrap();
        let _b = heap.malloc(64).unwrap();
        heap.free(a);

        assert_eq!(
            heap.resolve_payload(a),
            Err(FreeError::DoubleFreeDetected)
        );
    }

    #[test]
    fn reinit_resets_the_heap() {
        let mut heap = fresh();
        heap.malloc(64).unwrap();
        heap.malloc(1000).unwrap();

        heap.init().unwrap();
        assert_eq!(heap.arena.size(), 16 + CHUNK);
        assert_eq!(heap.free_head, FIRST);
        assert_eq!(heap.block_size(FIRST), CHUNK);
        heap.check().unwrap();
    }

    impl<const N: usize> Heap<N> {
        fn epilogue_header(&self) -> usize {
            self.arena.size() - 4
        }
    }
}
