//! Boundary-tag memory allocator with an explicit free list
//!
//! This crate provides a single type called [`Allocator`]: a classic
//! malloc-style heap over a fixed, process-private byte arena. It
//! implements the [`core::alloc::GlobalAlloc`]-trait, so it can back the
//! [`alloc`-crate][alloc] on `#![no_std]`-targets, and it additionally
//! exposes the underlying `malloc`/`free`/`realloc` surface directly for
//! programs that want the C-style triad without going through `Layout`.
//!
//! # Usage
//! Copy and paste the following code snippet into your binary crate and
//! potentially adjust the number of bytes of the heap (here 64K):
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: tagalloc::Allocator<{ 64 * 1024 }> = tagalloc::Allocator::new();
//!
//! extern crate alloc;
//! ```
//! The heap sets itself up lazily on the first allocation, so no further
//! interaction with the variable `ALLOCATOR` is necessary. When using the
//! malloc-style surface directly, call [`Allocator::init`] once up front
//! instead:
//! ```
//! let allocator = tagalloc::Allocator::<8192>::new();
//! allocator.init().unwrap();
//!
//! let p = allocator.malloc(100);
//! assert!(!p.is_null());
//! assert_eq!(p as usize % 8, 0);
//! allocator.free(p).unwrap();
//! ```
//! The arena size must be a multiple of 8 in `4112..=8388608`: the lower
//! bound is the bookkeeping laid down by `init` (16 bytes of sentinels
//! plus one 4096-byte chunk), the upper bound is a hard cap of the arena
//! ([`MAX_ARENA`]).
//!
//! # Implementation
//! The arena is grown brk-style in chunks and carved into a sequence of
//! abutting blocks. Every block carries its size and an allocated bit
//! twice, in a 4-byte *header* and an identical 4-byte *footer*, so both
//! physical neighbors of a block can be reached with plain arithmetic.
//! Right after setup, with one 24-byte block allocated out of the first
//! chunk, the heap looks like this:
//!
//! ```text
//!     offset    0     4      8      12     16        32     36
//!               +-----+------+------+------+---------+------+------+----
//!               | pad | 8|1  | 8|1  | 24|1 | payload | 24|1 | 4072 | ...
//!               +-----+------+------+------+---------+------+------+----
//!                     ^~~~ prologue ^ hdr  ^ 16 bytes ^ ftr ^ next block
//!
//!     ... ------+------------------+--------+------+
//!               | next prev (free) | 4072   | 0|1  |
//!     ... ------+------------------+--------+------+
//!               ^ link words       ^ footer ^ epilogue header
//! ```
//!
//! The prologue (a permanently allocated 8-byte block) and the epilogue
//! (an allocated zero-size header rewritten on every growth) bound the
//! sequence, so merging never has to special-case the ends of the heap.
//!
//! The free blocks additionally form a doubly-linked list, threaded
//! through the first two machine words of their payloads. Allocation
//! takes the *first* list member that fits and splits off the tail of the
//! block if the residue is big enough to be useful (24 bytes on 64-bit
//! targets). Freeing marks the block and immediately merges it with any
//! free physical neighbor, unlinking the absorbed blocks and pushing the
//! result onto the list head. This keeps the invariant that no two
//! adjacent blocks are ever both free, so fragmentation only stems from
//! allocation order, never from missed merges.
//!
//! Payloads are always 8-aligned. Requests with a stricter alignment are
//! served by over-allocating `align` extra bytes and sliding the returned
//! pointer up; [`Allocator::free`] therefore accepts any pointer *into* a
//! live payload, not just its start, and reports stray or doubly-freed
//! pointers instead of corrupting the heap.
//!
//! For debugging there is [`Allocator::check`]: a full walk over both the
//! block sequence and the free list that verifies every structural
//! invariant and reports the first violation.
//!
//! [alloc]: https://doc.rust-lang.org/alloc/index.html
#![cfg_attr(not(test), no_std)]
#![warn(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

mod heap;

pub use heap::{CheckError, FreeError, OutOfMemory, MAX_ARENA};

use heap::Heap;

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

/// The memory allocator for a fixed arena of `N` bytes.
///
/// This is the core type of this crate: a first-fit, boundary-tag,
/// explicit-free-list allocator with a predefined heap size. The heap
/// memory usage is statically limited to an upper value, which also helps
/// to prevent issues with heap/stack-smashes, as the heap is counted to
/// the static memory (e.g. `.data`/`.bss`-sections). Such a smash might
/// still happen though, if the stack pointer grows into the heap, but the
/// heap cannot grow into the stack pointer.
///
/// Its usage is simple: just copy and paste the following in the binary
/// crate you're developing. The memory size of the heap is `65536` or 64K
/// in this example. Adjust that value to your needs.
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: tagalloc::Allocator<{ 64 * 1024 }> = tagalloc::Allocator::new();
/// ```
/// Also please refer to the [crate-level](crate)-documentation for the
/// heap layout and general usage.
pub struct Allocator<const N: usize> {
    /// The internal heap engine.
    ///
    /// The engine handles the block bookkeeping in terms of arena offsets
    /// and is strictly single-threaded. It is protected by a
    /// `spin::Mutex` to make it usable with shared references
    /// (requirement of [`GlobalAlloc`]).
    heap: spin::Mutex<Heap<N>>,
}

impl<const N: usize> Allocator<N> {
    /// Create a new [`Allocator`].
    ///
    /// This function is a `const fn`, therefore you can call it directly
    /// when creating the allocator.
    ///
    /// # Panics
    /// This function will panic, if the supplied arena size, i.e. `N` is
    /// less than `4112` (sentinels plus one initial chunk), not divisible
    /// by `8` or larger than 8 MiB.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Self {
        assert!(
            N >= heap::INIT_FOOTPRINT,
            "too small heap memory: minimum size is 4112"
        );
        assert!(N % 8 == 0, "memory size has to be divisible by 8");
        assert!(N <= MAX_ARENA, "arena larger than 8 MiB is not supported");

        let heap = spin::Mutex::new(Heap::new());
        Self { heap }
    }

    /// Set up the empty heap: sentinels plus one free 4096-byte chunk.
    ///
    /// Has to be called once before using the malloc-style surface. A
    /// later call tears the whole heap down and re-initializes it from
    /// scratch, leaving every previously returned pointer dangling.
    /// Allocations through [`GlobalAlloc`] run this lazily instead.
    pub fn init(&self) -> Result<(), OutOfMemory> {
        self.heap.lock().init()
    }

    /// Allocate a block of at least `size` bytes.
    ///
    /// The returned pointer is 8-aligned and stays valid until it is
    /// passed to [`Allocator::free`]. Null is returned for zero-size
    /// requests, before [`Allocator::init`] and when the arena is
    /// exhausted.
    pub fn malloc(&self, size: usize) -> *mut u8 {
        let mut heap = self.heap.lock();
        match heap.malloc(size) {
            Some(bp) => heap.payload_ptr(bp),
            None => ptr::null_mut(),
        }
    }

    /// Release an allocated block.
    ///
    /// `ptr` may point anywhere *into* the block's payload, which makes
    /// this safe to call with the adjusted pointers handed out for
    /// over-aligned [`GlobalAlloc`]-requests. Freeing null is a no-op.
    /// Pointers that do not belong to a live block are reported as
    /// [`FreeError`] and leave the heap untouched.
    pub fn free(&self, ptr: *mut u8) -> Result<(), FreeError> {
        if ptr.is_null() {
            return Ok(());
        }
        let mut heap = self.heap.lock();
        let offset = heap.offset_of(ptr).ok_or(FreeError::AllocationNotFound)?;
        let bp = heap.resolve_payload(offset)?;
        heap.free(bp);
        Ok(())
    }

    /// Resize an allocated block to at least `size` bytes, moving it.
    ///
    /// The common prefix of the old and new payload is preserved. A null
    /// `ptr` behaves like [`Allocator::malloc`], a zero `size` frees the
    /// block and returns null. On failure (arena exhausted or `ptr` not
    /// recognized) null is returned and the old block stays valid.
    pub fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.malloc(size);
        }
        if size == 0 {
            let _ = self.free(ptr);
            return ptr::null_mut();
        }

        let mut heap = self.heap.lock();
        let resolved = heap
            .offset_of(ptr)
            .ok_or(FreeError::AllocationNotFound)
            .and_then(|offset| heap.resolve_payload(offset));
        match resolved {
            Ok(bp) => match heap.realloc(bp, size) {
                Some(new_bp) => heap.payload_ptr(new_bp),
                None => ptr::null_mut(),
            },
            Err(_) => ptr::null_mut(),
        }
    }

    /// Walk the whole heap and verify every structural invariant.
    ///
    /// Returns the first violation found, if any. Intended for tests and
    /// debugging; a reported violation means a bug in the allocator or a
    /// stray write of its client, and the heap is beyond repair at that
    /// point.
    pub fn check(&self) -> Result<(), CheckError> {
        self.heap.lock().check()
    }

    /// The advisory page size of the backing arena. Purely a hint.
    pub fn pagesize(&self) -> usize {
        self.heap.lock().pagesize()
    }

    /// Align a given pointer to the specified alignment.
    ///
    /// # Safety
    /// This function requires `align` to be a power of two and requires
    /// the `ptr` to point to a memory region, that is large enough, so
    /// that the aligned pointer is still in that memory region.
    unsafe fn align_to(ptr: *mut u8, align: usize) -> *mut u8 {
        let addr = ptr as usize;
        let mismatch = addr & (align - 1);
        let offset = if mismatch != 0 { align - mismatch } else { 0 };
        // SAFETY: "in-bound"-requirement is part of the safety-contract of
        // this function, therefore the caller is responsible for it
        unsafe { ptr.add(offset) }
    }
}

// SAFETY: the safety contracts of global allocator is a bit lengthy, but
// in short: the implementation does not panic (at least on purpose, if it
// would, there is a bug) and it actually adheres to the layout
// requirements (ensured by tests).
unsafe impl<const N: usize> GlobalAlloc for Allocator<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let align = layout.align();
        // the heap always returns 8-byte-aligned payloads, therefore
        // smaller alignments are always fulfilled. Larger alignments are a
        // bit more tricky, since this requires over-allocation and
        // adjusting the pointer accordingly. The over-allocation is rather
        // conservative and uses a worst case estimation, therefore it
        // allocates `align` bytes more, ensuring there is enough memory.
        let size = if align > 8 {
            layout.size() + align
        } else {
            layout.size()
        };

        let mut heap = self.heap.lock();
        if !heap.is_initialized() && heap.init().is_err() {
            return ptr::null_mut();
        }
        match heap.malloc(size) {
            // SAFETY: `align` is a power of two as by the contract of
            // `Layout`. Furthermore the block is enlarged (see above), so
            // that the aligned pointer will still be in the same
            // allocation.
            Some(bp) => unsafe { Self::align_to(heap.payload_ptr(bp), align) },
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // `free()` resolves any pointer into a block's payload, so the
        // alignment adjustment of `alloc` needs no undoing here. Errors
        // cannot lead to panics (by contract of `GlobalAlloc`), so they
        // are ignored.
        let _maybe_error = self.free(ptr).ok();
    }
}
