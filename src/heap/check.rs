//! The heap-consistency checker.
//!
//! [`Heap::check`] walks the complete block sequence and the free list and
//! verifies every structural invariant the allocator maintains between two
//! operations. It is meant for tests and debugging sessions: a violation
//! means a bug in the allocator or in its client, and no recovery is
//! attempted.

use super::tags::Tag;
use super::{Heap, DWORD, MIN_BLOCK, NIL, WORD};

use core::mem;

/// A violation found by the heap-consistency checker.
///
/// The payload of most variants is the payload offset of the offending
/// block. Checking stops at the first violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    /// The prologue sentinel is not the allocated 8-byte block it was
    /// formatted as.
    BadPrologue,
    /// The epilogue sentinel is missing, free or not at the high water
    /// mark.
    BadEpilogue,
    /// A block whose header and footer words disagree.
    HeaderFooterMismatch(usize),
    /// A block whose payload is not 8-aligned.
    MisalignedBlock(usize),
    /// A block whose size is not a positive multiple of 8.
    BadBlockSize(usize),
    /// A block reaching past the arena break.
    OutOfBounds(usize),
    /// Two physically adjacent free blocks.
    UncoalescedBlocks(usize),
    /// A free block in the heap walk that the free list does not contain.
    UnlistedFreeBlock(usize),
    /// A free-list member whose block is marked allocated.
    ListedBlockNotFree(usize),
    /// A free-list node with an implausible offset or an inconsistent
    /// back link.
    BrokenListLink(usize),
    /// The free list and the heap walk disagree on the number of free
    /// blocks.
    FreeCountMismatch {
        /// Free blocks seen by the linear heap walk.
        walked: usize,
        /// Nodes seen by the free-list walk.
        listed: usize,
    },
}

impl<const N: usize> Heap<N> {
    /// Walk the whole heap and verify every structural invariant.
    ///
    /// Checked are: the sentinels, the exact tiling of the grown region,
    /// header/footer agreement, block alignment and size sanity, the
    /// absence of adjacent free blocks, and that the free list and the
    /// set of free blocks in the walk coincide, with consistent back
    /// links throughout. An uninitialized heap is trivially consistent.
    pub fn check(&self) -> Result<(), CheckError> {
        if !self.initialized {
            return Ok(());
        }
        let hi = self.arena.size();

        if self.tag(self.heap_start - WORD) != Tag::used(DWORD)
            || self.tag(self.heap_start) != Tag::used(DWORD)
        {
            return Err(CheckError::BadPrologue);
        }

        let mut bp = self.heap_start + DWORD;
        let mut walked = 0_usize;
        let mut prev_free = false;
        loop {
            let hdr_off = Self::header_at(bp);
            if hdr_off + WORD > hi {
                return Err(CheckError::OutOfBounds(bp));
            }
            let hdr = self.tag(hdr_off);
            if hdr.size() == 0 {
                if !hdr.is_used() || hdr_off != hi - WORD {
                    return Err(CheckError::BadEpilogue);
                }
                break;
            }
            if bp % DWORD != 0 {
                return Err(CheckError::MisalignedBlock(bp));
            }
            if hdr.size() % DWORD != 0 || hdr.size() < 2 * DWORD {
                return Err(CheckError::BadBlockSize(bp));
            }
            if bp + hdr.size() > hi {
                return Err(CheckError::OutOfBounds(bp));
            }
            if self.tag(bp + hdr.size() - DWORD) != hdr {
                return Err(CheckError::HeaderFooterMismatch(bp));
            }
            if !hdr.is_used() {
                if prev_free {
                    return Err(CheckError::UncoalescedBlocks(bp));
                }
                if !self.listed(bp) {
                    return Err(CheckError::UnlistedFreeBlock(bp));
                }
                walked += 1;
            }
            prev_free = !hdr.is_used();
            bp += hdr.size();
        }

        // the list has to mirror the walk: every node free, back links
        // consistent, no extra members
        let mut listed = 0_usize;
        let mut prev = NIL;
        let mut bp = self.free_head;
        while bp != NIL {
            if !self.plausible_node(bp) || self.prev_link(bp) != prev {
                return Err(CheckError::BrokenListLink(bp));
            }
            if self.tag(Self::header_at(bp)).is_used() {
                return Err(CheckError::ListedBlockNotFree(bp));
            }
            listed += 1;
            if listed > walked {
                return Err(CheckError::FreeCountMismatch { walked, listed });
            }
            prev = bp;
            bp = self.next_link(bp);
        }
        if listed != walked {
            return Err(CheckError::FreeCountMismatch { walked, listed });
        }
        Ok(())
    }

    /// Linear scan of the free list for `bp`, bounded so that a link
    /// cycle cannot hang the checker.
    fn listed(&self, bp: usize) -> bool {
        let cap = self.arena.size() / MIN_BLOCK + 1;
        let mut cur = self.free_head;
        let mut steps = 0;
        while cur != NIL && steps <= cap {
            if !self.plausible_node(cur) {
                return false;
            }
            if cur == bp {
                return true;
            }
            steps += 1;
            cur = self.next_link(cur);
        }
        false
    }

    /// Whether `bp` can be read as a free-list node at all.
    fn plausible_node(&self, bp: usize) -> bool {
        bp % DWORD == 0
            && bp >= self.heap_start + DWORD
            && bp + 2 * mem::size_of::<usize>() <= self.arena.size()
    }
}
