//! Block headers and the split/coalesce algorithm.
//!
//! Every allocation unit starts with a [`BlockHeader`] written directly into
//! the arena, immediately followed by its payload. Headers are chained in
//! ascending address order and cover the block region without gaps:
//!
//! ```text
//! base     first                                                   end
//! ┌───────┬────────┬─────────────┬────────┬─────────┬────────┬──────┐
//! │ Heap  │ header │ payload     │ header │ payload │ header │ ...  │
//! └───────┴────────┴─────────────┴────────┴─────────┴────────┴──────┘
//!          ◀──────── prev / next links are offsets from base ───────▶
//! ```
//!
//! Links are byte offsets from the arena base rather than addresses. Offset
//! zero is the heap object itself and never a block, so `None` fits in the
//! niche of [`NonZeroUsize`]. Every offset is checked against the arena
//! bounds before a header is touched.

use core::{num::NonZeroUsize, ptr::NonNull};

use snafu::{OptionExt as _, ensure};

use crate::{
    arena::{ALIGN, is_aligned},
    error::{ChainError, FreeError, chain_error, free_error},
};

/// Validity key of a live block header.
const BLOCK_KEY: usize = 0x1982_0401;

/// Attribute bit of a block handed out by the allocator.
const ATTR_USED: usize = 0x0000_0001;

/// Control header of one allocation unit.
#[repr(C, align(8))]
#[derive(Debug)]
struct BlockHeader {
    prev: Option<NonZeroUsize>,
    next: Option<NonZeroUsize>,
    attr: usize,
    /// Payload size in bytes, excluding this header.
    size: usize,
    key: usize,
}

/// Size of a block header in bytes.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();
const _: () = assert!(HEADER_SIZE % ALIGN == 0);
const _: () = assert!(align_of::<BlockHeader>() == ALIGN);

impl BlockHeader {
    const fn free(size: usize, prev: Option<NonZeroUsize>, next: Option<NonZeroUsize>) -> Self {
        Self {
            prev,
            next,
            attr: 0,
            size,
            key: BLOCK_KEY,
        }
    }

    fn is_used(&self) -> bool {
        self.attr & ATTR_USED != 0
    }
}

/// A snapshot of one block, as reported by
/// [`Heap::for_each_block`](crate::Heap::for_each_block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    /// Offset of the block header from the heap base address.
    pub offset: usize,
    /// Payload size in bytes.
    pub size: usize,
    pub used: bool,
}

/// How [`Chain::release`] merged a block with its neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Merge {
    /// Previous block absorbed this block and the next one.
    Both,
    /// Previous block absorbed this block.
    Prev,
    /// This block absorbed the next one.
    Next,
    /// No free neighbor; the block was only marked free.
    None,
}

/// The block chain of one arena.
#[derive(Debug)]
pub(crate) struct Chain {
    base: NonNull<u8>,
    first: NonZeroUsize,
    end: usize,
}

impl Chain {
    /// Writes a single free block spanning `first..end` and returns the
    /// chain.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `base + first..base + end` is valid for reads and writes and is not
    ///   used by anything else
    /// - `first` and `end` are multiples of [`ALIGN`] and `base` is aligned
    ///   to [`ALIGN`]
    pub(crate) unsafe fn init(base: NonNull<u8>, first: NonZeroUsize, end: usize) -> Self {
        assert!(is_aligned(base.addr().get()));
        assert!(is_aligned(first.get()) && is_aligned(end));
        assert!(first.get() + HEADER_SIZE <= end, "arena cannot hold a header");

        let chain = Self { base, first, end };
        let header = BlockHeader::free(end - first.get() - HEADER_SIZE, None, None);
        unsafe { chain.header(first).write(header) };
        chain
    }

    /// Returns the chain previously written by [`init`](Self::init).
    ///
    /// # Safety
    ///
    /// The caller must ensure that `init` ran with the same arguments, and
    /// that no other code reads or writes block headers while the returned
    /// chain is in use.
    pub(crate) unsafe fn from_raw(base: NonNull<u8>, first: NonZeroUsize, end: usize) -> Self {
        Self { base, first, end }
    }

    /// Returns `true` if a whole header fits at `offset`.
    fn contains(&self, offset: usize) -> bool {
        offset >= self.first.get()
            && is_aligned(offset)
            && offset
                .checked_add(HEADER_SIZE)
                .is_some_and(|header_end| header_end <= self.end)
    }

    fn header(&self, offset: NonZeroUsize) -> *mut BlockHeader {
        assert!(
            self.contains(offset.get()),
            "block offset {offset:#x} out of arena"
        );
        #[expect(clippy::cast_ptr_alignment)]
        let header = unsafe { self.base.as_ptr().add(offset.get()) }.cast::<BlockHeader>();
        header
    }

    fn is_free(&self, offset: NonZeroUsize) -> bool {
        unsafe { !(*self.header(offset)).is_used() }
    }

    fn set_prev(&self, block: Option<NonZeroUsize>, prev: NonZeroUsize) {
        if let Some(block) = block {
            unsafe { (*self.header(block)).prev = Some(prev) };
        }
    }

    /// Wipes the key of a header that has been absorbed by a neighbor.
    fn retire(&self, offset: NonZeroUsize) {
        unsafe { (*self.header(offset)).key = 0 };
    }

    /// Total bytes covered by the chain, headers included.
    pub(crate) fn capacity(&self) -> usize {
        self.end - self.first.get()
    }

    /// Returns the payload address of the block at `offset`.
    pub(crate) fn payload(&self, offset: NonZeroUsize) -> NonNull<u8> {
        assert!(self.contains(offset.get()));
        unsafe { self.base.add(offset.get() + HEADER_SIZE) }
    }

    /// Finds the first free block of at least `size` bytes, splits off the
    /// remainder if a header fits behind the request, and marks the block
    /// used.
    ///
    /// Returns the offset of the allocated block, or `None` with the chain
    /// left untouched.
    pub(crate) fn allocate(&self, size: usize) -> Option<NonZeroUsize> {
        assert!(size > 0 && is_aligned(size));

        let mut current = Some(self.first);
        let offset = loop {
            let offset = current?;
            let block = self.header(offset);
            unsafe {
                if !(*block).is_used() && (*block).size >= size {
                    break offset;
                }
                current = (*block).next;
            }
        };

        let block = self.header(offset);
        unsafe {
            let block_size = (*block).size;
            if size
                .checked_add(HEADER_SIZE)
                .is_some_and(|needed| block_size >= needed)
            {
                let rest = offset.saturating_add(HEADER_SIZE + size);
                let next = (*block).next;
                let header = BlockHeader::free(block_size - size - HEADER_SIZE, Some(offset), next);
                self.header(rest).write(header);
                self.set_prev(next, rest);
                (*block).next = Some(rest);
                (*block).size = size;
            }
            (*block).attr |= ATTR_USED;
        }
        Some(offset)
    }

    /// Maps a payload pointer back to the offset of its block.
    ///
    /// The pointer must land on a payload inside the arena, and the header
    /// in front of it must carry [`BLOCK_KEY`] and be in use. The block must
    /// also be stitched into the chain: its size ends where its next block
    /// starts, and both neighbors are live headers linking back to it. A
    /// block that passes can be released without following a bad link.
    pub(crate) fn resolve(&self, ptr: NonNull<u8>) -> Result<NonZeroUsize, FreeError> {
        let address = ptr.addr().get();
        let offset = address
            .checked_sub(self.base.addr().get())
            .and_then(|offset| offset.checked_sub(HEADER_SIZE))
            .filter(|&offset| self.contains(offset))
            .and_then(NonZeroUsize::new)
            .context(free_error::OutOfArenaSnafu { address })?;

        let block = self.header(offset);
        let (key, used) = unsafe { ((*block).key, (*block).is_used()) };
        ensure!(key == BLOCK_KEY, free_error::CorruptedSnafu { address });
        // a free next neighbor gets absorbed, so its own link is followed too
        let linked = self.is_linked(offset)
            && unsafe { (*block).next }
                .is_none_or(|next| !self.is_free(next) || self.is_linked(next));
        ensure!(linked, free_error::CorruptedSnafu { address });
        ensure!(used, free_error::NotAllocatedSnafu { address });
        Ok(offset)
    }

    /// Returns the header at `offset` if a live one fits there.
    fn live_header(&self, offset: usize) -> Option<BlockHeader> {
        let offset = NonZeroUsize::new(offset).filter(|offset| self.contains(offset.get()))?;
        let header = unsafe { self.header(offset).read() };
        (header.key == BLOCK_KEY).then_some(header)
    }

    /// Checks the links of the block at `offset` against its neighbors.
    fn is_linked(&self, offset: NonZeroUsize) -> bool {
        let BlockHeader { prev, next, size, .. } = unsafe { self.header(offset).read() };
        let block_end = offset
            .get()
            .checked_add(HEADER_SIZE)
            .and_then(|payload| payload.checked_add(size))
            .filter(|&block_end| block_end <= self.end);
        let Some(block_end) = block_end else {
            return false;
        };

        let prev_linked = match prev {
            None => offset == self.first,
            Some(prev) => self.live_header(prev.get()).is_some_and(|header| {
                let prev_end = prev
                    .get()
                    .checked_add(HEADER_SIZE)
                    .and_then(|payload| payload.checked_add(header.size));
                header.next == Some(offset) && prev_end == Some(offset.get())
            }),
        };
        let next_linked = match next {
            None => block_end == self.end,
            Some(next) => {
                next.get() == block_end
                    && self
                        .live_header(next.get())
                        .is_some_and(|header| header.prev == Some(offset))
            }
        };
        prev_linked && next_linked
    }

    /// Marks the block at `offset` free and merges it with free neighbors.
    pub(crate) fn release(&self, offset: NonZeroUsize) -> Merge {
        let block = self.header(offset);
        let (prev, next) = unsafe { ((*block).prev, (*block).next) };
        let prev = prev.filter(|&prev| self.is_free(prev));
        let next = next.filter(|&next| self.is_free(next));

        unsafe {
            match (prev, next) {
                (Some(prev), Some(next)) => {
                    let prev_block = self.header(prev);
                    let next_block = self.header(next);
                    (*prev_block).size += 2 * HEADER_SIZE + (*block).size + (*next_block).size;
                    (*prev_block).next = (*next_block).next;
                    self.set_prev((*prev_block).next, prev);
                    self.retire(offset);
                    self.retire(next);
                    Merge::Both
                }
                (Some(prev), None) => {
                    let prev_block = self.header(prev);
                    (*prev_block).size += HEADER_SIZE + (*block).size;
                    (*prev_block).next = (*block).next;
                    self.set_prev((*block).next, prev);
                    self.retire(offset);
                    Merge::Prev
                }
                (None, Some(next)) => {
                    let next_block = self.header(next);
                    (*block).size += HEADER_SIZE + (*next_block).size;
                    (*block).next = (*next_block).next;
                    self.set_prev((*block).next, offset);
                    (*block).attr &= !ATTR_USED;
                    self.retire(next);
                    Merge::Next
                }
                (None, None) => {
                    (*block).attr &= !ATTR_USED;
                    Merge::None
                }
            }
        }
    }

    /// Iterates over the blocks in address order.
    pub(crate) fn blocks(&self) -> Blocks<'_> {
        Blocks {
            chain: self,
            next: Some(self.first),
        }
    }

    /// Walks the whole chain and checks every invariant it must hold.
    ///
    /// Unlike [`blocks`](Self::blocks), this never trusts a link or a size
    /// before checking it against the arena bounds.
    pub(crate) fn verify(&self) -> Result<(), ChainError> {
        let mut prev: Option<NonZeroUsize> = None;
        let mut prev_free = false;
        let mut expected = self.first.get();
        let mut current = Some(self.first);

        while let Some(offset) = current {
            ensure!(
                offset.get() == expected,
                chain_error::GapSnafu {
                    offset: prev.map_or(0, NonZeroUsize::get),
                    next: offset.get(),
                    expected,
                }
            );
            ensure!(
                self.contains(offset.get()),
                chain_error::BlockOutOfBoundsSnafu {
                    offset: offset.get()
                }
            );

            let BlockHeader {
                prev: back,
                next,
                attr,
                size,
                key,
            } = unsafe { self.header(offset).read() };
            ensure!(
                key == BLOCK_KEY,
                chain_error::InvalidKeySnafu {
                    offset: offset.get(),
                    key,
                }
            );
            ensure!(
                back == prev,
                chain_error::BrokenBackLinkSnafu {
                    offset: offset.get(),
                    expected: prev.map(NonZeroUsize::get),
                    actual: back.map(NonZeroUsize::get),
                }
            );
            ensure!(
                is_aligned(size),
                chain_error::UnalignedSizeSnafu {
                    offset: offset.get(),
                    size,
                }
            );
            let used = attr & ATTR_USED != 0;
            ensure!(
                used || !prev_free,
                chain_error::UncoalescedSnafu {
                    offset: prev.map_or(0, NonZeroUsize::get),
                    next: offset.get(),
                }
            );

            expected = offset
                .get()
                .checked_add(HEADER_SIZE)
                .and_then(|payload| payload.checked_add(size))
                .filter(|&block_end| block_end <= self.end)
                .context(chain_error::BlockOutOfBoundsSnafu {
                    offset: offset.get(),
                })?;
            prev = Some(offset);
            prev_free = !used;
            current = next;
        }

        ensure!(
            expected == self.end,
            chain_error::SizeMismatchSnafu {
                covered: expected - self.first.get(),
                capacity: self.capacity(),
            }
        );
        Ok(())
    }
}

/// Iterator over the blocks of a [`Chain`].
#[derive(Debug)]
pub(crate) struct Blocks<'a> {
    chain: &'a Chain,
    next: Option<NonZeroUsize>,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next?;
        let block = self.chain.header(offset);
        let (size, used, next) = unsafe { ((*block).size, (*block).is_used(), (*block).next) };
        self.next = next;
        Some(BlockInfo {
            offset: offset.get(),
            size,
            used,
        })
    }
}
