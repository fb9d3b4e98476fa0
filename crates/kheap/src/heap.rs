//! The heap object and its public operations.
//!
//! A [`Heap`] is placed at the base of the arena it manages and carves its
//! block region out of the bytes behind itself:
//!
//! ```text
//! base               base + HEAP_FOOTPRINT                 base + size
//! ┌──────────────────┬─────────────────────────────────────────┐
//! │ Heap             │ block chain (capacity bytes)            │
//! │ key, size, gate  │                                         │
//! └──────────────────┴─────────────────────────────────────────┘
//! ```
//!
//! Placement is the only place where raw memory becomes a heap. Once placed,
//! every operation goes through the block chain, which checks each offset
//! against the arena bounds.

use core::{cell::Cell, fmt, num::NonZeroUsize, ptr::NonNull};

use log::{debug, trace, warn};
use snafu::{OptionExt as _, ResultExt as _, ensure};

use crate::{
    arena::{self, ALIGN, align_down, is_aligned},
    block::{BlockInfo, Chain, HEADER_SIZE},
    error::{ChainError, ConstructError, FreeError, chain_error, construct_error, free_error},
    gate::{CriticalSection, Gate},
};

/// Validity key of a constructed heap.
const HEAP_KEY: u32 = 0x1981_1019;

/// Size of the heap object in bytes, carved from the front of the arena.
pub const HEAP_FOOTPRINT: usize = size_of::<Heap<'static>>();
const _: () = assert!(HEAP_FOOTPRINT % ALIGN == 0);
const _: () = assert!(align_of::<Heap<'static>>() == ALIGN);

/// Payload bytes the first block must be able to hold.
pub const MIN_PAYLOAD: usize = 16;

/// Smallest region, heap object included, that [`Heap::place`] constructs.
pub const MIN_HEAP_SIZE: usize = HEAP_FOOTPRINT + HEADER_SIZE + MIN_PAYLOAD;

/// Offset of the first block header from the heap base address.
const FIRST_BLOCK: NonZeroUsize = match NonZeroUsize::new(HEAP_FOOTPRINT) {
    Some(offset) => offset,
    None => panic!("heap object must not be zero-sized"),
};

/// A first-fit, coalescing heap living at the front of its own arena.
///
/// Obtained through [`Heap::place`]; never moved or copied afterwards. A heap
/// whose construction failed stays in memory with its key cleared: every
/// operation on it is a no-op, and [`is_constructed`](Self::is_constructed)
/// reports `false`.
///
/// `Heap` is neither `Send` nor `Sync`. Concurrent use from interrupt
/// contexts of the owning core is serialized by the [`Gate`] it is bound
/// to. The heap is not reentrant: nothing may call into it from inside one
/// of its own critical sections.
#[repr(C, align(8))]
pub struct Heap<'g> {
    key: Cell<u32>,
    base: NonNull<u8>,
    /// Bytes available to the block chain.
    size: usize,
    gate: Cell<Option<&'g Gate<'g>>>,
    fault: Cell<Option<ConstructError>>,
}

/// Block statistics of a heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes covered by the block chain, headers included.
    pub capacity: usize,
    /// Payload bytes of blocks in use.
    pub used_bytes: usize,
    /// Payload bytes of free blocks.
    pub free_bytes: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    /// Payload size of the largest free block; the largest request that
    /// can currently succeed.
    pub largest_free: usize,
}

impl fmt::Debug for Heap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("base", &self.base)
            .field("constructed", &self.is_constructed())
            .field("capacity", &self.size)
            .field("gate", &self.gate.get())
            .field("fault", &self.fault.get())
            .finish()
    }
}

impl<'g> Heap<'g> {
    /// Places a heap at `base`, managing `size` bytes including itself.
    ///
    /// The heap object's own bytes and then the whole block region are
    /// memory-tested before anything is trusted to live there. Fails only
    /// when no heap object can be written at `base`; if the block region is
    /// unusable, a heap is still returned but left unconstructed, with the
    /// reason available from [`status`](Self::status).
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `base..base + size` is valid for reads and writes for `'g`
    /// - The region is used by nothing but the returned heap for `'g`, and
    ///   nothing in it needs to survive placement
    /// - No heap has already been placed in the region
    pub unsafe fn place(
        base: *mut u8,
        size: usize,
        gate: Option<&'g Gate<'g>>,
    ) -> Result<&'g Self, ConstructError> {
        let base = NonNull::new(base).context(construct_error::NullBaseSnafu)?;
        let address = base.addr().get();
        ensure!(is_aligned(address), construct_error::UnalignedBaseSnafu { address });
        ensure!(
            size >= HEAP_FOOTPRINT,
            construct_error::RegionTooSmallSnafu {
                size,
                needed: HEAP_FOOTPRINT,
            }
        );
        unsafe { arena::test_memory(base.as_ptr(), HEAP_FOOTPRINT) }
            .context(construct_error::MemoryTestSnafu)?;

        #[expect(clippy::cast_ptr_alignment)]
        let heap = base.as_ptr().cast::<Self>();
        let heap = unsafe {
            heap.write(Self {
                key: Cell::new(0),
                base,
                size: align_down(size) - HEAP_FOOTPRINT,
                gate: Cell::new(gate),
                fault: Cell::new(None),
            });
            &*heap
        };

        match heap.construct() {
            Ok(()) => {
                heap.key.set(HEAP_KEY);
                debug!("heap constructed at {address:#x}: {} bytes usable", heap.size);
            }
            Err(err) => {
                heap.fault.set(Some(err));
                warn!("heap at {address:#x} not constructed: {err}");
            }
        }
        Ok(heap)
    }

    fn construct(&self) -> Result<(), ConstructError> {
        let minimum = HEADER_SIZE + MIN_PAYLOAD;
        ensure!(
            self.size >= minimum,
            construct_error::ArenaTooSmallSnafu {
                usable: self.size,
                minimum,
            }
        );
        unsafe {
            let region = self.base.as_ptr().add(FIRST_BLOCK.get());
            arena::test_memory(region, self.size).context(construct_error::MemoryTestSnafu)?;
            Chain::init(self.base, FIRST_BLOCK, self.end());
        }
        Ok(())
    }

    fn end(&self) -> usize {
        FIRST_BLOCK.get() + self.size
    }

    /// Returns the block chain.
    ///
    /// # Safety
    ///
    /// The heap must be constructed, and the caller must hold a critical
    /// section for as long as the chain is used.
    unsafe fn chain(&self) -> Chain {
        unsafe { Chain::from_raw(self.base, FIRST_BLOCK, self.end()) }
    }

    fn critical_section(&self) -> CriticalSection<'g> {
        self.gate
            .get()
            .map_or_else(CriticalSection::unguarded, Gate::enter)
    }

    /// Returns `true` if the heap was constructed successfully.
    #[must_use]
    pub fn is_constructed(&self) -> bool {
        self.key.get() == HEAP_KEY
    }

    /// Returns why construction failed, if it did.
    pub fn status(&self) -> Result<(), ConstructError> {
        match self.fault.get() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Bytes covered by the block chain, headers included.
    ///
    /// Zero for a heap that is not constructed.
    #[must_use]
    pub fn capacity(&self) -> usize {
        if self.is_constructed() { self.size } else { 0 }
    }

    /// Rebinds the gate guarding this heap. `None` leaves mutations unguarded.
    pub fn set_gate(&self, gate: Option<&'g Gate<'g>>) {
        self.gate.set(gate);
    }

    /// Allocates at least `size` bytes.
    ///
    /// The request is rounded up to a multiple of [`ALIGN`] and served from
    /// the first free block large enough. The returned pointer is aligned to
    /// [`ALIGN`].
    ///
    /// Returns `None` if `size` is zero, if the heap is not constructed, or if
    /// no free block is large enough. The heap is left untouched in all these
    /// cases.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if !self.is_constructed() || size == 0 {
            return None;
        }
        let size = arena::align_up(size)?;

        let ptr = {
            let _cs = self.critical_section();
            let chain = unsafe { self.chain() };
            chain.allocate(size).map(|offset| chain.payload(offset))
        };
        if ptr.is_none() {
            trace!("heap: no free block of {size} bytes");
        }
        ptr
    }

    /// Frees memory returned by [`allocate`](Self::allocate).
    ///
    /// A null `ptr` is ignored. The freed block is merged with free
    /// neighbors right away.
    ///
    /// Pointers that do not resolve to an allocated block of this heap are
    /// refused without touching the heap. A block freed twice is detected as
    /// long as its header has not been reused by a later allocation.
    pub fn free(&self, ptr: *mut u8) -> Result<(), FreeError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };
        ensure!(self.is_constructed(), free_error::NotConstructedSnafu);

        let merge = {
            let _cs = self.critical_section();
            let chain = unsafe { self.chain() };
            chain.resolve(ptr).map(|offset| chain.release(offset))
        };
        match merge {
            Ok(merge) => {
                trace!("heap: freed {ptr:p}, merged {merge:?}");
                Ok(())
            }
            Err(err) => {
                warn!("heap: refused to free {ptr:p}: {err}");
                Err(err)
            }
        }
    }

    /// Calls `f` for every block in address order.
    ///
    /// Runs inside a critical section; `f` must not call into this heap.
    pub fn for_each_block<F>(&self, mut f: F)
    where
        F: FnMut(BlockInfo),
    {
        if !self.is_constructed() {
            return;
        }
        let _cs = self.critical_section();
        let chain = unsafe { self.chain() };
        for block in chain.blocks() {
            f(block);
        }
    }

    /// Collects block statistics.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            capacity: self.capacity(),
            ..HeapStats::default()
        };
        self.for_each_block(|block| {
            if block.used {
                stats.used_bytes += block.size;
                stats.used_blocks += 1;
            } else {
                stats.free_bytes += block.size;
                stats.free_blocks += 1;
                stats.largest_free = stats.largest_free.max(block.size);
            }
        });
        stats
    }

    /// Checks the block chain for corruption.
    pub fn verify(&self) -> Result<(), ChainError> {
        ensure!(self.is_constructed(), chain_error::UnconstructedSnafu);
        let _cs = self.critical_section();
        let chain = unsafe { self.chain() };
        chain.verify()
    }
}
