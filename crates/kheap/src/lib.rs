//! First-fit, coalescing kernel heap for a single fixed-size arena.
//!
//! The kernel hands the allocator one contiguous byte region at boot. The
//! [`Heap`] object is placed at the start of that region and manages the
//! remaining bytes as a chain of blocks, each preceded by a header written
//! into the arena itself. The crate is `no_std` and never allocates.
//!
//! # Overview
//!
//! - [`arena`]: memory self-test run before any control structure is
//!   written, plus the 8-byte alignment arithmetic shared by all layouts.
//! - [`Heap`]: placement, first-fit allocation with block splitting, and
//!   eager coalescing on free.
//! - [`gate`]: the rebindable enable/disable capability that brackets every
//!   change to the block chain.
//! - [`HeapConfig`]: the region description handed over by the boot
//!   sequence.
//!
//! # Usage Example
//!
//! ```rust
//! use kheap::{Gate, Heap, Toggle};
//!
//! struct NoInterrupts;
//!
//! impl Toggle for NoInterrupts {
//!     fn disable(&self) -> bool {
//!         false
//!     }
//!     fn enable(&self, _status: bool) {}
//! }
//!
//! // In a kernel this is a region reserved for the heap.
//! let mut region = vec![0_u64; 128];
//! let size = region.len() * size_of::<u64>();
//!
//! let toggle = NoInterrupts;
//! let gate = Gate::new();
//! let heap = unsafe { Heap::place(region.as_mut_ptr().cast(), size, Some(&gate)) }.unwrap();
//! assert!(heap.is_constructed());
//!
//! let ptr = heap.allocate(100).unwrap();
//! assert_eq!(ptr.addr().get() % kheap::ALIGN, 0);
//!
//! // interrupts are wired up later in boot
//! gate.bind(&toggle);
//!
//! heap.free(ptr.as_ptr()).unwrap();
//! assert_eq!(heap.stats().free_blocks, 1);
//! ```
//!
//! # Performance Characteristics
//!
//! - **Allocation**: O(n) in the number of blocks; first fit, so the search
//!   stops at the first block that is large enough
//! - **Deallocation**: O(1); neighbors are reached through the header links
//! - **Memory Overhead**: one [`HEADER_SIZE`] header per block, plus the
//!   heap object itself ([`HEAP_FOOTPRINT`])
//!
//! # Thread Safety
//!
//! [`Heap`] is neither `Send` nor `Sync`. On its own core, interrupt
//! contexts are kept out of each other's way by the [`Gate`]; nothing
//! synchronizes cores.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod arena;
mod block;
mod config;
mod error;
pub mod gate;
mod heap;

pub use self::{
    arena::{ALIGN, MemoryTestError, Pattern},
    block::{BlockInfo, HEADER_SIZE},
    config::HeapConfig,
    error::{ChainError, ConstructError, FreeError},
    gate::{CriticalSection, Gate, Toggle},
    heap::{HEAP_FOOTPRINT, Heap, HeapStats, MIN_HEAP_SIZE, MIN_PAYLOAD},
};
