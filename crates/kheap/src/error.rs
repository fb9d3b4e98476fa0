use snafu::Snafu;

use crate::arena::{ALIGN, MemoryTestError};

/// The heap could not be placed or constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(module, visibility(pub(crate)))]
pub enum ConstructError {
    #[snafu(display("null heap base address given"))]
    NullBase,
    #[snafu(display("heap base address {address:#x} is not aligned to {ALIGN} bytes"))]
    UnalignedBase { address: usize },
    #[snafu(display(
        "heap region of {size} bytes cannot hold the heap object of {needed} bytes"
    ))]
    RegionTooSmall { size: usize, needed: usize },
    #[snafu(display("usable arena of {usable} bytes is below the minimum of {minimum} bytes"))]
    ArenaTooSmall { usable: usize, minimum: usize },
    #[snafu(display("heap memory is not usable: {source}"))]
    MemoryTest { source: MemoryTestError },
}

/// A pointer was refused by [`Heap::free`](crate::Heap::free).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(module, visibility(pub(crate)))]
pub enum FreeError {
    #[snafu(display("heap is not constructed"))]
    NotConstructed,
    #[snafu(display("pointer {address:#x} does not point at a payload of this heap"))]
    OutOfArena { address: usize },
    #[snafu(display("block header for {address:#x} is corrupted"))]
    Corrupted { address: usize },
    #[snafu(display("block at {address:#x} is not allocated"))]
    NotAllocated { address: usize },
}

/// The block chain violates one of its invariants.
///
/// Offsets are relative to the heap base address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(module, visibility(pub(crate)))]
pub enum ChainError {
    #[snafu(display("heap is not constructed"))]
    Unconstructed,
    #[snafu(display("block at offset {offset:#x} lies outside the arena"))]
    BlockOutOfBounds { offset: usize },
    #[snafu(display("block at offset {offset:#x} has an invalid key {key:#x}"))]
    InvalidKey { offset: usize, key: usize },
    #[snafu(display(
        "block at offset {offset:#x} links back to {actual:?}, expected {expected:?}"
    ))]
    BrokenBackLink {
        offset: usize,
        expected: Option<usize>,
        actual: Option<usize>,
    },
    #[snafu(display(
        "block at offset {offset:#x} is followed by {next:#x}, expected {expected:#x}"
    ))]
    Gap {
        offset: usize,
        next: usize,
        expected: usize,
    },
    #[snafu(display("block at offset {offset:#x} has unaligned size {size}"))]
    UnalignedSize { offset: usize, size: usize },
    #[snafu(display("adjacent free blocks at offsets {offset:#x} and {next:#x}"))]
    Uncoalesced { offset: usize, next: usize },
    #[snafu(display("blocks cover {covered} bytes of a {capacity} byte arena"))]
    SizeMismatch { covered: usize, capacity: usize },
}
