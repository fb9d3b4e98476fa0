//! Arena self-test and alignment arithmetic.
//!
//! Before the heap trusts a region enough to write a control structure into
//! it, every byte of the region is written and read back with several bit
//! patterns. Unmapped or floating address space fails the test instead of
//! silently swallowing a header.
//!
//! The test is destructive: on success the region is left zero-filled.

use core::fmt;

use snafu::{Snafu, ensure};

/// Alignment of the heap object, of every block header and of every payload.
pub const ALIGN: usize = 8;

/// Rounds `value` down to a multiple of [`ALIGN`].
#[must_use]
pub const fn align_down(value: usize) -> usize {
    value & !(ALIGN - 1)
}

/// Rounds `value` up to a multiple of [`ALIGN`].
///
/// Returns `None` if the result does not fit in `usize`.
#[must_use]
pub const fn align_up(value: usize) -> Option<usize> {
    match value.checked_add(ALIGN - 1) {
        Some(value) => Some(align_down(value)),
        None => None,
    }
}

#[must_use]
pub const fn is_aligned(value: usize) -> bool {
    value & (ALIGN - 1) == 0
}

/// Bit pattern written by one pass of [`test_memory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// Byte `i` of the region holds the low byte of `i`.
    Counting,
    /// Every byte is `0x55`.
    Alternating01,
    /// Every byte is `0xaa`.
    Alternating10,
    /// Every byte is `0x00`.
    Zero,
}

impl Pattern {
    /// Passes in the order they are run. `Zero` goes last so a successful
    /// test leaves the region cleared.
    const PASSES: [Self; 4] = [
        Self::Counting,
        Self::Alternating01,
        Self::Alternating10,
        Self::Zero,
    ];

    fn byte(self, index: usize) -> u8 {
        match self {
            Self::Counting => index.to_le_bytes()[0],
            Self::Alternating01 => 0x55,
            Self::Alternating10 => 0xaa,
            Self::Zero => 0x00,
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Counting => "counting",
            Self::Alternating01 => "0x55",
            Self::Alternating10 => "0xaa",
            Self::Zero => "zero",
        };
        f.write_str(name)
    }
}

/// A byte of the tested region did not read back what was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(display(
    "memory test failed at {address:#x}: {pattern} pattern, \
     wrote {expected:#04x}, read {actual:#04x}"
))]
pub struct MemoryTestError {
    address: usize,
    pattern: Pattern,
    expected: u8,
    actual: u8,
}

impl MemoryTestError {
    /// Address of the first byte that failed.
    #[must_use]
    pub fn address(&self) -> usize {
        self.address
    }

    #[must_use]
    pub fn pattern(&self) -> Pattern {
        self.pattern
    }
}

/// Tests that `base..base + len` is genuine read/write memory.
///
/// Each pattern of [`Pattern`] is written over the whole range and then read
/// back. All accesses are volatile, so the test really touches the memory.
/// On success the range is zero-filled.
///
/// # Safety
///
/// The caller must ensure that:
///
/// - `base..base + len` is valid for volatile writes and reads
/// - Nothing else uses the range while the test runs, and nothing in it
///   needs to survive the test
pub unsafe fn test_memory(base: *mut u8, len: usize) -> Result<(), MemoryTestError> {
    for pattern in Pattern::PASSES {
        for i in 0..len {
            unsafe { base.add(i).write_volatile(pattern.byte(i)) };
        }
        for i in 0..len {
            let expected = pattern.byte(i);
            let actual = unsafe { base.add(i).read_volatile() };
            ensure!(
                actual == expected,
                MemoryTestSnafu {
                    address: base.addr() + i,
                    pattern,
                    expected,
                    actual,
                }
            );
        }
    }
    Ok(())
}
