//! Boot-time heap configuration.

use crate::{
    arena::align_down,
    error::ConstructError,
    gate::Gate,
    heap::{HEAP_FOOTPRINT, Heap},
};

/// Where the kernel heap lives, as handed over by the boot sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Start address of the heap region. Must be aligned to
    /// [`ALIGN`](crate::ALIGN).
    pub heap_addr: *mut u8,
    /// Size of the heap region in bytes, heap object included.
    pub heap_size: usize,
}

impl HeapConfig {
    #[must_use]
    pub const fn new(heap_addr: *mut u8, heap_size: usize) -> Self {
        Self {
            heap_addr,
            heap_size,
        }
    }

    /// Bytes the block chain would cover once the heap is placed.
    #[must_use]
    pub const fn usable_size(&self) -> usize {
        align_down(self.heap_size).saturating_sub(HEAP_FOOTPRINT)
    }

    /// Places a heap in the configured region and requires it to be
    /// constructed.
    ///
    /// Boot code without a fallback for a missing heap can treat any error
    /// as fatal.
    ///
    /// # Safety
    ///
    /// Same as [`Heap::place`] for the configured region.
    pub unsafe fn place<'g>(
        &self,
        gate: Option<&'g Gate<'g>>,
    ) -> Result<&'g Heap<'g>, ConstructError> {
        let heap = unsafe { Heap::place(self.heap_addr, self.heap_size, gate) }?;
        heap.status()?;
        Ok(heap)
    }
}
