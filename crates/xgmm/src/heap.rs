//! Kernel heap.
//!
//! A bump allocator: the cursor only moves forward and nothing is ever freed. The heap
//! begins at the first 8-byte boundary after the frame bitmap, and every frame an allocation
//! reaches into is marked unavailable in the frame allocator so it is never handed out again.
//! The heap only grows into frames that are still free; a frame already handed out or
//! reserved ends it.

use core::ptr::NonNull;

use crate::{FrameAllocator, MemoryError, PhysicalAddress, arch};

/// Granularity of every heap allocation.
const HEAP_ALIGN: usize = 8;

/// The append-only kernel heap.
#[derive(Debug)]
pub struct KernelHeap {
    next_free: Option<PhysicalAddress>,
    reserved_end: PhysicalAddress,
}

impl KernelHeap {
    /// Creates a heap whose cursor is placed on the first allocation.
    pub const fn new() -> Self {
        Self {
            next_free: None,
            reserved_end: PhysicalAddress::new(0),
        }
    }

    /// Returns the next address the heap will hand out, once the heap has been used.
    pub fn cursor(&self) -> Option<PhysicalAddress> {
        self.next_free
    }

    /// Allocates `size` bytes, rounded up to a multiple of 8.
    ///
    /// A zero-byte request still consumes an 8-byte slot, so successive results are strictly
    /// increasing. The memory is not zeroed.
    pub fn allocate(
        &mut self,
        frames: &mut FrameAllocator,
        size: usize,
    ) -> Result<NonNull<u8>, MemoryError> {
        // Frames below `reserved_end` belong to the bitmap or to an earlier allocation.
        let (start, reserved_end) = match self.next_free {
            Some(cursor) => (cursor, self.reserved_end),
            None => {
                let start = frames.bitmap_end().align_up(HEAP_ALIGN);
                (start, start.align_up(arch::PAGE_SIZE))
            }
        };

        let size = size
            .max(1)
            .checked_next_multiple_of(HEAP_ALIGN)
            .ok_or(MemoryError::HeapExhausted)?;
        let end = start
            .as_usize()
            .checked_add(size)
            .and_then(PhysicalAddress::try_new)
            .ok_or(MemoryError::HeapExhausted)?;

        let span_end = end.align_up(arch::PAGE_SIZE);
        if span_end > reserved_end {
            let taken = (reserved_end.as_usize()..span_end.as_usize())
                .step_by(arch::PAGE_SIZE)
                .map(PhysicalAddress::new)
                .find(|frame| !frames.is_available(frame.frame_number()));
            if let Some(frame) = taken {
                log::warn!("kmalloc({}): frame {} is already in use", size, frame);
                return Err(MemoryError::HeapExhausted);
            }
            frames.reserve_range(reserved_end, span_end - reserved_end);
        }

        if self.next_free.is_none() {
            log::debug!("kernel heap starts at {}", start);
        }
        self.next_free = Some(end);
        self.reserved_end = reserved_end.max(span_end);
        log::trace!("kmalloc({}) -> {}", size, start);

        NonNull::new(start.identity_view::<u8>()).ok_or(MemoryError::HeapExhausted)
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}
