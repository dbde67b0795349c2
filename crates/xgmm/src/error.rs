//! Error types for memory management operations.

use crate::{PhysicalAddress, VirtualAddress};

/// Errors that can occur during frame, heap and paging operations.
///
/// Every fallible operation reports one of these instead of silently doing nothing, so
/// callers can tell invalid input apart from resource exhaustion. Callers that consider
/// a variant harmless (for example a misaligned [`free_frame`]) are free to ignore it.
///
/// [`free_frame`]: crate::FrameAllocator::free_frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// No free physical frame is left.
    #[error("out of physical frames")]
    OutOfFrames,
    /// The address is not aligned to a 4 KiB frame.
    #[error("address {0} is not frame-aligned")]
    Misaligned(PhysicalAddress),
    /// The address lies outside the memory tracked by the allocator or addressable by paging.
    #[error("address {0} is outside tracked memory")]
    OutOfRange(PhysicalAddress),
    /// The paging manager was used before `init()`.
    #[error("paging manager is not initialized")]
    NotInitialized,
    /// No translation exists for the virtual address.
    #[error("virtual address {0} is not mapped")]
    NotMapped(VirtualAddress),
    /// The walk for the virtual address ran into a 2 MiB or 1 GiB page.
    #[error("virtual address {0} lies inside a huge page")]
    HugePageConflict(VirtualAddress),
    /// The boot memory map reports no usable memory.
    #[error("no usable physical memory")]
    NoUsableMemory,
    /// The kernel heap cannot grow: its next frame is in use, untracked or past the address space.
    #[error("kernel heap exhausted")]
    HeapExhausted,
    /// The boot framebuffer cannot be used.
    #[error("unsupported framebuffer: {0}")]
    UnsupportedFramebuffer(#[from] FramebufferError),
}

/// Reasons a boot framebuffer descriptor is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FramebufferError {
    /// The boot information carries no framebuffer descriptor.
    #[error("no framebuffer reported by the bootloader")]
    Missing,
    /// The framebuffer address is zero.
    #[error("framebuffer address is null")]
    NullAddress,
    /// The framebuffer sits below 1 MiB, where no linear framebuffer lives.
    #[error("framebuffer address {0} is below 1 MiB")]
    LowAddress(PhysicalAddress),
    /// The framebuffer is indexed or text mode rather than direct RGB.
    #[error("framebuffer type {0} is not direct RGB")]
    NotRgb(u8),
    /// Only 32 bits per pixel are supported.
    #[error("{0} bits per pixel is not supported")]
    UnsupportedDepth(u8),
    /// Pitch, width or height is zero.
    #[error("framebuffer has zero pitch, width or height")]
    ZeroGeometry,
    /// `pitch * height` exceeds the sanity limit.
    #[error("framebuffer size of {0} bytes is too large")]
    TooLarge(u64),
    /// The framebuffer extends past the physical address width.
    #[error("framebuffer at {0:#x} extends past the physical address width")]
    Unaddressable(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_addresses() {
        let error = MemoryError::Misaligned(PhysicalAddress::new(0x1234));
        assert_eq!(format!("{error}"), "address 0x1234 is not frame-aligned");
    }

    #[test]
    fn wraps_framebuffer_errors() {
        let error = MemoryError::from(FramebufferError::UnsupportedDepth(24));
        assert_eq!(
            error,
            MemoryError::UnsupportedFramebuffer(FramebufferError::UnsupportedDepth(24))
        );
        assert_eq!(
            format!("{error}"),
            "unsupported framebuffer: 24 bits per pixel is not supported"
        );
    }
}
