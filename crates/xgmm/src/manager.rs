//! The kernel's memory manager.
//!
//! [`MemoryManager`] wires the frame allocator, the kernel heap and the paging manager
//! together in boot order and is the single owner of all three. Running out of frames while
//! building page tables is fatal here: the condition is logged and the CPU is halted.

use core::ptr::NonNull;

use crate::{
    BootInfo, FrameAllocator, FramebufferError, KernelHeap, KernelImage, MappedFramebuffer,
    MemoryError, PageFlags, PagingManager, PhysicalAddress, VirtualAddress, arch,
};

/// Owns every memory-management component of the kernel.
pub struct MemoryManager {
    frames: FrameAllocator,
    heap: KernelHeap,
    paging: PagingManager,
}

impl MemoryManager {
    /// Brings up memory management: the frame allocator first, then paging.
    ///
    /// # Safety
    ///
    /// Same contract as [`FrameAllocator::init`]. In addition, CR3 must hold a valid
    /// hierarchy whose tables are reachable through the identity view.
    pub unsafe fn init(boot_info: &BootInfo, kernel: KernelImage) -> Result<Self, MemoryError> {
        // SAFETY: Forwarded from the caller.
        let frames = unsafe { FrameAllocator::init(boot_info, kernel)? };

        let mut paging = PagingManager::new();
        paging.init();

        Ok(Self {
            frames,
            heap: KernelHeap::new(),
            paging,
        })
    }

    /// Returns the frame allocator.
    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    /// Returns the paging manager.
    pub fn paging(&self) -> &PagingManager {
        &self.paging
    }

    /// Returns the kernel heap.
    pub fn heap(&self) -> &KernelHeap {
        &self.heap
    }

    /// Allocates one physical frame.
    pub fn allocate_frame(&mut self) -> Option<PhysicalAddress> {
        self.frames.allocate_frame()
    }

    /// Releases a physical frame.
    pub fn free_frame(&mut self, addr: PhysicalAddress) -> Result<(), MemoryError> {
        self.frames.free_frame(addr)
    }

    /// Allocates `size` bytes from the kernel heap.
    pub fn kmalloc(&mut self, size: usize) -> Result<NonNull<u8>, MemoryError> {
        self.heap.allocate(&mut self.frames, size)
    }

    /// Maps the page containing `virt` to the frame containing `phys`.
    ///
    /// Halts if no frame is left for a page table.
    pub fn map_page(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MemoryError> {
        match self.paging.map_page(&mut self.frames, virt, phys, flags) {
            Err(MemoryError::OutOfFrames) => out_of_frames(virt.as_usize()),
            other => other,
        }
    }

    /// Removes the mapping of the page containing `virt`.
    pub fn unmap_page(&mut self, virt: VirtualAddress) -> Result<Option<PhysicalAddress>, MemoryError> {
        self.paging.unmap_page(virt)
    }

    /// Translates `virt` to a physical address.
    pub fn resolve(&self, virt: VirtualAddress) -> Result<PhysicalAddress, MemoryError> {
        self.paging.resolve(virt)
    }

    /// Identity maps `[base, base + size)`, returning the number of pages mapped.
    ///
    /// Halts if no frame is left for a page table.
    pub fn map_region(
        &mut self,
        base: PhysicalAddress,
        size: usize,
        flags: PageFlags,
    ) -> Result<usize, MemoryError> {
        match self.paging.map_region(&mut self.frames, base, size, flags) {
            Err(MemoryError::OutOfFrames) => out_of_frames(base.as_usize()),
            other => other,
        }
    }

    /// Maps the framebuffer reported by the bootloader.
    pub fn map_framebuffer(&mut self, boot_info: &BootInfo) -> Result<MappedFramebuffer, MemoryError> {
        let info = boot_info.framebuffer().ok_or(FramebufferError::Missing)?;
        match self.paging.map_framebuffer(&mut self.frames, info) {
            Err(MemoryError::OutOfFrames) => out_of_frames(info.address as usize),
            other => other,
        }
    }
}

fn out_of_frames(at: usize) -> ! {
    log::error!("out of physical frames while mapping {:#x}; halting", at);
    arch::halt()
}
