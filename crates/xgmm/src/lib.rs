#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # XG Memory Manager (XGMM)
//!
//! The memory-management core of the XG kernel. It provides:
//!
//! - Discovery of physical memory from the Multiboot information structure.
//! - A bitmap-based physical frame allocator.
//! - An append-only kernel heap backed by frames reserved through the allocator.
//! - Management of the active 4-level x86-64 page-table hierarchy.
//! - Software emulation of the CPU and physical memory for testing in non-kernel environments.
//!
//! All state is held in explicitly owned values ([`FrameAllocator`], [`KernelHeap`],
//! [`PagingManager`], or the [`MemoryManager`] bundling them) and mutated through `&mut self`.
//! Everything here assumes a single core with no concurrent callers.

mod address;
mod address_space;
mod arch;
mod bitmap;
mod boot_info;
mod error;
mod frame_allocator;
mod heap;
mod human_size;
mod manager;
mod memmap;
mod numbers;
mod paging;
mod table;

#[cfg(test)]
mod testing;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::AddressSpace;
pub use bitmap::FrameBitmap;
pub use boot_info::{
    BootInfo, BootModule, FramebufferInfo, FramebufferType, MemoryMapEntry, MemoryMapIter,
    ModuleIter,
};
pub use error::{FramebufferError, MemoryError};
pub use frame_allocator::{FrameAllocator, FrameSource, KernelImage};
pub use heap::KernelHeap;
pub use human_size::HumanSize;
pub use manager::MemoryManager;
pub use memmap::{BootMemoryRegion, MAX_REGIONS, MemoryMap, PhysicalMemoryRegion, RegionKind};
pub use numbers::{FrameNumber, FrameRange};
pub use paging::{MappedFramebuffer, PagingManager};
pub use table::{PageEntry, PageFlags, PageTable};

pub use arch::{ENTRIES_PER_TABLE, PAGE_SIZE, PAGE_TABLE_LEVELS};

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedMemory, set_page_table_root, take_invalidations};
