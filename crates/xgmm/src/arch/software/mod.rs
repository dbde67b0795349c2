//! Software emulation implementation for testing and development.
//!
//! This module provides a software-emulated CPU that can run on any host. Page tables keep the
//! real x86-64 format; only the privileged state around them is simulated:
//!
//! - CR3 is a per-thread cell that tests load with [`set_page_table_root`].
//! - The TLB is a per-thread log of invalidated addresses, drained with [`take_invalidations`].
//! - Physical memory is an [`EmulatedMemory`] buffer reached through the address translator.
//! - Halting the CPU panics, so fatal paths can be observed with `#[should_panic]`.
//!
//! Every test runs on its own thread, so each test sees a fresh CPU.

use core::alloc::Layout;
use core::cell::{Cell, RefCell};
use core::ptr::NonNull;

use super::PAGE_SIZE;
use crate::{PhysicalAddress, VirtualAddress};

std::thread_local! {
    static PAGE_TABLE_ROOT: Cell<usize> = const { Cell::new(0) };
    static INVALIDATIONS: RefCell<Vec<VirtualAddress>> = const { RefCell::new(Vec::new()) };
}

/// Returns the physical address of the active PML4 of the emulated CPU.
pub fn read_page_table_root() -> PhysicalAddress {
    PhysicalAddress::new(PAGE_TABLE_ROOT.with(Cell::get))
}

/// Loads `root` into the emulated CR3, standing in for the boot stage.
pub fn set_page_table_root(root: PhysicalAddress) {
    PAGE_TABLE_ROOT.with(|cr3| cr3.set(root.as_usize()));
}

/// Records an invalidation of the translation for `virt`.
pub fn invalidate_page(virt: VirtualAddress) {
    INVALIDATIONS.with(|log| log.borrow_mut().push(virt));
}

/// Returns every address invalidated since the last call, oldest first.
pub fn take_invalidations() -> Vec<VirtualAddress> {
    INVALIDATIONS.with(|log| core::mem::take(&mut *log.borrow_mut()))
}

/// Halts the emulated CPU by panicking.
pub fn halt() -> ! {
    panic!("CPU halted");
}

/// Emulated physical memory for software simulation.
///
/// A zero-filled, page-aligned buffer whose offsets are physical addresses, so physical
/// address `0x1000` is byte `0x1000` of the buffer. Page alignment lets page tables inside
/// the buffer be referenced with their real alignment.
pub struct EmulatedMemory {
    memory: NonNull<u8>,
    layout: Layout,
}

impl EmulatedMemory {
    /// Creates a new emulated memory region of the specified size.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or the host cannot provide the buffer.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "emulated memory must not be empty");
        let layout = Layout::from_size_align(size, PAGE_SIZE).expect("invalid emulated memory size");

        // SAFETY: `layout` has a non-zero size.
        let memory = unsafe { std::alloc::alloc_zeroed(layout) };
        let Some(memory) = NonNull::new(memory) else {
            std::alloc::handle_alloc_error(layout);
        };
        Self { memory, layout }
    }

    /// Translates a physical address to a pointer into the buffer.
    ///
    /// # Panics
    ///
    /// Panics if `phys` lies outside the emulated memory.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size(), "physical address out of bounds");
        // SAFETY: `phys` is within the buffer, checked above.
        unsafe { self.memory.as_ptr().add(phys) }
    }

    /// Translates the physical range `[phys, phys + len)` to a pointer into the buffer.
    ///
    /// # Panics
    ///
    /// Panics if any byte of the range lies outside the emulated memory.
    pub fn translate_range(&self, phys: usize, len: usize) -> *mut u8 {
        let end = phys.checked_add(len).expect("physical range overflows");
        assert!(end <= self.size(), "physical address out of bounds");
        // SAFETY: the whole range is within the buffer, checked above.
        unsafe { self.memory.as_ptr().add(phys) }
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: `memory` came from `alloc_zeroed` with `layout` and is released exactly once.
        unsafe { std::alloc::dealloc(self.memory.as_ptr(), self.layout) };
    }
}
