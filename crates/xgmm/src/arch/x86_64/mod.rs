//! x86_64 hardware implementation.
//!
//! Thin wrappers over the `x86_64` crate for the handful of privileged operations the memory
//! manager performs: reading the page-table root, invalidating a TLB entry and parking the CPU.

use x86_64::{
    VirtAddr,
    instructions::{self, interrupts},
    registers::control::Cr3,
};

use crate::{PhysicalAddress, VirtualAddress};

/// Returns the physical address of the active PML4, as loaded in CR3.
pub fn read_page_table_root() -> PhysicalAddress {
    let (frame, _flags) = Cr3::read();
    PhysicalAddress::new(frame.start_address().as_u64() as usize)
}

/// Discards the cached translation for the page containing `virt`.
pub fn invalidate_page(virt: VirtualAddress) {
    instructions::tlb::flush(VirtAddr::new(virt.as_usize() as u64));
}

/// Stops the CPU with interrupts disabled. Never returns.
pub fn halt() -> ! {
    interrupts::disable();
    loop {
        instructions::hlt();
    }
}
