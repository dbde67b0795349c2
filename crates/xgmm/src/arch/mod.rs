//! Architecture-specific primitives for memory management.
//!
//! The page-table format is always x86-64 4-level paging, so the geometry below is shared.
//! What differs is how the CPU is reached: the hardware backend reads CR3 and issues `invlpg`
//! through the `x86_64` crate, while the software backend emulates the register, the TLB and
//! physical memory so the same code runs in host tests.

// Real hardware: kernel builds for x86_64.
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::*;

// Host builds: unit tests, or the `software-emulation` feature.
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

/// Width of a physical address (bits 12-51 of a table entry hold the frame).
pub const MAX_PHYSICAL_BITS: usize = 52;

/// Width of a virtual address under 4-level paging.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// Page and frame size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of page table levels (PML4, PDPT, PD, PT).
pub const PAGE_TABLE_LEVELS: usize = 4;

/// Number of entries in a table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

const INDEX_BITS: usize = 9;
const PAGE_SHIFT: usize = 12;

/// Extracts the 9-bit table index of `address` at `level`.
///
/// Level 0 is the page table (PT, bits 12-20), level 1 the page directory (PD, bits 21-29),
/// level 2 the page directory pointer table (PDPT, bits 30-38) and level 3 the PML4
/// (bits 39-47).
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range for x86_64 page table levels");
    (address >> (PAGE_SHIFT + level * INDEX_BITS)) & (ENTRIES_PER_TABLE - 1)
}

/// Returns the number of bytes mapped by a single entry at `level`.
///
/// A PT entry covers 4 KiB, a PD entry 2 MiB, a PDPT entry 1 GiB and a PML4 entry 512 GiB.
#[inline]
pub const fn level_span(level: usize) -> usize {
    1 << (PAGE_SHIFT + level * INDEX_BITS)
}

/// Returns true if `addr` fits the physical address width.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1usize << MAX_PHYSICAL_BITS)
}

/// Returns true if `addr` is canonical.
///
/// Virtual addresses must be canonical (bits 48-63 must be sign-extended from bit 47).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let shift = usize::BITS as usize - MAX_VIRTUAL_BITS;
    (((addr << shift) as isize) >> shift) as usize == addr
}
