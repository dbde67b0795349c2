//! x86-64 page table format.
//!
//! The same layout is used on hardware and under software emulation, so the paging code
//! exercised by host tests writes exactly the bits the MMU would read.

use core::fmt;

use crate::{AddressTranslator, PhysicalAddress, arch};

bitflags::bitflags! {
    /// Page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u64 {
        /// The entry is valid.
        const PRESENT = 1 << 0;
        /// Writes are allowed.
        const WRITABLE = 1 << 1;
        /// Ring 3 may access the page.
        const USER = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Set by the CPU on access.
        const ACCESSED = 1 << 5;
        /// Set by the CPU on write.
        const DIRTY = 1 << 6;
        /// In a PDPT or PD entry: maps a 1 GiB or 2 MiB page instead of a table.
        const HUGE_PAGE = 1 << 7;
        /// The translation survives CR3 reloads.
        const GLOBAL = 1 << 8;
        /// Instruction fetches are not allowed.
        const NO_EXECUTE = 1 << 63;
    }
}

/// A single 64-bit page table entry: a frame address in bits 12-51 plus flags.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    /// Bits 12-51 hold the physical address.
    const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// Creates an entry pointing at `addr`, which is aligned down to a page.
    pub const fn new(addr: PhysicalAddress, flags: PageFlags) -> Self {
        Self((addr.as_u64() & Self::ADDRESS_MASK) | flags.bits())
    }

    /// Returns the raw 64-bit value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the physical address stored in the entry, or `None` if it is not present.
    pub fn address(self) -> Option<PhysicalAddress> {
        self.is_present()
            .then(|| PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize))
    }

    /// Returns the flags of the entry. Unknown bits are dropped.
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    /// Returns whether the entry is present.
    pub const fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    /// Returns whether the entry is present and maps a huge page.
    pub const fn is_huge(self) -> bool {
        self.is_present() && self.0 & PageFlags::HUGE_PAGE.bits() != 0
    }

    /// Clears the entry.
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageEntry")
            .field("address", &format_args!("{:#x}", self.0 & Self::ADDRESS_MASK))
            .field("flags", &self.flags())
            .finish()
    }
}

/// One page-aligned table of 512 entries, at any level of the hierarchy.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; arch::ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Returns the entry at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is 512 or more.
    pub fn entry(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is 512 or more.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        &mut self.entries[index]
    }

    /// Clears every entry.
    pub fn zero(&mut self) {
        self.entries.fill(PageEntry(0));
    }

    /// Returns the number of present entries.
    pub fn present_entries(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }

    /// Reinterprets the frame at `addr` as a page table, through the identity view.
    ///
    /// # Safety
    ///
    /// `addr` must be the page-aligned start of a frame holding a page table (or about to be
    /// zeroed into one), and no other reference to that table may be live for `'a`.
    pub(crate) unsafe fn from_physical<'a>(addr: PhysicalAddress) -> &'a mut PageTable {
        debug_assert!(addr.is_aligned(arch::PAGE_SIZE), "page table must be page-aligned");
        let ptr = AddressTranslator::current()
            .phys_range_to_ptr(addr.as_usize(), arch::PAGE_SIZE)
            .cast::<PageTable>();
        // SAFETY: The caller guarantees the frame is a page table we may borrow exclusively.
        unsafe { &mut *ptr }
    }
}
