//! Walking and editing a 4-level page table hierarchy.
//!
//! An [`AddressSpace`] is identified by the physical address of its PML4. Tables are reached
//! through the identity view, and new intermediate tables come from a [`FrameSource`].

use crate::{
    FrameSource, MemoryError, PageEntry, PageFlags, PageTable, PhysicalAddress, VirtualAddress,
    arch,
};

/// Flags of an entry that links to a lower-level table.
const TABLE_FLAGS: PageFlags = PageFlags::PRESENT.union(PageFlags::WRITABLE);

/// A table linked while building a walk: parent table, index within it, new table frame.
type LinkedTable = (PhysicalAddress, usize, PhysicalAddress);

/// A virtual address space rooted at a PML4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    root: PhysicalAddress,
}

impl AddressSpace {
    /// Wraps the hierarchy whose PML4 is at `root`.
    pub const fn new(root: PhysicalAddress) -> Self {
        Self { root }
    }

    /// Returns the physical address of the PML4.
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Returns the entry that finally maps `virt`, together with its level.
    ///
    /// The walk stops early at a huge PDPT (level 2) or PD (level 1) entry. Returns `None` if
    /// a table on the way is absent.
    pub fn lookup(&self, virt: VirtualAddress) -> Option<(PageEntry, usize)> {
        let mut table_addr = self.root;
        for level in (0..arch::PAGE_TABLE_LEVELS).rev() {
            // SAFETY: `table_addr` is the root or was read from a present table entry.
            let table = unsafe { PageTable::from_physical(table_addr) };
            let entry = table.entry(virt.page_index(level));

            if level == 0 || (level <= 2 && entry.is_huge()) {
                return Some((entry, level));
            }
            table_addr = entry.address()?;
        }
        None
    }

    /// Translates `virt` to the physical address it maps to.
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let (entry, level) = self.lookup(virt)?;
        let span = arch::level_span(level);
        let base = entry.address()?.align_down(span);
        Some(base + (virt.as_usize() & (span - 1)))
    }

    /// Points the 4 KiB page containing `virt` at the frame containing `phys`.
    ///
    /// Missing tables are allocated from `frames`, zeroed and linked as present and writable.
    /// The leaf entry is written with exactly `flags`, replacing any previous mapping. If the
    /// walk fails, every table linked by this call is unlinked and returned to `frames`.
    pub fn map<F: FrameSource>(
        &mut self,
        frames: &mut F,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MemoryError> {
        let entry = self.leaf_or_create(frames, virt)?;
        *entry = PageEntry::new(phys.align_down(arch::PAGE_SIZE), flags);
        arch::invalidate_page(virt.align_down(arch::PAGE_SIZE));
        Ok(())
    }

    /// Clears the 4 KiB mapping of `virt` and returns the frame it pointed at.
    ///
    /// Does nothing if a table on the way is absent. Tables are never freed.
    pub fn unmap(&mut self, virt: VirtualAddress) -> Result<Option<PhysicalAddress>, MemoryError> {
        let Some(entry) = self.leaf(virt)? else {
            return Ok(None);
        };

        let old = entry.address();
        entry.clear();
        arch::invalidate_page(virt.align_down(arch::PAGE_SIZE));
        Ok(old)
    }

    /// Walks to the PT entry for `virt` without creating tables.
    fn leaf(&mut self, virt: VirtualAddress) -> Result<Option<&mut PageEntry>, MemoryError> {
        let mut table_addr = self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            // SAFETY: `table_addr` is the root or was read from a present table entry.
            let entry = unsafe { PageTable::from_physical(table_addr) }.entry(virt.page_index(level));
            if entry.is_huge() {
                return Err(MemoryError::HugePageConflict(virt));
            }
            match entry.address() {
                Some(next) => table_addr = next,
                None => return Ok(None),
            }
        }

        // SAFETY: `table_addr` was read from a present PD entry.
        let table = unsafe { PageTable::from_physical(table_addr) };
        Ok(Some(table.entry_mut(virt.page_index(0))))
    }

    /// Walks to the PT entry for `virt`, creating missing tables.
    fn leaf_or_create<F: FrameSource>(
        &mut self,
        frames: &mut F,
        virt: VirtualAddress,
    ) -> Result<&mut PageEntry, MemoryError> {
        let mut linked: [Option<LinkedTable>; arch::PAGE_TABLE_LEVELS - 1] = [None; 3];
        let mut table_addr = self.root;

        for (slot, level) in (1..arch::PAGE_TABLE_LEVELS).rev().enumerate() {
            let index = virt.page_index(level);
            // SAFETY: `table_addr` is the root, was read from a present table entry, or was
            // just zeroed and linked below.
            let entry = unsafe { PageTable::from_physical(table_addr) }.entry_mut(index);

            if entry.is_huge() {
                unlink(frames, &linked);
                return Err(MemoryError::HugePageConflict(virt));
            }

            table_addr = match entry.address() {
                Some(next) => next,
                None => {
                    let Some(frame) = frames.allocate_frame() else {
                        log::error!("no frame left for a level {} table mapping {}", level - 1, virt);
                        unlink(frames, &linked);
                        return Err(MemoryError::OutOfFrames);
                    };

                    // SAFETY: The frame was just allocated, so nothing else refers to it.
                    unsafe { PageTable::from_physical(frame) }.zero();
                    *entry = PageEntry::new(frame, TABLE_FLAGS);
                    linked[slot] = Some((table_addr, index, frame));
                    log::trace!("linked level {} table at {} for {}", level - 1, frame, virt);
                    frame
                }
            };
        }

        // SAFETY: `table_addr` was read from a present PD entry or just linked.
        let table = unsafe { PageTable::from_physical(table_addr) };
        Ok(table.entry_mut(virt.page_index(0)))
    }
}

/// Undoes the tables linked by a failed walk, deepest first.
fn unlink<F: FrameSource>(frames: &mut F, linked: &[Option<LinkedTable>]) {
    for &(parent, index, frame) in linked.iter().rev().flatten() {
        // SAFETY: `parent` is a table on the walk that linked `frame` at `index`.
        unsafe { PageTable::from_physical(parent) }.entry_mut(index).clear();
        if let Err(err) = frames.free_frame(frame) {
            log::warn!("failed to return table frame {}: {}", frame, err);
        }
    }
}
