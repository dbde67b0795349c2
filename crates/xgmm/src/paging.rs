//! Paging manager.
//!
//! Owns the kernel's single address space. On [`init`](PagingManager::init) it adopts the
//! hierarchy the boot stage left active in CR3 instead of building a new one, then edits it in
//! place as mappings are requested.

use crate::{
    AddressSpace, FramebufferInfo, FrameSource, MemoryError, PageFlags, PhysicalAddress,
    VirtualAddress, arch,
};

/// Flags for a device framebuffer: writable, write-through, uncached.
const FRAMEBUFFER_FLAGS: PageFlags = PageFlags::PRESENT
    .union(PageFlags::WRITABLE)
    .union(PageFlags::WRITE_THROUGH)
    .union(PageFlags::CACHE_DISABLE);

/// A framebuffer that has been identity mapped and may now be drawn to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedFramebuffer {
    /// Virtual address of the first pixel.
    pub base: VirtualAddress,
    /// Bytes per scanline.
    pub pitch: u32,
    /// Visible pixels per scanline.
    pub width: u32,
    /// Number of scanlines.
    pub height: u32,
    /// Bits per pixel; always 32.
    pub bpp: u8,
}

impl MappedFramebuffer {
    /// Returns the number of mapped bytes.
    pub fn size(&self) -> usize {
        self.pitch as usize * self.height as usize
    }

    /// Returns the address of pixel `(x, y)`, or `None` if it is off screen.
    pub fn pixel_address(&self, x: u32, y: u32) -> Option<VirtualAddress> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = y as usize * self.pitch as usize + x as usize * (self.bpp as usize / 8);
        Some(self.base + offset)
    }
}

/// Manages the active page table hierarchy.
#[derive(Debug, Default)]
pub struct PagingManager {
    space: Option<AddressSpace>,
}

impl PagingManager {
    /// Creates a manager that has not yet adopted a hierarchy.
    pub const fn new() -> Self {
        Self { space: None }
    }

    /// Adopts the hierarchy currently loaded in CR3. Nothing is remapped.
    pub fn init(&mut self) {
        let root = arch::read_page_table_root().align_down(arch::PAGE_SIZE);
        log::info!("paging: using active PML4 at {}", root);
        self.space = Some(AddressSpace::new(root));
    }

    /// Returns true once [`init`](Self::init) has run.
    pub fn is_initialized(&self) -> bool {
        self.space.is_some()
    }

    /// Returns the managed address space, once initialized.
    pub fn address_space(&self) -> Option<&AddressSpace> {
        self.space.as_ref()
    }

    fn space(&mut self) -> Result<&mut AddressSpace, MemoryError> {
        self.space.as_mut().ok_or_else(|| {
            log::warn!("paging: used before init");
            MemoryError::NotInitialized
        })
    }

    /// Maps the page containing `virt` to the frame containing `phys` with exactly `flags`.
    ///
    /// Missing tables are taken from `frames`. On failure no table linked by this call
    /// remains linked.
    pub fn map_page<F: FrameSource>(
        &mut self,
        frames: &mut F,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MemoryError> {
        self.space()?.map(frames, virt, phys, flags)?;
        log::trace!("mapped {} -> {} ({:?})", virt, phys, flags);
        Ok(())
    }

    /// Removes the mapping of the page containing `virt`, returning the frame it pointed at.
    ///
    /// Unmapping an address with no tables behind it does nothing.
    pub fn unmap_page(&mut self, virt: VirtualAddress) -> Result<Option<PhysicalAddress>, MemoryError> {
        let old = self.space()?.unmap(virt)?;
        log::trace!("unmapped {}", virt);
        Ok(old)
    }

    /// Translates `virt` through the active hierarchy, honouring 2 MiB and 1 GiB pages.
    pub fn resolve(&self, virt: VirtualAddress) -> Result<PhysicalAddress, MemoryError> {
        let Some(space) = self.space.as_ref() else {
            log::warn!("paging: resolve before init");
            return Err(MemoryError::NotInitialized);
        };
        space.translate(virt).ok_or(MemoryError::NotMapped(virt))
    }

    /// Identity maps every 4 KiB page touched by `[base, base + size)`.
    ///
    /// Returns the number of pages mapped. A page that cannot be mapped is logged and
    /// skipped, and the rest of the region is still mapped. Running out of frames for page
    /// tables ends the call with [`MemoryError::OutOfFrames`].
    pub fn map_region<F: FrameSource>(
        &mut self,
        frames: &mut F,
        base: PhysicalAddress,
        size: usize,
        flags: PageFlags,
    ) -> Result<usize, MemoryError> {
        let space = self.space()?;

        let start = base.align_down(arch::PAGE_SIZE);
        let end = base
            .as_usize()
            .checked_add(size)
            .and_then(|end| end.checked_next_multiple_of(arch::PAGE_SIZE))
            .and_then(PhysicalAddress::try_new)
            .ok_or(MemoryError::OutOfRange(base))?;

        let mut pages = 0;
        let mut skipped = 0;
        for addr in (start.as_usize()..end.as_usize()).step_by(arch::PAGE_SIZE) {
            let phys = PhysicalAddress::new(addr);
            let result = match VirtualAddress::identity(phys) {
                Some(virt) => space.map(frames, virt, phys, flags),
                None => Err(MemoryError::OutOfRange(phys)),
            };
            match result {
                Ok(()) => pages += 1,
                Err(MemoryError::OutOfFrames) => return Err(MemoryError::OutOfFrames),
                Err(err) => {
                    log::warn!("map_region: skipping {}: {}", phys, err);
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            log::warn!("identity mapped {}..{} ({} pages, {} skipped)", start, end, pages, skipped);
        } else {
            log::debug!("identity mapped {}..{} ({} pages)", start, end, pages);
        }
        Ok(pages)
    }

    /// Validates a boot framebuffer and identity maps it as uncached, write-through memory.
    pub fn map_framebuffer<F: FrameSource>(
        &mut self,
        frames: &mut F,
        info: &FramebufferInfo,
    ) -> Result<MappedFramebuffer, MemoryError> {
        info.validate()?;

        let base = PhysicalAddress::new(info.address as usize);
        let size = info.size() as usize;
        self.map_region(frames, base, size, FRAMEBUFFER_FLAGS)?;

        log::info!(
            "framebuffer: {}x{}x{} at {}, pitch {}",
            info.width,
            info.height,
            info.bpp,
            base,
            info.pitch
        );

        let virt = VirtualAddress::identity(base).ok_or(MemoryError::OutOfRange(base))?;
        Ok(MappedFramebuffer {
            base: virt,
            pitch: info.pitch,
            width: info.width,
            height: info.height,
            bpp: info.bpp,
        })
    }
}
