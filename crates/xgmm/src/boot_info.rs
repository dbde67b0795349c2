//! Multiboot boot information.
//!
//! The bootloader leaves a Multiboot (version 1) information structure in physical memory
//! and passes its address to the kernel entry point. This module reads the parts the memory
//! manager consumes: the coarse memory sizes, the memory map, the module list and the
//! framebuffer descriptor. Everything is read through the identity view, so the same code
//! parses a structure built by a test in emulated memory.

use core::mem::size_of;

use crate::{FramebufferError, HumanSize, PhysicalAddress};

/// Flag bit: `mem_lower` and `mem_upper` are valid.
pub(crate) const FLAG_MEMORY: u32 = 1 << 0;
/// Flag bit: `mods_count` and `mods_addr` are valid.
pub(crate) const FLAG_MODULES: u32 = 1 << 3;
/// Flag bit: `mmap_length` and `mmap_addr` are valid.
pub(crate) const FLAG_MEMORY_MAP: u32 = 1 << 6;
/// Flag bit: the framebuffer fields are valid.
pub(crate) const FLAG_FRAMEBUFFER: u32 = 1 << 12;

/// Memory map type for RAM available to the kernel.
pub(crate) const MEMORY_TYPE_USABLE: u32 = 1;
/// Memory map type for firmware-reserved memory.
pub(crate) const MEMORY_TYPE_RESERVED: u32 = 2;

/// Start of upper memory; `mem_upper` counts kilobytes above this address.
pub(crate) const LOW_MEMORY_LIMIT: u64 = 0x10_0000;

/// Largest framebuffer accepted, in bytes.
const MAX_FRAMEBUFFER_SIZE: u64 = 0x1000_0000;

/// Longest module name read from boot memory.
const MAX_MODULE_NAME: usize = 256;

/// The fixed part of the Multiboot information structure, up to the framebuffer type.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RawBootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub _boot_device: u32,
    pub _cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub _syms: [u32; 4],
    pub mmap_length: u32,
    pub mmap_addr: u32,
    pub _drives: [u32; 2],
    pub _tables: [u32; 5],
    pub _vbe: [u16; 4],
    pub framebuffer_addr: u64,
    pub framebuffer_pitch: u32,
    pub framebuffer_width: u32,
    pub framebuffer_height: u32,
    pub framebuffer_bpp: u8,
    pub framebuffer_type: u8,
}

/// A memory map entry as laid out by the bootloader. `size` excludes itself.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawMemoryMapEntry {
    pub size: u32,
    pub base: u64,
    pub length: u64,
    pub kind: u32,
}

/// A module list entry as laid out by the bootloader.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawModule {
    pub start: u32,
    pub end: u32,
    pub name: u32,
    pub _reserved: u32,
}

/// Reads a `T` from physical memory without alignment requirements.
///
/// # Safety
///
/// `addr` must hold a valid `T` reachable through the identity view.
unsafe fn read_physical<T: Copy>(addr: PhysicalAddress) -> T {
    // SAFETY: The caller guarantees `addr` holds a valid `T`.
    unsafe { addr.identity_view::<T>().read_unaligned() }
}

/// Parsed Multiboot boot information.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    flags: u32,
    mem_lower_kb: u32,
    mem_upper_kb: u32,
    memory_map: Option<(PhysicalAddress, usize)>,
    modules: Option<(PhysicalAddress, usize)>,
    framebuffer: Option<FramebufferInfo>,
}

impl BootInfo {
    /// Parses the Multiboot information structure at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must point to a valid Multiboot information structure, and the memory map,
    /// module list and module names it references must stay intact for as long as the
    /// returned value (or any iterator derived from it) is used.
    pub unsafe fn parse(addr: PhysicalAddress) -> Self {
        // SAFETY: The caller guarantees a valid structure at `addr`.
        let raw: RawBootInfo = unsafe { read_physical(addr) };
        Self::from_raw(&raw)
    }

    fn from_raw(raw: &RawBootInfo) -> Self {
        let memory_map = (raw.flags & FLAG_MEMORY_MAP != 0).then(|| {
            (
                PhysicalAddress::new(raw.mmap_addr as usize),
                raw.mmap_length as usize,
            )
        });
        let modules = (raw.flags & FLAG_MODULES != 0).then(|| {
            (
                PhysicalAddress::new(raw.mods_addr as usize),
                raw.mods_count as usize,
            )
        });
        let framebuffer = (raw.flags & FLAG_FRAMEBUFFER != 0).then(|| FramebufferInfo {
            address: raw.framebuffer_addr,
            pitch: raw.framebuffer_pitch,
            width: raw.framebuffer_width,
            height: raw.framebuffer_height,
            bpp: raw.framebuffer_bpp,
            kind: FramebufferType::from(raw.framebuffer_type),
        });

        Self {
            flags: raw.flags,
            mem_lower_kb: raw.mem_lower,
            mem_upper_kb: raw.mem_upper,
            memory_map,
            modules,
            framebuffer,
        }
    }

    /// Returns the raw flags word.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Returns true if the bootloader filled in `mem_lower`/`mem_upper`.
    pub fn has_memory_sizes(&self) -> bool {
        self.flags & FLAG_MEMORY != 0
    }

    /// Returns the amount of lower memory (below 640 KiB) in KiB.
    pub fn mem_lower_kb(&self) -> u32 {
        self.mem_lower_kb
    }

    /// Returns the amount of upper memory (above 1 MiB) in KiB.
    pub fn mem_upper_kb(&self) -> u32 {
        self.mem_upper_kb
    }

    /// Returns an iterator over the memory map, or `None` if the bootloader provided none.
    pub fn memory_map(&self) -> Option<MemoryMapIter> {
        self.memory_map
            .map(|(addr, length)| MemoryMapIter::new(addr, length))
    }

    /// Returns an iterator over the boot modules. Empty when no module list was provided.
    pub fn modules(&self) -> ModuleIter {
        match self.modules {
            Some((addr, count)) => ModuleIter {
                cursor: addr,
                remaining: count,
            },
            None => ModuleIter {
                cursor: PhysicalAddress::new(0),
                remaining: 0,
            },
        }
    }

    /// Returns the framebuffer descriptor, if any.
    pub fn framebuffer(&self) -> Option<&FramebufferInfo> {
        self.framebuffer.as_ref()
    }

    /// Logs the memory sizes, every memory map entry and every module.
    pub fn log_summary(&self) {
        log::info!(
            "mem_lower={}KB mem_upper={}KB",
            self.mem_lower_kb,
            self.mem_upper_kb
        );

        match self.memory_map {
            Some((addr, length)) => {
                log::info!("memory map: {} bytes at {}", length, addr);
                for (idx, entry) in MemoryMapIter::new(addr, length).enumerate() {
                    log::debug!(
                        "  [{}] base={:#x} len={:#x} type={} ({})",
                        idx,
                        entry.base,
                        entry.length,
                        entry.kind,
                        HumanSize::from(entry.length)
                    );
                }
            }
            None => log::warn!("no memory map, falling back to mem_upper"),
        }

        if let Some((_, count)) = self.modules {
            log::info!("modules ({}):", count);
            for (idx, module) in self.modules().enumerate() {
                log::info!(
                    "  [{}] {}-{} '{}'",
                    idx,
                    module.start,
                    module.end,
                    module.name().unwrap_or("?")
                );
            }
        }
    }
}

/// A memory map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapEntry {
    /// First byte of the region.
    pub base: u64,
    /// Length of the region in bytes.
    pub length: u64,
    /// Bootloader type code; `1` is usable RAM.
    pub kind: u32,
}

/// Iterator over the entries of a Multiboot memory map.
///
/// Entries are variable-sized: each starts with a `size` field that excludes itself, so the
/// next entry begins `size + 4` bytes later.
#[derive(Debug, Clone)]
pub struct MemoryMapIter {
    cursor: usize,
    end: usize,
}

impl MemoryMapIter {
    fn new(addr: PhysicalAddress, length: usize) -> Self {
        Self {
            cursor: addr.as_usize(),
            end: addr.as_usize() + length,
        }
    }
}

impl Iterator for MemoryMapIter {
    type Item = MemoryMapEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor + size_of::<RawMemoryMapEntry>() > self.end {
            return None;
        }

        // SAFETY: BootInfo::parse's contract keeps the memory map intact, and the entry
        // lies within its bounds (checked above).
        let raw: RawMemoryMapEntry = unsafe { read_physical(PhysicalAddress::new(self.cursor)) };
        self.cursor += raw.size as usize + size_of::<u32>();

        Some(MemoryMapEntry {
            base: raw.base,
            length: raw.length,
            kind: raw.kind,
        })
    }
}

/// A module loaded by the bootloader alongside the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootModule {
    /// First byte of the module.
    pub start: PhysicalAddress,
    /// One past the last byte of the module.
    pub end: PhysicalAddress,
    name: Option<PhysicalAddress>,
}

impl BootModule {
    /// Creates a module spanning `[start, end)` with no name.
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        Self {
            start,
            end,
            name: None,
        }
    }

    /// Returns the module's command line, if it has one and it is valid UTF-8.
    pub fn name(&self) -> Option<&'static str> {
        let addr = self.name?;
        let ptr = addr.identity_view::<u8>();

        // SAFETY: BootInfo::parse's contract keeps module names intact; the string is
        // NUL-terminated, and the scan is bounded.
        let bytes = unsafe {
            let mut len = 0;
            while len < MAX_MODULE_NAME && *ptr.add(len) != 0 {
                len += 1;
            }
            core::slice::from_raw_parts(ptr, len)
        };
        core::str::from_utf8(bytes).ok()
    }
}

/// Iterator over the Multiboot module list.
#[derive(Debug, Clone)]
pub struct ModuleIter {
    cursor: PhysicalAddress,
    remaining: usize,
}

impl Iterator for ModuleIter {
    type Item = BootModule;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        // SAFETY: BootInfo::parse's contract keeps the module list intact, and fewer than
        // `mods_count` entries have been read.
        let raw: RawModule = unsafe { read_physical(self.cursor) };
        self.cursor = self.cursor + size_of::<RawModule>();
        self.remaining -= 1;

        Some(BootModule {
            start: PhysicalAddress::new(raw.start as usize),
            end: PhysicalAddress::new(raw.end as usize),
            name: (raw.name != 0).then(|| PhysicalAddress::new(raw.name as usize)),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

/// Pixel format family of a boot framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferType {
    /// Palette-indexed pixels.
    Indexed,
    /// Direct RGB pixels.
    DirectRgb,
    /// EGA text mode; not a pixel buffer at all.
    EgaText,
    /// Any other type code.
    Unknown(u8),
}

impl From<u8> for FramebufferType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Indexed,
            1 => Self::DirectRgb,
            2 => Self::EgaText,
            other => Self::Unknown(other),
        }
    }
}

impl From<FramebufferType> for u8 {
    fn from(value: FramebufferType) -> Self {
        match value {
            FramebufferType::Indexed => 0,
            FramebufferType::DirectRgb => 1,
            FramebufferType::EgaText => 2,
            FramebufferType::Unknown(other) => other,
        }
    }
}

/// The framebuffer descriptor handed over by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferInfo {
    /// Physical address of the first pixel.
    pub address: u64,
    /// Bytes per scanline.
    pub pitch: u32,
    /// Visible pixels per scanline.
    pub width: u32,
    /// Number of scanlines.
    pub height: u32,
    /// Bits per pixel.
    pub bpp: u8,
    /// Pixel format family.
    pub kind: FramebufferType,
}

impl FramebufferInfo {
    /// Returns the number of bytes spanned by the framebuffer (`pitch * height`).
    pub fn size(&self) -> u64 {
        u64::from(self.pitch) * u64::from(self.height)
    }

    /// Checks that the framebuffer is a plausible 32-bit direct RGB pixel buffer.
    pub fn validate(&self) -> Result<(), FramebufferError> {
        if self.address == 0 {
            return Err(FramebufferError::NullAddress);
        }
        if self.address < LOW_MEMORY_LIMIT {
            return Err(FramebufferError::LowAddress(PhysicalAddress::new(
                self.address as usize,
            )));
        }
        if self.kind != FramebufferType::DirectRgb {
            return Err(FramebufferError::NotRgb(self.kind.into()));
        }
        if self.bpp != 32 {
            return Err(FramebufferError::UnsupportedDepth(self.bpp));
        }
        if self.pitch == 0 || self.width == 0 || self.height == 0 {
            return Err(FramebufferError::ZeroGeometry);
        }
        if self.size() > MAX_FRAMEBUFFER_SIZE {
            return Err(FramebufferError::TooLarge(self.size()));
        }
        let last = self.address.saturating_add(self.size() - 1);
        if PhysicalAddress::try_new(last as usize).is_none() {
            return Err(FramebufferError::Unaddressable(self.address));
        }
        Ok(())
    }
}
