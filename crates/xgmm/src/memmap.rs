//! Physical memory map.
//!
//! The bootloader reports RAM as a list of typed regions. [`MemoryMap`] keeps a fixed-size
//! copy of that list so the frame allocator can consult it before any allocator exists.
//!
//! # Building a Memory Map
//!
//! Implement [`BootMemoryRegion`] on the bootloader's entry type (the Multiboot
//! [`MemoryMapEntry`] already does) and call [`MemoryMap::from_boot_map`]:
//!
//! ```ignore
//! let map = MemoryMap::from_boot_map(boot_info.memory_map().into_iter().flatten());
//! ```
//!
//! When the bootloader supplies no map, [`MemoryMap::from_boot_info`] falls back to a single
//! usable region covering the `mem_upper` kilobytes above 1 MiB.

use crate::boot_info::{LOW_MEMORY_LIMIT, MEMORY_TYPE_RESERVED, MEMORY_TYPE_USABLE};
use crate::{BootInfo, FrameRange, HumanSize, MemoryMapEntry};

/// Maximum number of regions retained from the boot memory map.
pub const MAX_REGIONS: usize = 128;

/// Classification of a physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// RAM the kernel may allocate from.
    Usable,
    /// Memory reserved by firmware.
    Reserved,
    /// ACPI tables, NVS, bad memory and anything else the kernel must leave alone.
    Other,
}

impl From<u32> for RegionKind {
    fn from(value: u32) -> Self {
        match value {
            MEMORY_TYPE_USABLE => Self::Usable,
            MEMORY_TYPE_RESERVED => Self::Reserved,
            _ => Self::Other,
        }
    }
}

/// Represents a single entry in a boot-time memory map.
///
/// Implement this trait on bootloader-specific memory map entry types to build a
/// [`MemoryMap`] from them.
pub trait BootMemoryRegion {
    /// Returns the first byte of the region.
    fn base(&self) -> u64;

    /// Returns the size of the region in bytes.
    fn size(&self) -> u64;

    /// Returns what the region holds.
    fn kind(&self) -> RegionKind;

    /// Returns whether this region contains memory the kernel may allocate from.
    fn is_usable(&self) -> bool {
        self.kind() == RegionKind::Usable
    }
}

impl BootMemoryRegion for MemoryMapEntry {
    fn base(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u64 {
        self.length
    }

    fn kind(&self) -> RegionKind {
        RegionKind::from(self.kind)
    }
}

/// A range of physical memory and its classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalMemoryRegion {
    /// First byte of the region.
    pub base: u64,
    /// Length of the region in bytes.
    pub length: u64,
    /// What the region holds.
    pub kind: RegionKind,
}

impl PhysicalMemoryRegion {
    const EMPTY: Self = Self {
        base: 0,
        length: 0,
        kind: RegionKind::Reserved,
    };

    /// Creates a usable region.
    pub const fn usable(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            kind: RegionKind::Usable,
        }
    }

    /// Creates a reserved region.
    pub const fn reserved(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            kind: RegionKind::Reserved,
        }
    }

    /// Returns one past the last byte of the region, saturating at the top of the
    /// address space.
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    /// Returns the frames lying entirely inside the region.
    pub const fn frames(&self) -> FrameRange {
        FrameRange::within(self.base, self.end())
    }
}

impl BootMemoryRegion for PhysicalMemoryRegion {
    fn base(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u64 {
        self.length
    }

    fn kind(&self) -> RegionKind {
        self.kind
    }
}

/// The physical memory regions reported at boot.
///
/// Immutable once built.
#[derive(Debug, Clone)]
pub struct MemoryMap {
    regions: [PhysicalMemoryRegion; MAX_REGIONS],
    len: usize,
    fallback: bool,
}

impl MemoryMap {
    /// Constructs a memory map from boot-time memory map entries.
    ///
    /// Entries past [`MAX_REGIONS`] are dropped with a warning.
    pub fn from_boot_map<R, I>(boot_map: I) -> Self
    where
        R: BootMemoryRegion,
        I: IntoIterator<Item = R>,
    {
        let mut map = Self {
            regions: [PhysicalMemoryRegion::EMPTY; MAX_REGIONS],
            len: 0,
            fallback: false,
        };

        let mut dropped = 0usize;
        for region in boot_map {
            if map.len == MAX_REGIONS {
                dropped += 1;
                continue;
            }
            map.regions[map.len] = PhysicalMemoryRegion {
                base: region.base(),
                length: region.size(),
                kind: region.kind(),
            };
            map.len += 1;
        }

        if dropped > 0 {
            log::warn!(
                "memory map has {} regions more than the {} supported; ignoring them",
                dropped,
                MAX_REGIONS
            );
        }

        log::trace!(
            "built memory map with {} regions, highest usable address {:#x} ({})",
            map.len,
            map.highest_usable_address(),
            HumanSize::from(map.usable_bytes())
        );

        map
    }

    /// Constructs a memory map covering `mem_upper_kb` KiB of usable memory starting at 1 MiB.
    pub fn fallback(mem_upper_kb: u32) -> Self {
        let length = u64::from(mem_upper_kb) * 1024;
        let mut map = Self::from_boot_map([PhysicalMemoryRegion::usable(LOW_MEMORY_LIMIT, length)]);
        map.fallback = true;
        map
    }

    /// Constructs the memory map described by the boot information, falling back to
    /// `mem_upper` when no memory map was provided.
    pub fn from_boot_info(boot_info: &BootInfo) -> Self {
        match boot_info.memory_map() {
            Some(entries) => Self::from_boot_map(entries),
            None => Self::fallback(boot_info.mem_upper_kb()),
        }
    }

    /// Returns true if this map was synthesized from `mem_upper` rather than reported.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// Returns all retained regions in boot order.
    pub fn regions(&self) -> &[PhysicalMemoryRegion] {
        &self.regions[..self.len]
    }

    /// Returns the usable regions in boot order.
    pub fn usable(&self) -> impl Iterator<Item = &PhysicalMemoryRegion> {
        self.regions().iter().filter(|r| r.is_usable())
    }

    /// Returns one past the highest byte of usable memory, or zero if there is none.
    pub fn highest_usable_address(&self) -> u64 {
        self.usable().map(PhysicalMemoryRegion::end).max().unwrap_or(0)
    }

    /// Returns the total number of usable bytes.
    pub fn usable_bytes(&self) -> u64 {
        self.usable().map(|r| r.length).sum()
    }
}
