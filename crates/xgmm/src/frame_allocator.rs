//! Physical frame allocator.
//!
//! The allocator keeps one bit per 4 KiB frame between address zero and the end of the
//! highest usable region. The bitmap itself lives in physical memory directly after the
//! kernel image, so it needs no allocator to exist before it.
//!
//! Initialization happens in a fixed order: every frame starts unavailable, frames wholly
//! inside usable regions are released, and then the bitmap storage, the kernel image and the
//! boot modules are reserved again. Reservations therefore always win over the memory map.

use crate::{
    BootInfo, BootModule, FrameBitmap, FrameNumber, FrameRange, HumanSize, MemoryError, MemoryMap,
    PhysicalAddress, arch,
};

/// The loaded kernel image, which occupies physical memory from address zero to `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelImage {
    end: PhysicalAddress,
}

impl KernelImage {
    /// Describes a kernel image ending (exclusive) at `end`, typically the `.bss` end symbol.
    pub const fn new(end: PhysicalAddress) -> Self {
        Self { end }
    }

    /// Returns the first byte past the kernel image.
    pub const fn end(&self) -> PhysicalAddress {
        self.end
    }

    /// Returns the frames covered by the image, `[0, align_up(end))`.
    pub const fn frames(&self) -> FrameRange {
        FrameRange::covering(0, self.end.as_u64())
    }
}

/// A source of physical frames.
///
/// This is the seam through which the paging code obtains frames for new page tables and
/// returns them when a mapping attempt is rolled back.
pub trait FrameSource {
    /// Allocates one frame, or returns `None` when no frame is free.
    fn allocate_frame(&mut self) -> Option<PhysicalAddress>;

    /// Returns a frame previously obtained from [`allocate_frame`](Self::allocate_frame).
    fn free_frame(&mut self, addr: PhysicalAddress) -> Result<(), MemoryError>;
}

/// Bitmap-based physical frame allocator.
///
/// Frames are always handed out lowest address first.
pub struct FrameAllocator {
    bitmap: FrameBitmap<'static>,
    bitmap_base: PhysicalAddress,
}

impl FrameAllocator {
    /// Builds the allocator from the boot information.
    ///
    /// Logs the reported memory layout and the resulting frame counts.
    ///
    /// # Safety
    ///
    /// Physical memory from `kernel.end()` up to the end of the bitmap must be unused RAM
    /// reachable through the identity view, and every address referenced by `boot_info`
    /// must satisfy the contract of [`BootInfo::parse`].
    pub unsafe fn init(boot_info: &BootInfo, kernel: KernelImage) -> Result<Self, MemoryError> {
        boot_info.log_summary();
        let map = MemoryMap::from_boot_info(boot_info);

        // SAFETY: Forwarded from the caller.
        unsafe { Self::from_memory_map(&map, kernel, boot_info.modules()) }
    }

    /// Builds the allocator from an already parsed memory map.
    ///
    /// # Safety
    ///
    /// Physical memory from `kernel.end()` up to the end of the bitmap must be unused RAM
    /// reachable through the identity view.
    pub unsafe fn from_memory_map<I>(
        map: &MemoryMap,
        kernel: KernelImage,
        modules: I,
    ) -> Result<Self, MemoryError>
    where
        I: IntoIterator<Item = BootModule>,
    {
        let highest = map.highest_usable_address();
        let total_frames = (highest / arch::PAGE_SIZE as u64) as usize;
        if total_frames == 0 {
            log::error!("memory map reports no usable memory");
            return Err(MemoryError::NoUsableMemory);
        }

        let bitmap_base = kernel.end();
        let bitmap_len = FrameBitmap::bytes_for(total_frames);
        log::debug!(
            "frame bitmap: {} frames, {} bytes at {}",
            total_frames,
            bitmap_len,
            bitmap_base
        );

        // SAFETY: The caller guarantees the memory after the kernel image is ours.
        let storage = unsafe { bitmap_base.identity_slice_mut(bitmap_len) };
        let mut bitmap = FrameBitmap::new(storage, total_frames);
        for region in map.usable() {
            bitmap.clear_range(region.frames());
        }

        let mut allocator = Self {
            bitmap,
            bitmap_base,
        };
        allocator.reserve_range(bitmap_base, bitmap_len);
        allocator.bitmap.set_range(kernel.frames());
        for module in modules {
            log::debug!("reserving module {}-{}", module.start, module.end);
            allocator
                .bitmap
                .set_range(FrameRange::covering(module.start.as_u64(), module.end.as_u64()));
        }

        log::info!(
            "frame allocator: {} frames ({}), {} free, {} reserved",
            allocator.total_frames(),
            HumanSize::from(highest),
            allocator.free_frames(),
            allocator.reserved_frames()
        );

        Ok(allocator)
    }

    /// Returns the number of frames tracked.
    pub fn total_frames(&self) -> usize {
        self.bitmap.frames()
    }

    /// Returns the number of free frames.
    pub fn free_frames(&self) -> usize {
        self.bitmap.count_clear()
    }

    /// Returns the number of unavailable frames.
    pub fn reserved_frames(&self) -> usize {
        self.total_frames() - self.free_frames()
    }

    /// Returns true if `frame` is free.
    pub fn is_available(&self, frame: FrameNumber) -> bool {
        !self.bitmap.is_set(frame)
    }

    /// Marks every frame touched by `[base, base + len)` unavailable.
    pub fn reserve_range(&mut self, base: PhysicalAddress, len: usize) {
        let start = base.as_u64();
        self.bitmap
            .set_range(FrameRange::covering(start, start.saturating_add(len as u64)));
    }

    /// Returns the first byte past the bitmap storage.
    pub fn bitmap_end(&self) -> PhysicalAddress {
        self.bitmap_base + self.bitmap.storage_len()
    }

    /// Allocates the lowest free frame.
    pub fn allocate_frame(&mut self) -> Option<PhysicalAddress> {
        let Some(frame) = self.bitmap.first_clear() else {
            log::warn!("out of physical frames");
            return None;
        };

        self.bitmap.set(frame);
        log::trace!("allocated frame {}", frame.start());
        Some(frame.start())
    }

    /// Releases the frame starting at `addr`.
    ///
    /// A misaligned or untracked address changes nothing and is reported as an error.
    /// Freeing a frame that is already free succeeds.
    pub fn free_frame(&mut self, addr: PhysicalAddress) -> Result<(), MemoryError> {
        if !addr.is_aligned(arch::PAGE_SIZE) {
            return Err(MemoryError::Misaligned(addr));
        }

        let frame = addr.frame_number();
        if frame.as_usize() >= self.total_frames() {
            return Err(MemoryError::OutOfRange(addr));
        }

        self.bitmap.clear(frame);
        log::trace!("freed frame {}", addr);
        Ok(())
    }
}

impl FrameSource for FrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysicalAddress> {
        FrameAllocator::allocate_frame(self)
    }

    fn free_frame(&mut self, addr: PhysicalAddress) -> Result<(), MemoryError> {
        FrameAllocator::free_frame(self, addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, MultibootBuilder, XorShift, allocator};
    use crate::{PhysicalMemoryRegion, RegionKind};

    fn frame(n: usize) -> FrameNumber {
        FrameNumber::new(n)
    }

    mod init {
        use super::*;

        #[test]
        fn single_region_scenario() {
            testing::emulate(0x200_0000);
            let allocator = allocator(&[PhysicalMemoryRegion::usable(0x10_0000, 0x1F0_0000)], 0x5_0000);

            assert_eq!(allocator.total_frames(), 8192);
            assert!((0..0x100).all(|i| !allocator.is_available(frame(i))));
            assert!((0x100..0x2000).all(|i| allocator.is_available(frame(i))));
            assert_eq!(allocator.free_frames(), 0x2000 - 0x100);
            assert_eq!(allocator.reserved_frames(), 0x100);
        }

        #[test]
        fn bitmap_follows_kernel_image() {
            testing::emulate(0x200_0000);
            let allocator = allocator(&[PhysicalMemoryRegion::usable(0, 0x200_0000)], 0x5_0800);

            // 8192 frames need 1024 bytes of bitmap starting at 0x50800.
            assert_eq!(allocator.bitmap_end(), PhysicalAddress::new(0x5_0C00));
            assert!(!allocator.is_available(frame(0x50)));
            assert!(allocator.is_available(frame(0x51)));
        }

        #[test]
        fn bitmap_spanning_frames_is_reserved() {
            testing::emulate(0x800_0000);
            // 32768 frames need 4096 bytes of bitmap, which straddles frames 0x50 and 0x51.
            let allocator = allocator(&[PhysicalMemoryRegion::usable(0, 0x800_0000)], 0x5_0800);

            assert_eq!(allocator.bitmap_end(), PhysicalAddress::new(0x5_1800));
            assert!(!allocator.is_available(frame(0x51)));
            assert!(allocator.is_available(frame(0x52)));
        }

        #[test]
        fn partial_frames_at_region_edges_stay_unavailable() {
            testing::emulate(0x40_0000);
            let allocator = allocator(&[PhysicalMemoryRegion::usable(0x10_0800, 0x2000)], 0x1000);

            // Only frame 0x101 lies entirely inside [0x100800, 0x102800).
            assert!(!allocator.is_available(frame(0x100)));
            assert!(allocator.is_available(frame(0x101)));
            assert!(!allocator.is_available(frame(0x102)));
            assert_eq!(allocator.free_frames(), 1);
        }

        #[test]
        fn holes_between_regions_stay_unavailable() {
            testing::emulate(0x40_0000);
            let allocator = allocator(
                &[
                    PhysicalMemoryRegion::usable(0x10_0000, 0x10_0000),
                    PhysicalMemoryRegion::reserved(0x20_0000, 0x10_0000),
                    PhysicalMemoryRegion::usable(0x30_0000, 0x10_0000),
                ],
                0x1000,
            );

            assert_eq!(allocator.total_frames(), 0x400);
            assert!(allocator.is_available(frame(0x1FF)));
            assert!(!allocator.is_available(frame(0x200)));
            assert!(!allocator.is_available(frame(0x2FF)));
            assert!(allocator.is_available(frame(0x300)));
        }

        #[test]
        fn kernel_reservation_beats_usable_map() {
            testing::emulate(0x40_0000);
            let allocator = allocator(&[PhysicalMemoryRegion::usable(0, 0x40_0000)], 0x12_3456);

            assert!((0..=0x123).all(|i| !allocator.is_available(frame(i))));
        }

        #[test]
        fn reserves_modules() {
            testing::emulate(0x40_0000);
            let map = MemoryMap::from_boot_map([PhysicalMemoryRegion::usable(0x10_0000, 0x30_0000)]);
            let module = BootModule::new(PhysicalAddress::new(0x20_0800), PhysicalAddress::new(0x20_2001));
            let allocator = unsafe {
                FrameAllocator::from_memory_map(
                    &map,
                    KernelImage::new(PhysicalAddress::new(0x1000)),
                    [module],
                )
            }
            .unwrap();

            assert!(allocator.is_available(frame(0x1FF)));
            assert!((0x200..=0x202).all(|i| !allocator.is_available(frame(i))));
            assert!(allocator.is_available(frame(0x203)));
        }

        #[test]
        fn rejects_empty_memory() {
            testing::emulate(0x1000);
            let map = MemoryMap::from_boot_map([PhysicalMemoryRegion::reserved(0, 0x10_0000)]);
            let result = unsafe {
                FrameAllocator::from_memory_map(
                    &map,
                    KernelImage::new(PhysicalAddress::new(0)),
                    None::<BootModule>,
                )
            };
            assert_eq!(result.err(), Some(MemoryError::NoUsableMemory));
        }

        #[test]
        fn init_from_boot_info_with_map_and_modules() {
            testing::emulate(0x200_0000);
            let info = MultibootBuilder::new()
                .region(0, 0x9_F000, 1)
                .region(0x10_0000, 0x1F0_0000, 1)
                .region(0xFFFC_0000, 0x4_0000, 2)
                .module(0x30_0000, 0x30_1000, Some("initrd"))
                .build();

            let allocator =
                unsafe { FrameAllocator::init(&info, KernelImage::new(PhysicalAddress::new(0x5_0000))) }
                    .unwrap();

            assert_eq!(allocator.total_frames(), 0x2000);
            assert!(!allocator.is_available(frame(0x10)));
            assert!(!allocator.is_available(frame(0x9F)));
            assert!(!allocator.is_available(frame(0x300)));
            assert!(allocator.is_available(frame(0x301)));
        }

        #[test]
        fn init_falls_back_to_mem_upper() {
            testing::emulate(0x200_0000);
            let info = MultibootBuilder::new().mem_upper_kb(15 * 1024).build();

            let allocator =
                unsafe { FrameAllocator::init(&info, KernelImage::new(PhysicalAddress::new(0x5_0000))) }
                    .unwrap();

            assert_eq!(allocator.total_frames(), 0x1000);
            assert!(!allocator.is_available(frame(0xFF)));
            assert!(allocator.is_available(frame(0x100)));
            assert_eq!(allocator.free_frames(), 0xF00);
        }

        #[test]
        fn logs_frame_counts() {
            testing::emulate(0x200_0000);
            testing::capture_logs();
            allocator(&[PhysicalMemoryRegion::usable(0x10_0000, 0x1F0_0000)], 0x5_0000);

            let lines = testing::take_logs();
            assert!(
                lines
                    .iter()
                    .any(|l| l.contains("8192 frames") && l.contains("7936 free") && l.contains("256 reserved")),
                "{lines:?}"
            );
        }

        #[test]
        fn bitmap_covers_random_maps() {
            testing::emulate(0x100_0000);
            let mut rng = XorShift::new(0x5EED);
            for _ in 0..32 {
                let mut regions = Vec::new();
                let mut cursor = 0x10_0000u64;
                for _ in 0..rng.below(6) + 1 {
                    cursor += rng.below(0x4_0000);
                    let length = rng.below(0x20_0000) + 1;
                    let kind = if rng.below(3) == 0 {
                        RegionKind::Reserved
                    } else {
                        RegionKind::Usable
                    };
                    regions.push(PhysicalMemoryRegion { base: cursor, length, kind });
                    cursor += length;
                }
                if !regions.iter().any(|r| r.kind == RegionKind::Usable) {
                    continue;
                }

                let kernel_end = 0x8_0000 + rng.below(0x8_0000) as usize;
                let allocator = allocator(&regions, kernel_end);
                let bitmap_end = allocator.bitmap_end().as_u64();

                for i in 0..allocator.total_frames() {
                    let start = (i * arch::PAGE_SIZE) as u64;
                    let end = start + arch::PAGE_SIZE as u64;
                    let inside_usable = regions
                        .iter()
                        .any(|r| r.kind == RegionKind::Usable && r.base <= start && end <= r.end());
                    let reserved = start < bitmap_end;
                    assert_eq!(
                        allocator.is_available(frame(i)),
                        inside_usable && !reserved,
                        "frame {i:#x} in {regions:?}"
                    );
                }
            }
        }
    }

    mod allocation {
        use super::*;

        fn small() -> FrameAllocator {
            testing::emulate(0x20_0000);
            // Frames 0x100..0x108 are free.
            allocator(&[PhysicalMemoryRegion::usable(0x10_0000, 0x8000)], 0x1000)
        }

        #[test]
        fn allocates_lowest_first() {
            let mut allocator = small();
            assert_eq!(allocator.allocate_frame(), Some(PhysicalAddress::new(0x10_0000)));
            assert_eq!(allocator.allocate_frame(), Some(PhysicalAddress::new(0x10_1000)));
            assert!(!allocator.is_available(frame(0x100)));
        }

        #[test]
        fn never_hands_out_a_frame_twice() {
            let mut allocator = small();
            let mut seen = Vec::new();
            while let Some(addr) = allocator.allocate_frame() {
                assert!(addr.is_aligned(arch::PAGE_SIZE));
                assert!(!seen.contains(&addr));
                seen.push(addr);
            }
            assert_eq!(seen.len(), 8);
            assert_eq!(allocator.free_frames(), 0);
            assert_eq!(allocator.allocate_frame(), None);
        }

        #[test]
        fn free_then_allocate_returns_same_frame() {
            let mut allocator = small();
            let first = allocator.allocate_frame().unwrap();
            let _second = allocator.allocate_frame().unwrap();

            allocator.free_frame(first).unwrap();
            assert!(allocator.is_available(first.frame_number()));
            assert_eq!(allocator.allocate_frame(), Some(first));
        }

        #[test]
        fn free_restores_count() {
            let mut allocator = small();
            let before = allocator.free_frames();
            let addr = allocator.allocate_frame().unwrap();
            assert_eq!(allocator.free_frames(), before - 1);
            allocator.free_frame(addr).unwrap();
            assert_eq!(allocator.free_frames(), before);
        }

        #[test]
        fn misaligned_free_changes_nothing() {
            let mut allocator = small();
            let addr = allocator.allocate_frame().unwrap();
            let before = allocator.free_frames();

            assert_eq!(
                allocator.free_frame(addr + 0x10),
                Err(MemoryError::Misaligned(addr + 0x10))
            );
            assert_eq!(allocator.free_frames(), before);
            assert!(!allocator.is_available(addr.frame_number()));
        }

        #[test]
        fn out_of_range_free_changes_nothing() {
            let mut allocator = small();
            let before = allocator.free_frames();
            let addr = PhysicalAddress::new(0x1000_0000);

            assert_eq!(allocator.free_frame(addr), Err(MemoryError::OutOfRange(addr)));
            assert_eq!(allocator.free_frames(), before);
        }

        #[test]
        fn double_free_is_harmless() {
            let mut allocator = small();
            let addr = allocator.allocate_frame().unwrap();
            allocator.free_frame(addr).unwrap();
            let before = allocator.free_frames();

            assert_eq!(allocator.free_frame(addr), Ok(()));
            assert_eq!(allocator.free_frames(), before);
        }

        #[test]
        fn reserve_range_marks_partial_frames() {
            let mut allocator = small();
            allocator.reserve_range(PhysicalAddress::new(0x10_0FF8), 0x10);
            assert!(!allocator.is_available(frame(0x100)));
            assert!(!allocator.is_available(frame(0x101)));
            assert!(allocator.is_available(frame(0x102)));
        }

        #[test]
        fn works_through_frame_source() {
            fn take<F: FrameSource>(source: &mut F) -> Option<PhysicalAddress> {
                source.allocate_frame()
            }

            let mut allocator = small();
            assert_eq!(take(&mut allocator), Some(PhysicalAddress::new(0x10_0000)));
        }
    }
}
