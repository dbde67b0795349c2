//! Helpers shared by the unit tests.

use core::cell::{Cell, RefCell};
use core::mem::size_of;

use crate::boot_info::{
    FLAG_FRAMEBUFFER, FLAG_MEMORY, FLAG_MEMORY_MAP, FLAG_MODULES, RawBootInfo, RawMemoryMapEntry,
    RawModule,
};
use crate::{
    AddressTranslator, BootInfo, BootModule, FrameAllocator, FramebufferInfo, KernelImage,
    MemoryMap, PhysicalAddress, PhysicalMemoryRegion,
};

/// Installs `size` bytes of zeroed emulated physical memory for the current test thread.
pub fn emulate(size: usize) {
    AddressTranslator::set_current(AddressTranslator::emulated(size));
}

/// Writes `value` to emulated physical memory.
pub fn write<T: Copy>(addr: PhysicalAddress, value: T) {
    unsafe { addr.identity_view::<T>().write_unaligned(value) }
}

/// Reads a `T` from emulated physical memory.
pub fn read<T: Copy>(addr: PhysicalAddress) -> T {
    unsafe { addr.identity_view::<T>().read_unaligned() }
}

/// Returns the physical address behind a pointer into emulated memory.
pub fn phys_of(ptr: *const u8) -> usize {
    let base = AddressTranslator::current().phys_to_ptr::<u8>(0);
    ptr as usize - base as usize
}

/// Builds a frame allocator over `regions` with the kernel image ending at `kernel_end`.
pub fn allocator(regions: &[PhysicalMemoryRegion], kernel_end: usize) -> FrameAllocator {
    let map = MemoryMap::from_boot_map(regions.iter().copied());
    unsafe {
        FrameAllocator::from_memory_map(
            &map,
            KernelImage::new(PhysicalAddress::new(kernel_end)),
            None::<BootModule>,
        )
    }
    .expect("allocator should initialize")
}

/// Builds a Multiboot information structure in emulated memory.
///
/// The structure lives at 0x8000, the memory map at 0x8400, the module list at 0x8800 and
/// module names from 0x8C00, so emulated memory must be at least 36 KiB.
pub struct MultibootBuilder {
    mem_upper_kb: u32,
    regions: Vec<(u64, u64, u32)>,
    entry_padding: u32,
    truncate: usize,
    modules: Vec<(u32, u32, Option<String>)>,
    framebuffer: Option<FramebufferInfo>,
}

impl MultibootBuilder {
    const INFO: usize = 0x8000;
    const MEMORY_MAP: usize = 0x8400;
    const MODULES: usize = 0x8800;
    const NAMES: usize = 0x8C00;

    pub fn new() -> Self {
        Self {
            mem_upper_kb: 31 * 1024,
            regions: Vec::new(),
            entry_padding: 0,
            truncate: 0,
            modules: Vec::new(),
            framebuffer: None,
        }
    }

    pub fn mem_upper_kb(mut self, kb: u32) -> Self {
        self.mem_upper_kb = kb;
        self
    }

    pub fn region(mut self, base: u64, length: u64, kind: u32) -> Self {
        self.regions.push((base, length, kind));
        self
    }

    /// Pads every memory map entry with `bytes` extra bytes covered by its `size` field.
    pub fn entry_padding(mut self, bytes: u32) -> Self {
        self.entry_padding = bytes;
        self
    }

    /// Shortens the reported memory map length by `bytes`.
    pub fn truncate_map_by(mut self, bytes: usize) -> Self {
        self.truncate = bytes;
        self
    }

    pub fn module(mut self, start: u32, end: u32, name: Option<&str>) -> Self {
        self.modules.push((start, end, name.map(String::from)));
        self
    }

    pub fn framebuffer(mut self, info: FramebufferInfo) -> Self {
        self.framebuffer = Some(info);
        self
    }

    pub fn build(self) -> BootInfo {
        let mut raw = RawBootInfo {
            flags: FLAG_MEMORY,
            mem_lower: 639,
            mem_upper: self.mem_upper_kb,
            ..RawBootInfo::default()
        };

        if !self.regions.is_empty() {
            let stride = size_of::<RawMemoryMapEntry>() + self.entry_padding as usize;
            for (i, &(base, length, kind)) in self.regions.iter().enumerate() {
                let entry = RawMemoryMapEntry {
                    size: size_of::<RawMemoryMapEntry>() as u32 - 4 + self.entry_padding,
                    base,
                    length,
                    kind,
                };
                write(PhysicalAddress::new(Self::MEMORY_MAP + i * stride), entry);
            }
            raw.flags |= FLAG_MEMORY_MAP;
            raw.mmap_addr = Self::MEMORY_MAP as u32;
            raw.mmap_length = (self.regions.len() * stride - self.truncate) as u32;
        }

        if !self.modules.is_empty() {
            let mut name_cursor = Self::NAMES;
            for (i, (start, end, name)) in self.modules.iter().enumerate() {
                let name_addr = match name {
                    Some(name) => {
                        let addr = name_cursor;
                        for (offset, byte) in name.bytes().chain([0]).enumerate() {
                            write(PhysicalAddress::new(addr + offset), byte);
                        }
                        name_cursor += name.len() + 1;
                        addr as u32
                    }
                    None => 0,
                };
                let module = RawModule {
                    start: *start,
                    end: *end,
                    name: name_addr,
                    _reserved: 0,
                };
                write(
                    PhysicalAddress::new(Self::MODULES + i * size_of::<RawModule>()),
                    module,
                );
            }
            raw.flags |= FLAG_MODULES;
            raw.mods_addr = Self::MODULES as u32;
            raw.mods_count = self.modules.len() as u32;
        }

        if let Some(fb) = self.framebuffer {
            raw.flags |= FLAG_FRAMEBUFFER;
            raw.framebuffer_addr = fb.address;
            raw.framebuffer_pitch = fb.pitch;
            raw.framebuffer_width = fb.width;
            raw.framebuffer_height = fb.height;
            raw.framebuffer_bpp = fb.bpp;
            raw.framebuffer_type = fb.kind.into();
        }

        write(PhysicalAddress::new(Self::INFO), raw);
        unsafe { BootInfo::parse(PhysicalAddress::new(Self::INFO)) }
    }
}

std::thread_local! {
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
    static LINES: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

struct CaptureLogger;

impl log::Log for CaptureLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        CAPTURING.with(Cell::get)
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            LINES.with(|lines| {
                lines
                    .borrow_mut()
                    .push(format!("{} {}", record.level(), record.args()))
            });
        }
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;
static INSTALL_LOGGER: std::sync::Once = std::sync::Once::new();

/// Starts recording log lines emitted on the current thread.
pub fn capture_logs() {
    INSTALL_LOGGER.call_once(|| {
        log::set_logger(&LOGGER).expect("no other logger in unit tests");
        log::set_max_level(log::LevelFilter::Trace);
    });
    CAPTURING.with(|capturing| capturing.set(true));
    LINES.with(|lines| lines.borrow_mut().clear());
}

/// Returns every line recorded on the current thread since the last call.
pub fn take_logs() -> Vec<String> {
    LINES.with(|lines| core::mem::take(&mut *lines.borrow_mut()))
}

/// A small deterministic generator for randomized tests.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Returns a value in `[0, bound)`.
    pub fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}
