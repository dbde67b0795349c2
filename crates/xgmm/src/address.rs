//! Physical and virtual addresses, and the identity view.
//!
//! Physical memory is never dereferenced directly. The [`AddressTranslator`] installed at
//! boot decides where physical address `n` is visible: at `n + offset` on hardware, or inside
//! an emulated buffer when running on the host.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, arch};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Where physical memory is visible to the kernel.
pub enum AddressTranslator {
    /// Physical address `n` is mapped at virtual address `n + offset`.
    DirectMap { offset: usize },
    /// Physical memory is a host buffer.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

#[cfg(not(any(test, feature = "software-emulation")))]
static TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

// One per test thread, so every test owns its physical memory.
#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static TRANSLATOR: spin::Once<AddressTranslator> = const { spin::Once::new() };
}

/// Runs `f` on the translator slot of the current context.
fn with_slot<R>(f: impl FnOnce(&spin::Once<AddressTranslator>) -> R) -> R {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        f(&TRANSLATOR)
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        TRANSLATOR.with(f)
    }
}

impl AddressTranslator {
    /// The boot identity map: physical address `n` is visible at `n`.
    pub const fn identity() -> Self {
        Self::direct_map(0)
    }

    /// All of physical memory mapped at `offset`.
    pub const fn direct_map(offset: usize) -> Self {
        Self::DirectMap { offset }
    }

    /// `size` bytes of zeroed emulated physical memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Installs `translator` as the identity view. Must happen once, before any allocator or
    /// paging call.
    ///
    /// # Panics
    ///
    /// Panics if a translator is already installed.
    pub fn set_current(translator: AddressTranslator) {
        with_slot(|slot| {
            assert!(slot.get().is_none(), "address translator already set");
            slot.call_once(|| translator);
        });
    }

    /// Returns the installed identity view.
    ///
    /// # Panics
    ///
    /// Panics if [`set_current`](Self::set_current) has not run.
    pub fn current() -> &'static AddressTranslator {
        let translator = with_slot(|slot| slot.get().map(|t| t as *const AddressTranslator));
        let Some(translator) = translator else {
            panic!("address translator not set; install one with AddressTranslator::set_current");
        };
        // SAFETY: A slot is written once and never cleared. The static lives forever, and the
        // thread-local one lives as long as the only thread that can observe it.
        unsafe { &*translator }
    }

    /// Returns a pointer through which physical address `phys` can be accessed.
    pub fn phys_to_ptr<T>(&self, phys: usize) -> *mut T {
        match self {
            Self::DirectMap { offset } => phys.wrapping_add(*offset) as *mut T,
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(memory) => memory.translate(phys).cast(),
        }
    }

    /// Like [`phys_to_ptr`](Self::phys_to_ptr) for the whole range `[phys, phys + len)`.
    /// Emulated memory checks that every byte of the range exists.
    pub fn phys_range_to_ptr(&self, phys: usize, len: usize) -> *mut u8 {
        match self {
            Self::DirectMap { .. } => {
                debug_assert!(phys.checked_add(len).is_some(), "physical range wraps");
                self.phys_to_ptr(phys)
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(memory) => memory.translate_range(phys, len),
        }
    }
}

macro_rules! address_type {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0 as u64
            }

            /// Returns true if the address is a multiple of `align`, a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                self.0 == align_down(self.0, align)
            }

            /// Rounds down to a multiple of `align`, a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                Self(align_down(self.0, align))
            }

            /// Rounds up to a multiple of `align`, a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                Self::new(align_down(self.0 + (align - 1), align))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name))
                    .field(&format_args!("{:#x}", self.0))
                    .finish()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            fn add(self, offset: usize) -> Self {
                Self::new(self.0 + offset)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            fn sub(self, offset: usize) -> Self {
                Self::new(self.0 - offset)
            }
        }

        impl Sub for $name {
            type Output = usize;

            /// Distance in bytes from `other` up to `self`.
            fn sub(self, other: Self) -> usize {
                self.0 - other.0
            }
        }
    };
}

/// Clears the low bits of `value` below `align`.
const fn align_down(value: usize, align: usize) -> usize {
    assert!(align.is_power_of_two(), "alignment must be a power of two");
    value & !(align - 1)
}

address_type! {
    /// An address in physical memory, below 2^52.
    ///
    /// Only the allocator and paging code turn one into a pointer, through the identity view.
    PhysicalAddress
}

address_type! {
    /// A canonical virtual address: bits 48-63 repeat bit 47.
    VirtualAddress
}

impl PhysicalAddress {
    /// # Panics
    ///
    /// Panics if `addr` does not fit the 52-bit physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        match Self::try_new(addr) {
            Some(addr) => addr,
            None => panic!("physical address exceeds maximum width"),
        }
    }

    #[inline]
    pub const fn try_new(addr: usize) -> Option<Self> {
        if arch::validate_physical(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Returns the frame containing this address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::containing(self)
    }

    /// Returns a pointer to this address through the identity view.
    pub(crate) fn identity_view<T>(self) -> *mut T {
        AddressTranslator::current().phys_to_ptr(self.0)
    }

    /// Borrows the `len` bytes starting here through the identity view.
    ///
    /// # Safety
    ///
    /// The range must be memory the caller owns, with no other live reference to any of it
    /// for `'a`.
    pub(crate) unsafe fn identity_slice_mut<'a>(self, len: usize) -> &'a mut [u8] {
        let ptr = AddressTranslator::current().phys_range_to_ptr(self.0, len);
        // SAFETY: The caller guarantees exclusive ownership of the range.
        unsafe { core::slice::from_raw_parts_mut(ptr, len) }
    }
}

impl VirtualAddress {
    /// # Panics
    ///
    /// Panics if `addr` is not canonical.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        match Self::try_new(addr) {
            Some(addr) => addr,
            None => panic!("address is not canonical"),
        }
    }

    #[inline]
    pub const fn try_new(addr: usize) -> Option<Self> {
        if arch::validate_virtual(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// The virtual address an identity mapping gives `phys`, if that address is canonical.
    #[inline]
    pub const fn identity(phys: PhysicalAddress) -> Option<Self> {
        Self::try_new(phys.as_usize())
    }

    /// Byte offset inside the 4 KiB page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 % arch::PAGE_SIZE
    }

    /// Index into the table at `level`, where 0 is the PT and 3 the PML4.
    #[inline]
    pub const fn page_index(self, level: usize) -> usize {
        arch::page_index(self.0, level)
    }
}
