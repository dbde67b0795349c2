//! Frame number types for physical memory management.
//!
//! A [`FrameNumber`] is the index of a 4 KiB physical frame, which is also its bit position
//! in the frame bitmap. A [`FrameRange`] is a half-open run of frames.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{PhysicalAddress, arch};

/// Index of a 4 KiB physical frame; frame `n` starts at `n * 4096`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameNumber(usize);

impl FrameNumber {
    /// Creates a new frame number.
    #[inline]
    pub const fn new(number: usize) -> Self {
        Self(number)
    }

    /// Returns the frame containing `addr`.
    #[inline]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self(addr.as_usize() / arch::PAGE_SIZE)
    }

    /// Returns the raw frame number.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// First byte of the frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * arch::PAGE_SIZE)
    }

    /// First byte past the frame.
    #[inline]
    pub const fn end(self) -> PhysicalAddress {
        Self(self.0 + 1).start()
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameNumber({})", self.0)
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        Self::containing(addr)
    }
}

impl Add<usize> for FrameNumber {
    type Output = Self;

    #[inline]
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<FrameNumber> for FrameNumber {
    type Output = usize;

    #[inline]
    fn sub(self, rhs: FrameNumber) -> Self::Output {
        self.0 - rhs.0
    }
}

/// A half-open range of frames, `[start, end)`.
///
/// Iterating yields every frame in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRange {
    start: FrameNumber,
    end: FrameNumber,
}

impl FrameRange {
    /// Creates a range from its first frame and the frame just past its end.
    ///
    /// An `end` below `start` produces an empty range.
    pub const fn new(start: FrameNumber, end: FrameNumber) -> Self {
        if end.0 < start.0 {
            Self { start, end: start }
        } else {
            Self { start, end }
        }
    }

    /// Returns every frame touched by the bytes `[start, end)`, including partially
    /// covered frames at either edge.
    pub const fn covering(start: u64, end: u64) -> Self {
        let page = arch::PAGE_SIZE as u64;
        let first = start / page;
        let last = end.div_ceil(page);
        Self::new(FrameNumber(first as usize), FrameNumber(last as usize))
    }

    /// Returns only the frames lying entirely inside the bytes `[start, end)`.
    pub const fn within(start: u64, end: u64) -> Self {
        let page = arch::PAGE_SIZE as u64;
        let first = start.div_ceil(page);
        let last = end / page;
        Self::new(FrameNumber(first as usize), FrameNumber(last as usize))
    }

    /// Returns the first frame of the range.
    pub const fn start(&self) -> FrameNumber {
        self.start
    }

    /// Returns the frame just past the end of the range.
    pub const fn end(&self) -> FrameNumber {
        self.end
    }

    /// Returns the number of frames in the range.
    pub const fn len(&self) -> usize {
        self.end.0 - self.start.0
    }

    /// Returns true if the range holds no frames.
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `frame` lies in the range.
    pub const fn contains(&self, frame: FrameNumber) -> bool {
        frame.0 >= self.start.0 && frame.0 < self.end.0
    }

    /// Clips the range to frames below `limit`.
    pub const fn clamp_to(self, limit: usize) -> Self {
        let end = if self.end.0 > limit { limit } else { self.end.0 };
        Self::new(self.start, FrameNumber(end))
    }
}

impl Iterator for FrameRange {
    type Item = FrameNumber;

    fn next(&mut self) -> Option<Self::Item> {
        if self.start.0 < self.end.0 {
            let frame = self.start;
            self.start.0 += 1;
            Some(frame)
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.len();
        (len, Some(len))
    }
}

impl ExactSizeIterator for FrameRange {}
