//! One bit per physical frame.

use crate::{FrameNumber, FrameRange};

/// Tracks the availability of every physical frame with a single bit.
///
/// A set bit means the frame is unavailable (reserved, allocated, or outside usable
/// memory); a clear bit means it is free. Bits past the last frame stay set so they are
/// never reported as free.
pub struct FrameBitmap<'a> {
    bits: &'a mut [u8],
    frames: usize,
}

impl<'a> FrameBitmap<'a> {
    /// Returns the number of bytes needed to track `frames` frames.
    pub const fn bytes_for(frames: usize) -> usize {
        frames.div_ceil(8)
    }

    /// Creates a bitmap over `frames` frames in `storage`, marking every frame unavailable.
    ///
    /// # Panics
    ///
    /// Panics if `storage` is shorter than [`bytes_for(frames)`](Self::bytes_for).
    pub fn new(storage: &'a mut [u8], frames: usize) -> Self {
        let len = Self::bytes_for(frames);
        assert!(storage.len() >= len, "bitmap storage too small");

        let bits = &mut storage[..len];
        bits.fill(0xFF);
        Self { bits, frames }
    }

    /// Returns the number of frames tracked.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Returns the number of bytes of backing storage in use.
    pub fn storage_len(&self) -> usize {
        self.bits.len()
    }

    /// Returns true if `frame` is unavailable. Untracked frames are always unavailable.
    pub fn is_set(&self, frame: FrameNumber) -> bool {
        let index = frame.as_usize();
        if index >= self.frames {
            return true;
        }
        self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    /// Marks `frame` unavailable. Untracked frames are ignored.
    pub fn set(&mut self, frame: FrameNumber) {
        let index = frame.as_usize();
        if index < self.frames {
            self.bits[index / 8] |= 1 << (index % 8);
        }
    }

    /// Marks `frame` free. Untracked frames are ignored.
    pub fn clear(&mut self, frame: FrameNumber) {
        let index = frame.as_usize();
        if index < self.frames {
            self.bits[index / 8] &= !(1 << (index % 8));
        }
    }

    /// Marks every tracked frame of `range` unavailable.
    pub fn set_range(&mut self, range: FrameRange) {
        for frame in range.clamp_to(self.frames) {
            self.set(frame);
        }
    }

    /// Marks every tracked frame of `range` free.
    pub fn clear_range(&mut self, range: FrameRange) {
        for frame in range.clamp_to(self.frames) {
            self.clear(frame);
        }
    }

    /// Returns the lowest free frame.
    pub fn first_clear(&self) -> Option<FrameNumber> {
        let (byte_index, byte) = self
            .bits
            .iter()
            .enumerate()
            .find(|&(_, &byte)| byte != 0xFF)?;

        let index = byte_index * 8 + (!*byte).trailing_zeros() as usize;
        (index < self.frames).then(|| FrameNumber::new(index))
    }

    /// Returns the number of free frames.
    pub fn count_clear(&self) -> usize {
        self.bits.iter().map(|byte| byte.count_zeros() as usize).sum()
    }
}
