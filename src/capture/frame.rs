use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::overlay::buffer::HEADER_SIZE;

/// Bytes per RGB24 pixel
pub const BYTES_PER_PIXEL: usize = 3;

/// Pixel dimensions of the target matrix, fixed for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    /// Returns `None` unless both dimensions are positive and a whole
    /// overlay object (header plus one frame) is addressable.
    pub fn new(width: i64, height: i64) -> Option<Self> {
        if width <= 0 || height <= 0 {
            return None;
        }
        let width = u32::try_from(width).ok()?;
        let height = u32::try_from(height).ok()?;

        (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(BYTES_PER_PIXEL)?
            .checked_add(HEADER_SIZE)?;
        Some(Self { width, height })
    }

    /// Size of one packed RGB24 frame, row-major, no padding.
    ///
    /// Cannot overflow; `new` rejects geometries whose size does not fit.
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One complete RGB24 image.
///
/// Frames are cut out of the producer stream without copying; `data` is
/// always exactly `geometry.frame_size()` bytes long.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Bytes,
    pub sequence: u64,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("len", &self.data.len())
            .finish()
    }
}
