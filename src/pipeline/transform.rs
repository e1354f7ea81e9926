//! Mirroring of packed RGB24 frames

use bytes::{Bytes, BytesMut};

use crate::capture::frame::BYTES_PER_PIXEL;

/// Mirror a `width x height` RGB24 frame horizontally and/or vertically.
///
/// With neither flag set the input is handed back as-is. Otherwise every
/// destination pixel `(x, y)` is taken from
/// `(flip_x ? width-1-x : x, flip_y ? height-1-y : y)`; both flags together
/// amount to a 180 degree rotation. The output always has the input's length.
pub fn transform(frame: Bytes, width: u32, height: u32, flip_x: bool, flip_y: bool) -> Bytes {
    if !flip_x && !flip_y {
        return frame;
    }

    let width = width as usize;
    let height = height as usize;
    let row_bytes = width * BYTES_PER_PIXEL;
    debug_assert_eq!(frame.len(), row_bytes * height);

    let mut out = BytesMut::zeroed(frame.len());
    for y in 0..height {
        let src_y = if flip_y { height - 1 - y } else { y };
        for x in 0..width {
            let src_x = if flip_x { width - 1 - x } else { x };
            let src = src_y * row_bytes + src_x * BYTES_PER_PIXEL;
            let dst = y * row_bytes + x * BYTES_PER_PIXEL;
            out[dst..dst + BYTES_PER_PIXEL].copy_from_slice(&frame[src..src + BYTES_PER_PIXEL]);
        }
    }

    out.freeze()
}
