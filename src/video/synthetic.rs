//! Synthetic test frames fed to the encoder while probing
//!
//! Each frame is black except for one bar a quarter of the width wide and half
//! the height tall. The bar walks across the top half over phases 0..4 and back
//! along the bottom half over phases 4..8, so consecutive frames always differ
//! and the encoder has real motion to compress.

use super::format::ColorFormat;
use crate::error::{AppError, Result};

const TEST_Y: u8 = 120;
const TEST_U: u8 = 160;
const TEST_V: u8 = 200;

/// Offset added to every synthetic presentation timestamp (µs)
pub const PTS_BASE_OFFSET_US: u64 = 132;

/// Number of distinct frames before the pattern repeats
pub const PHASES: u64 = 8;

/// Presentation timestamp in µs of the `frame_index`-th synthetic frame
pub fn presentation_time_us(frame_index: u64, framerate: u32) -> u64 {
    PTS_BASE_OFFSET_US + frame_index * 1_000_000 / framerate.max(1) as u64
}

/// Fill `frame` with synthetic 4:2:0 frame `frame_index`
///
/// The output depends only on `(frame_index % 8, width, height, color_format)`.
/// `frame` must hold at least `width * height * 3 / 2` bytes; the first
/// `width * height * 3 / 2` bytes are overwritten.
pub fn generate_frame(
    frame_index: u64,
    color_format: ColorFormat,
    frame: &mut [u8],
    width: u32,
    height: u32,
) -> Result<()> {
    let semi_planar = color_format.is_semi_planar().ok_or_else(|| {
        AppError::UnsupportedConfiguration(format!(
            "Cannot synthesize frames for color format {}",
            color_format
        ))
    })?;

    let w = width as usize;
    let h = height as usize;
    let frame_size = w * h * 3 / 2;
    if frame.len() < frame_size {
        return Err(AppError::Codec(format!(
            "Frame buffer too small: {} < {} bytes",
            frame.len(),
            frame_size
        )));
    }

    let frame = &mut frame[..frame_size];
    frame.fill(0);

    let phase = (frame_index % PHASES) as usize;
    let (start_x, start_y) = if phase < 4 {
        (phase * (w / 4), 0)
    } else {
        ((7 - phase) * (w / 4), h / 2)
    };

    let luma_size = w * h;
    let half_width = w / 2;
    let chroma_plane = half_width * (h / 2);

    for y in start_y..start_y + h / 2 {
        for x in start_x..start_x + w / 4 {
            frame[y * w + x] = TEST_Y;
            if x % 2 != 0 || y % 2 != 0 {
                continue;
            }
            if semi_planar {
                // Interleaved UV pairs at half resolution
                let uv = luma_size + (y / 2) * w + x;
                frame[uv] = TEST_U;
                frame[uv + 1] = TEST_V;
            } else {
                // Quarter-size U plane followed by quarter-size V plane
                let offset = (y / 2) * half_width + x / 2;
                frame[luma_size + offset] = TEST_U;
                frame[luma_size + chroma_plane + offset] = TEST_V;
            }
        }
    }

    Ok(())
}
