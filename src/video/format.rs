//! Pixel format, encoder color format and resolution definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use v4l::format::fourcc;

/// Camera preview pixel formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// NV21 semi-planar (Y plane + interleaved VU), the usual camera preview format
    Nv21,
    /// NV12 semi-planar (Y plane + interleaved UV)
    Nv12,
    /// YUV420 planar (I420)
    Yuv420,
    /// YUYV 4:2:2 packed
    Yuyv,
    /// MJPEG compressed
    Mjpeg,
}

impl PixelFormat {
    /// Convert to V4L2 FourCC
    pub fn to_fourcc(&self) -> fourcc::FourCC {
        match self {
            PixelFormat::Nv21 => fourcc::FourCC::new(b"NV21"),
            PixelFormat::Nv12 => fourcc::FourCC::new(b"NV12"),
            PixelFormat::Yuv420 => fourcc::FourCC::new(b"YU12"),
            PixelFormat::Yuyv => fourcc::FourCC::new(b"YUYV"),
            PixelFormat::Mjpeg => fourcc::FourCC::new(b"MJPG"),
        }
    }

    /// Try to convert from V4L2 FourCC
    pub fn from_fourcc(fourcc: fourcc::FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"NV21" => Some(PixelFormat::Nv21),
            b"NV12" => Some(PixelFormat::Nv12),
            b"YU12" | b"I420" => Some(PixelFormat::Yuv420),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            _ => None,
        }
    }

    /// Preference when a device offers several preview formats (higher is better)
    pub fn preview_priority(&self) -> u8 {
        match self {
            PixelFormat::Nv21 => 100,
            PixelFormat::Nv12 => 90,
            PixelFormat::Yuv420 => 80,
            PixelFormat::Yuyv => 70,
            PixelFormat::Mjpeg => 10,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Nv21 => "NV21",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuv420 => "YUV420",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Mjpeg => "MJPEG",
        };
        write!(f, "{}", name)
    }
}

/// Color formats advertised by hardware encoders
///
/// The numeric values are the vendor-neutral codec capability constants; any
/// value not listed here is carried through as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorFormat {
    Yuv420Planar,
    Yuv420PackedPlanar,
    Yuv420SemiPlanar,
    Yuv420PackedSemiPlanar,
    /// TI-specific packed semi-planar layout
    TiYuv420PackedSemiPlanar,
    /// Opaque surface input (zero-copy feeding)
    Surface,
    Other(u32),
}

impl ColorFormat {
    pub const YUV420_PLANAR: u32 = 19;
    pub const YUV420_PACKED_PLANAR: u32 = 20;
    pub const YUV420_SEMI_PLANAR: u32 = 21;
    pub const YUV420_PACKED_SEMI_PLANAR: u32 = 39;
    pub const TI_YUV420_PACKED_SEMI_PLANAR: u32 = 0x7f00_0100;
    pub const SURFACE: u32 = 0x7f00_0789;

    pub fn from_raw(value: u32) -> Self {
        match value {
            Self::YUV420_PLANAR => ColorFormat::Yuv420Planar,
            Self::YUV420_PACKED_PLANAR => ColorFormat::Yuv420PackedPlanar,
            Self::YUV420_SEMI_PLANAR => ColorFormat::Yuv420SemiPlanar,
            Self::YUV420_PACKED_SEMI_PLANAR => ColorFormat::Yuv420PackedSemiPlanar,
            Self::TI_YUV420_PACKED_SEMI_PLANAR => ColorFormat::TiYuv420PackedSemiPlanar,
            Self::SURFACE => ColorFormat::Surface,
            other => ColorFormat::Other(other),
        }
    }

    pub fn raw(&self) -> u32 {
        match self {
            ColorFormat::Yuv420Planar => Self::YUV420_PLANAR,
            ColorFormat::Yuv420PackedPlanar => Self::YUV420_PACKED_PLANAR,
            ColorFormat::Yuv420SemiPlanar => Self::YUV420_SEMI_PLANAR,
            ColorFormat::Yuv420PackedSemiPlanar => Self::YUV420_PACKED_SEMI_PLANAR,
            ColorFormat::TiYuv420PackedSemiPlanar => Self::TI_YUV420_PACKED_SEMI_PLANAR,
            ColorFormat::Surface => Self::SURFACE,
            ColorFormat::Other(value) => *value,
        }
    }

    /// Whether the synthetic frame generator knows how to fill this layout
    pub fn is_recognized(&self) -> bool {
        matches!(
            self,
            ColorFormat::Yuv420Planar
                | ColorFormat::Yuv420PackedPlanar
                | ColorFormat::Yuv420SemiPlanar
                | ColorFormat::Yuv420PackedSemiPlanar
                | ColorFormat::TiYuv420PackedSemiPlanar
        )
    }

    /// Semi-planar layouts; `None` for formats the pipeline cannot feed
    pub fn is_semi_planar(&self) -> Option<bool> {
        match self {
            ColorFormat::Yuv420Planar | ColorFormat::Yuv420PackedPlanar => Some(false),
            ColorFormat::Yuv420SemiPlanar
            | ColorFormat::Yuv420PackedSemiPlanar
            | ColorFormat::TiYuv420PackedSemiPlanar => Some(true),
            ColorFormat::Surface | ColorFormat::Other(_) => None,
        }
    }
}

impl fmt::Display for ColorFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColorFormat::Yuv420Planar => write!(f, "YUV420Planar"),
            ColorFormat::Yuv420PackedPlanar => write!(f, "YUV420PackedPlanar"),
            ColorFormat::Yuv420SemiPlanar => write!(f, "YUV420SemiPlanar"),
            ColorFormat::Yuv420PackedSemiPlanar => write!(f, "YUV420PackedSemiPlanar"),
            ColorFormat::TiYuv420PackedSemiPlanar => write!(f, "TI_YUV420PackedSemiPlanar"),
            ColorFormat::Surface => write!(f, "Surface"),
            ColorFormat::Other(value) => write!(f, "0x{:x}", value),
        }
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Width over height, used to size the preview surface
    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            return 0.0;
        }
        self.width as f64 / self.height as f64
    }

    /// Byte size of one 4:2:0 frame at this resolution
    pub fn yuv420_frame_size(&self) -> usize {
        (self.width as usize * self.height as usize) * 3 / 2
    }

    pub const QCIF: Resolution = Resolution {
        width: 176,
        height: 144,
    };
    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_format_raw_values() {
        assert_eq!(ColorFormat::from_raw(21), ColorFormat::Yuv420SemiPlanar);
        assert_eq!(ColorFormat::from_raw(0x7f00_0100), ColorFormat::TiYuv420PackedSemiPlanar);
        assert_eq!(ColorFormat::from_raw(0x7f42_0888), ColorFormat::Other(0x7f42_0888));
        assert_eq!(ColorFormat::Surface.raw(), 0x7f00_0789);
    }

    #[test]
    fn test_color_format_families() {
        assert_eq!(ColorFormat::Yuv420Planar.is_semi_planar(), Some(false));
        assert_eq!(ColorFormat::Yuv420PackedPlanar.is_semi_planar(), Some(false));
        assert_eq!(ColorFormat::Yuv420PackedSemiPlanar.is_semi_planar(), Some(true));
        assert_eq!(ColorFormat::Surface.is_semi_planar(), None);
        assert!(!ColorFormat::Surface.is_recognized());
        assert!(!ColorFormat::Other(0x7f42_0888).is_recognized());
    }

    #[test]
    fn test_pixel_format_fourcc() {
        let fourcc = PixelFormat::Nv21.to_fourcc();
        assert_eq!(PixelFormat::from_fourcc(fourcc), Some(PixelFormat::Nv21));
        assert_eq!(
            PixelFormat::from_fourcc(fourcc::FourCC::new(b"I420")),
            Some(PixelFormat::Yuv420)
        );
    }

    #[test]
    fn test_resolution_helpers() {
        assert_eq!(Resolution::VGA.yuv420_frame_size(), 640 * 480 * 3 / 2);
        assert!((Resolution::HD720.aspect_ratio() - 16.0 / 9.0).abs() < 1e-9);
        assert_eq!(Resolution::new(0, 0).aspect_ratio(), 0.0);
    }
}
