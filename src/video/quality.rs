//! Requested stream quality

use serde::{Deserialize, Serialize};
use std::fmt;

use super::format::Resolution;
use crate::error::{AppError, Result};

/// Resolution, framerate and bitrate of an encoded stream
///
/// Two descriptors are equal iff every field matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualityDescriptor {
    pub width: u32,
    pub height: u32,
    /// Frames per second
    pub framerate: u32,
    /// Bits per second
    pub bitrate: u32,
}

impl QualityDescriptor {
    pub const fn new(width: u32, height: u32, framerate: u32, bitrate: u32) -> Self {
        Self {
            width,
            height,
            framerate,
            bitrate,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Reject descriptors no encoder could be configured with
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(AppError::Config(format!(
                "Invalid resolution {}x{}",
                self.width, self.height
            )));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(AppError::Config(format!(
                "Resolution {}x{} must be even for 4:2:0 input",
                self.width, self.height
            )));
        }
        if self.framerate == 0 {
            return Err(AppError::Config("Framerate must be positive".to_string()));
        }
        if self.bitrate == 0 {
            return Err(AppError::Config("Bitrate must be positive".to_string()));
        }
        Ok(())
    }

    /// Interval between frames in microseconds
    pub fn frame_interval_us(&self) -> u64 {
        1_000_000 / self.framerate.max(1) as u64
    }
}

impl Default for QualityDescriptor {
    fn default() -> Self {
        Self::new(176, 144, 20, 500_000)
    }
}

impl fmt::Display for QualityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@{}fps {}kbps",
            self.width,
            self.height,
            self.framerate,
            self.bitrate / 1000
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_covers_all_fields() {
        let a = QualityDescriptor::new(1280, 720, 30, 3_000_000);
        assert_eq!(a, QualityDescriptor::new(1280, 720, 30, 3_000_000));
        assert_ne!(a, QualityDescriptor::new(1280, 720, 30, 2_000_000));
        assert_ne!(a, QualityDescriptor::new(1280, 720, 25, 3_000_000));
        assert_ne!(a, QualityDescriptor::new(1280, 640, 30, 3_000_000));
    }

    #[test]
    fn test_validate() {
        assert!(QualityDescriptor::default().validate().is_ok());
        assert!(QualityDescriptor::new(0, 720, 30, 1).validate().is_err());
        assert!(QualityDescriptor::new(1281, 720, 30, 1).validate().is_err());
        assert!(QualityDescriptor::new(1280, 720, 0, 1).validate().is_err());
        assert!(QualityDescriptor::new(1280, 720, 30, 0).validate().is_err());
    }

    #[test]
    fn test_frame_interval() {
        assert_eq!(QualityDescriptor::new(640, 480, 30, 1).frame_interval_us(), 33_333);
        assert_eq!(QualityDescriptor::new(640, 480, 20, 1).frame_interval_us(), 50_000);
    }

    #[test]
    fn test_display() {
        let q = QualityDescriptor::new(1280, 720, 30, 3_000_000);
        assert_eq!(q.to_string(), "1280x720@30fps 3000kbps");
    }
}
