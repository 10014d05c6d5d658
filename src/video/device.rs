//! Camera abstraction and preview size selection
//!
//! [`CameraBackend`] enumerates and opens cameras; an opened camera is a
//! [`CameraHandle`]. Handles are not `Send`: they are created, used and
//! released on the capture worker thread only (see [`super::capture`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

use super::format::{PixelFormat, Resolution};
use super::surface::PreviewTarget;
use crate::error::Result;

/// Which way a camera faces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Front,
    Back,
    /// Detachable camera (USB, capture card) with no fixed facing
    External,
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Facing::Front => write!(f, "front"),
            Facing::Back => write!(f, "back"),
            Facing::External => write!(f, "external"),
        }
    }
}

/// Static information about one camera
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub index: usize,
    pub name: String,
    pub facing: Facing,
}

/// Capabilities reported by an opened camera
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraParameters {
    /// Preview sizes, in the order the driver reports them
    pub supported_preview_sizes: Vec<Resolution>,
    /// Size the driver recommends for video recording
    pub preferred_preview_size_for_video: Option<Resolution>,
    /// Preview pixel formats
    pub preview_formats: Vec<PixelFormat>,
    /// Size currently configured on the device
    pub current_preview_size: Option<Resolution>,
}

impl CameraParameters {
    /// Best preview format the device offers
    pub fn best_preview_format(&self) -> Option<PixelFormat> {
        self.preview_formats
            .iter()
            .copied()
            .max_by_key(|format| format.preview_priority())
    }
}

/// Asynchronous camera failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    /// The camera service (or driver) went away
    ServerDied,
    /// Another client took the camera
    Evicted,
    /// The device node disappeared or stopped answering
    Disconnected(String),
    Unknown(i32),
}

impl fmt::Display for CameraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraError::ServerDied => write!(f, "camera server died"),
            CameraError::Evicted => write!(f, "camera evicted by another client"),
            CameraError::Disconnected(reason) => write!(f, "camera disconnected: {}", reason),
            CameraError::Unknown(code) => write!(f, "unknown camera error {}", code),
        }
    }
}

/// Callback fired on an arbitrary thread when the camera dies
pub type CameraErrorCallback = Box<dyn Fn(CameraError) + Send + Sync>;

/// Enumerates and opens cameras
pub trait CameraBackend: Send + Sync {
    fn camera_count(&self) -> usize;

    fn camera_info(&self, index: usize) -> Result<CameraInfo>;

    /// Open a camera; fails with `DeviceUnavailable` when it is held elsewhere
    fn open(&self, index: usize) -> Result<Box<dyn CameraHandle>>;

    /// Open the platform default camera
    fn open_default(&self) -> Result<Box<dyn CameraHandle>>;
}

/// An opened camera
pub trait CameraHandle {
    fn info(&self) -> &CameraInfo;

    fn parameters(&self) -> Result<CameraParameters>;

    fn set_preview_size(&mut self, size: Resolution) -> Result<()>;

    fn set_preview_format(&mut self, format: PixelFormat) -> Result<()>;

    fn set_preview_frame_rate(&mut self, fps: u32) -> Result<()>;

    /// Rotation of the preview in degrees (0, 90, 180, 270)
    fn set_display_orientation(&mut self, degrees: u32) -> Result<()>;

    fn set_preview_target(&mut self, target: PreviewTarget) -> Result<()>;

    fn set_error_callback(&mut self, callback: CameraErrorCallback);

    fn start_preview(&mut self) -> Result<()>;

    fn stop_preview(&mut self) -> Result<()>;

    /// Give the hardware back; the handle is unusable afterwards
    fn release(&mut self);
}

/// Pick the preview size for a requested resolution
///
/// Exact match from the supported list wins; otherwise the preferred size for
/// video is used, and failing that the current size or the first supported
/// size. Falling back is logged, never an error.
pub fn choose_preview_size(params: &CameraParameters, requested: Resolution) -> Resolution {
    if params.supported_preview_sizes.contains(&requested) {
        debug!("Preview size {} supported exactly", requested);
        return requested;
    }

    let fallback = params
        .preferred_preview_size_for_video
        .or(params.current_preview_size)
        .or_else(|| params.supported_preview_sizes.first().copied())
        .unwrap_or(requested);

    warn!(
        "Preview size {} not supported, using {} instead",
        requested, fallback
    );
    fallback
}

/// Indexes of the cameras facing `preferred`, in enumeration order
pub fn cameras_facing(backend: &dyn CameraBackend, preferred: Facing) -> Vec<usize> {
    let mut matching = Vec::new();
    for index in 0..backend.camera_count() {
        match backend.camera_info(index) {
            Ok(info) if info.facing == preferred => matching.push(index),
            Ok(_) => {}
            Err(e) => debug!("Skipping camera {}: {}", index, e),
        }
    }
    matching
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(sizes: &[(u32, u32)], preferred: Option<(u32, u32)>) -> CameraParameters {
        CameraParameters {
            supported_preview_sizes: sizes.iter().map(|&s| s.into()).collect(),
            preferred_preview_size_for_video: preferred.map(Into::into),
            preview_formats: vec![PixelFormat::Yuyv, PixelFormat::Nv21],
            current_preview_size: None,
        }
    }

    #[test]
    fn test_exact_match_wins() {
        let p = params(&[(640, 480), (1280, 720)], Some((640, 480)));
        assert_eq!(choose_preview_size(&p, Resolution::HD720), Resolution::HD720);
    }

    #[test]
    fn test_falls_back_to_preferred_size() {
        let p = params(&[(640, 480), (1280, 720)], Some((640, 480)));
        assert_eq!(
            choose_preview_size(&p, Resolution::new(1000, 700)),
            Resolution::VGA
        );
    }

    #[test]
    fn test_fallback_without_preferred_size() {
        let p = params(&[(320, 240), (640, 480)], None);
        assert_eq!(
            choose_preview_size(&p, Resolution::HD1080),
            Resolution::new(320, 240)
        );
        assert_eq!(
            choose_preview_size(&CameraParameters::default(), Resolution::VGA),
            Resolution::VGA
        );
    }

    #[test]
    fn test_best_preview_format() {
        let p = params(&[], None);
        assert_eq!(p.best_preview_format(), Some(PixelFormat::Nv21));
        assert_eq!(CameraParameters::default().best_preview_format(), None);
    }
}
