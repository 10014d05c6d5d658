//! V4L2 camera backend
//!
//! Exposes Linux capture devices (`/dev/video*`) through [`CameraBackend`].
//! Preview runs a memory-mapped capture stream on its own thread; frames are
//! consumed by the preview path outside this crate, so the loop here only keeps
//! the stream flowing and watches for the device disappearing.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Format, FourCC};

use super::device::{
    CameraBackend, CameraError, CameraErrorCallback, CameraHandle, CameraInfo, CameraParameters,
    Facing,
};
use super::format::{PixelFormat, Resolution};
use super::surface::PreviewTarget;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;

const PREVIEW_BUFFER_COUNT: u32 = 4;
const PREVIEW_TIMEOUT: Duration = Duration::from_secs(2);
const EBUSY: i32 = 16;

/// Capture device found while scanning `/dev`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct V4l2DeviceInfo {
    pub path: PathBuf,
    pub camera: CameraInfo,
    pub driver: String,
    pub bus_info: String,
    pub parameters: CameraParameters,
}

/// [`CameraBackend`] over V4L2 capture devices
pub struct V4l2CameraBackend {
    devices: Vec<V4l2DeviceInfo>,
}

impl V4l2CameraBackend {
    /// Scan `/dev/video*` for capture-capable devices
    pub fn scan() -> Result<Self> {
        Ok(Self {
            devices: enumerate_devices()?,
        })
    }

    pub fn devices(&self) -> &[V4l2DeviceInfo] {
        &self.devices
    }

    fn device(&self, index: usize) -> Result<&V4l2DeviceInfo> {
        self.devices.get(index).ok_or_else(|| {
            AppError::DeviceUnavailable(format!("No capture device with index {}", index))
        })
    }
}

impl CameraBackend for V4l2CameraBackend {
    fn camera_count(&self) -> usize {
        self.devices.len()
    }

    fn camera_info(&self, index: usize) -> Result<CameraInfo> {
        Ok(self.device(index)?.camera.clone())
    }

    fn open(&self, index: usize) -> Result<Box<dyn CameraHandle>> {
        let entry = self.device(index)?;
        Ok(Box::new(V4l2Camera::open(&entry.path, entry.camera.clone())?))
    }

    fn open_default(&self) -> Result<Box<dyn CameraHandle>> {
        if self.devices.is_empty() {
            return Err(AppError::DeviceUnavailable(
                "No video capture devices found".to_string(),
            ));
        }
        self.open(0)
    }
}

/// Guess the facing from the card name; plain V4L2 has no such property
fn detect_facing(card: &str) -> Facing {
    let card = card.to_lowercase();
    if ["front", "user", "selfie"].iter().any(|p| card.contains(p)) {
        Facing::Front
    } else if ["back", "rear", "world"].iter().any(|p| card.contains(p)) {
        Facing::Back
    } else {
        Facing::External
    }
}

fn map_open_error(path: &Path, e: io::Error) -> AppError {
    if e.raw_os_error() == Some(EBUSY) {
        AppError::DeviceUnavailable(format!("{:?} is busy", path))
    } else {
        AppError::DeviceUnavailable(format!("Failed to open {:?}: {}", path, e))
    }
}

/// Errno values meaning the device is gone for good
fn is_device_lost(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(6)         // ENXIO
            | Some(19)  // ENODEV
            | Some(5)   // EIO
            | Some(32)  // EPIPE
            | Some(108) // ESHUTDOWN
    )
}

/// Enumerate all video capture devices
pub fn enumerate_devices() -> Result<Vec<V4l2DeviceInfo>> {
    info!("Enumerating video devices...");

    let mut paths: Vec<PathBuf> = std::fs::read_dir("/dev")?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("video"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut devices = Vec::new();
    for path in paths {
        let device = match Device::with_path(&path) {
            Ok(device) => device,
            Err(e) => {
                debug!("Failed to open {:?}: {}", path, e);
                continue;
            }
        };
        let caps = match device.query_caps() {
            Ok(caps) => caps,
            Err(e) => {
                debug!("Failed to query {:?}: {}", path, e);
                continue;
            }
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            debug!("Skipping non-capture device: {:?}", path);
            continue;
        }

        let parameters = query_parameters(&device);
        let camera = CameraInfo {
            index: devices.len(),
            name: caps.card.clone(),
            facing: detect_facing(&caps.card),
        };
        info!(
            "Found capture device: {} ({}) facing {} - {} preview sizes",
            caps.card,
            caps.driver,
            camera.facing,
            parameters.supported_preview_sizes.len()
        );
        devices.push(V4l2DeviceInfo {
            path,
            camera,
            driver: caps.driver,
            bus_info: caps.bus,
            parameters,
        });
    }

    info!("Found {} video capture devices", devices.len());
    Ok(devices)
}

fn query_parameters(device: &Device) -> CameraParameters {
    let mut preview_formats = Vec::new();
    let mut fourccs = Vec::new();
    match device.enum_formats() {
        Ok(descs) => {
            for desc in descs {
                match PixelFormat::from_fourcc(desc.fourcc) {
                    Some(format) => {
                        preview_formats.push(format);
                        fourccs.push((format, desc.fourcc));
                    }
                    None => debug!(
                        "Skipping unsupported format: {:?} ({})",
                        desc.fourcc, desc.description
                    ),
                }
            }
        }
        Err(e) => debug!("Failed to enumerate formats: {}", e),
    }

    let current = device.format().ok();
    let current_preview_size = current.as_ref().map(|f| Resolution::new(f.width, f.height));

    // Sizes are reported per format; list those of the best preview format
    let best = fourccs
        .iter()
        .max_by_key(|(format, _)| format.preview_priority())
        .map(|(_, fourcc)| *fourcc);
    let supported_preview_sizes = best
        .map(|fourcc| enumerate_sizes(device, fourcc))
        .unwrap_or_default();

    CameraParameters {
        supported_preview_sizes,
        preferred_preview_size_for_video: current_preview_size,
        preview_formats,
        current_preview_size,
    }
}

fn enumerate_sizes(device: &Device, fourcc: FourCC) -> Vec<Resolution> {
    let mut sizes = Vec::new();
    match device.enum_framesizes(fourcc) {
        Ok(framesizes) => {
            for size in framesizes {
                match size.size {
                    v4l::framesize::FrameSizeEnum::Discrete(d) => {
                        sizes.push(Resolution::new(d.width, d.height));
                    }
                    v4l::framesize::FrameSizeEnum::Stepwise(s) => {
                        // For stepwise, offer the common sizes inside the range
                        for res in [
                            Resolution::QCIF,
                            Resolution::VGA,
                            Resolution::HD720,
                            Resolution::HD1080,
                        ] {
                            if res.width >= s.min_width
                                && res.width <= s.max_width
                                && res.height >= s.min_height
                                && res.height <= s.max_height
                            {
                                sizes.push(res);
                            }
                        }
                    }
                }
            }
        }
        Err(e) => debug!("Failed to enumerate frame sizes for {:?}: {}", fourcc, e),
    }
    sizes.dedup();
    sizes
}

struct PreviewConfig {
    size: Option<Resolution>,
    format: Option<PixelFormat>,
    fps: u32,
}

/// An opened V4L2 capture device
pub struct V4l2Camera {
    path: PathBuf,
    info: CameraInfo,
    device: Option<Device>,
    preview: PreviewConfig,
    orientation: u32,
    target: Option<PreviewTarget>,
    on_error: Arc<Mutex<Option<CameraErrorCallback>>>,
    stop_flag: Arc<AtomicBool>,
    preview_thread: Option<JoinHandle<()>>,
}

impl V4l2Camera {
    pub fn open(path: impl AsRef<Path>, info: CameraInfo) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!("Opening video device: {:?}", path);
        let device = Device::with_path(&path).map_err(|e| map_open_error(&path, e))?;

        Ok(Self {
            path,
            info,
            device: Some(device),
            preview: PreviewConfig {
                size: None,
                format: None,
                fps: 0,
            },
            orientation: 0,
            target: None,
            on_error: Arc::new(Mutex::new(None)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            preview_thread: None,
        })
    }

    fn device(&self) -> Result<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| AppError::IllegalState(format!("{:?} already released", self.path)))
    }

    fn apply_format(&self) -> Result<()> {
        let device = self.device()?;
        let current = device
            .format()
            .map_err(|e| AppError::Codec(format!("Failed to get format: {}", e)))?;
        let size = self
            .preview
            .size
            .unwrap_or(Resolution::new(current.width, current.height));
        let fourcc = self
            .preview
            .format
            .map(|f| f.to_fourcc())
            .unwrap_or(current.fourcc);

        let fmt = Format::new(size.width, size.height, fourcc);
        let actual = device.set_format(&fmt).map_err(|e| map_open_error(&self.path, e))?;
        if actual.width != size.width || actual.height != size.height {
            warn!(
                "Requested {}x{}, got {}x{}",
                size.width, size.height, actual.width, actual.height
            );
        }

        if self.preview.fps > 0 {
            if let Err(e) = device.set_params(&Parameters::with_fps(self.preview.fps)) {
                warn!("Failed to set {} fps on {:?}: {}", self.preview.fps, self.path, e);
            }
        }
        Ok(())
    }
}

impl CameraHandle for V4l2Camera {
    fn info(&self) -> &CameraInfo {
        &self.info
    }

    fn parameters(&self) -> Result<CameraParameters> {
        Ok(query_parameters(self.device()?))
    }

    fn set_preview_size(&mut self, size: Resolution) -> Result<()> {
        self.preview.size = Some(size);
        Ok(())
    }

    fn set_preview_format(&mut self, format: PixelFormat) -> Result<()> {
        self.preview.format = Some(format);
        Ok(())
    }

    fn set_preview_frame_rate(&mut self, fps: u32) -> Result<()> {
        self.preview.fps = fps;
        Ok(())
    }

    fn set_display_orientation(&mut self, degrees: u32) -> Result<()> {
        // V4L2 has no display rotation; the preview view applies it
        self.orientation = degrees % 360;
        debug!("Display orientation for {:?}: {}", self.path, self.orientation);
        Ok(())
    }

    fn set_preview_target(&mut self, target: PreviewTarget) -> Result<()> {
        self.target = Some(target);
        Ok(())
    }

    fn set_error_callback(&mut self, callback: CameraErrorCallback) {
        *self.on_error.lock() = Some(callback);
    }

    fn start_preview(&mut self) -> Result<()> {
        if self.preview_thread.is_some() {
            return Ok(());
        }
        self.apply_format()?;

        self.stop_flag.store(false, Ordering::SeqCst);
        let path = self.path.clone();
        let stop_flag = self.stop_flag.clone();
        let on_error = self.on_error.clone();

        let handle = std::thread::Builder::new()
            .name("v4l2-preview".to_string())
            .spawn(move || preview_loop(&path, &stop_flag, &on_error))?;
        self.preview_thread = Some(handle);

        info!("Preview started on {:?}", self.path);
        Ok(())
    }

    fn stop_preview(&mut self) -> Result<()> {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.preview_thread.take() {
            if handle.join().is_err() {
                error!("Preview thread for {:?} panicked", self.path);
            }
            info!("Preview stopped on {:?}", self.path);
        }
        Ok(())
    }

    fn release(&mut self) {
        let _ = self.stop_preview();
        *self.on_error.lock() = None;
        if self.device.take().is_some() {
            debug!("Released video device {:?}", self.path);
        }
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        self.release();
    }
}

fn preview_loop(
    path: &Path,
    stop_flag: &AtomicBool,
    on_error: &Mutex<Option<CameraErrorCallback>>,
) {
    let report = |error: CameraError| {
        if let Some(callback) = on_error.lock().as_ref() {
            callback(error);
        }
    };

    let device = match Device::with_path(path) {
        Ok(device) => device,
        Err(e) => {
            error!("Failed to reopen {:?} for preview: {}", path, e);
            report(CameraError::Disconnected(e.to_string()));
            return;
        }
    };
    let mut stream = match MmapStream::with_buffers(&device, Type::VideoCapture, PREVIEW_BUFFER_COUNT)
    {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to start preview stream on {:?}: {}", path, e);
            report(if e.raw_os_error() == Some(EBUSY) {
                CameraError::Evicted
            } else {
                CameraError::Disconnected(e.to_string())
            });
            return;
        }
    };
    stream.set_timeout(PREVIEW_TIMEOUT);

    let throttler = LogThrottler::with_secs(5);
    while !stop_flag.load(Ordering::Relaxed) {
        match stream.next() {
            Ok((_, meta)) => {
                crate::debug_throttled!(
                    throttler,
                    "preview_frame",
                    "Preview frame {} from {:?}",
                    meta.sequence,
                    path
                );
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                if throttler.should_log("preview_timeout") {
                    warn!("Preview timeout on {:?} - no signal?", path);
                }
            }
            Err(e) if is_device_lost(&e) => {
                error!("Video device lost: {:?} - {}", path, e);
                report(CameraError::Disconnected(e.to_string()));
                return;
            }
            Err(e) => {
                if throttler.should_log("preview_error") {
                    error!("Preview capture error on {:?}: {}", path, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_facing() {
        assert_eq!(detect_facing("Integrated Camera: Front"), Facing::Front);
        assert_eq!(detect_facing("ov5640 rear"), Facing::Back);
        assert_eq!(detect_facing("USB3.0 HD Video Capture"), Facing::External);
    }

    #[test]
    fn test_device_lost_errnos() {
        assert!(is_device_lost(&io::Error::from_raw_os_error(19)));
        assert!(is_device_lost(&io::Error::from_raw_os_error(5)));
        assert!(!is_device_lost(&io::Error::from_raw_os_error(EBUSY)));
    }

    #[test]
    fn test_busy_maps_to_device_unavailable() {
        let err = map_open_error(Path::new("/dev/video0"), io::Error::from_raw_os_error(EBUSY));
        assert!(matches!(err, AppError::DeviceUnavailable(_)));
    }
}
