//! Simulated hardware
//!
//! Software stand-ins for cameras, encoders, the preview view and the
//! packetizer. They follow the same contracts as real devices (exclusive
//! camera ownership, codec call ordering, output events) and record what was
//! done to them, so pipelines can be exercised without hardware.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::device::{
    CameraBackend, CameraError, CameraErrorCallback, CameraHandle, CameraInfo, CameraParameters,
    Facing,
};
use super::encoder::traits::{
    BufferFlags, BufferInfo, CodecInfo, CodecProvider, EncoderFormat, HardwareCodec, OutputEvent,
    OutputFormat, MIME_AVC,
};
use super::format::{ColorFormat, PixelFormat, Resolution};
use super::h264::START_CODE;
use super::packetizer::{AccessUnit, EncodedStream, Packetizer};
use super::parameter_set::CodecParameterSet;
use super::surface::{PreviewTarget, Surface, SurfaceProvider};
use crate::error::{AppError, Result};

/// SPS emitted by simulated encoders (Constrained Baseline, level 3.0)
pub const SIM_SPS: &[u8] = &[0x67, 0x42, 0xc0, 0x1e, 0xda, 0x02, 0x80, 0xbf, 0xe5];
/// PPS emitted by simulated encoders
pub const SIM_PPS: &[u8] = &[0x68, 0xce, 0x06, 0xe2];
/// Name of the default simulated encoder
pub const SIM_ENCODER_NAME: &str = "c2.camcast.sim.avc.encoder";

const IDR_SLICE: &[u8] = &[0x65, 0x88, 0x84, 0x21, 0xa0];
const NON_IDR_SLICE: &[u8] = &[0x41, 0x9a, 0x02, 0x4c, 0x10];
const MAX_COLLECTED_UNITS: usize = 1024;

fn annexb(units: &[&[u8]]) -> Bytes {
    let mut out = BytesMut::new();
    for unit in units {
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(unit);
    }
    out.freeze()
}

// ---------------------------------------------------------------------------
// Cameras
// ---------------------------------------------------------------------------

/// Description of one simulated camera
#[derive(Debug, Clone)]
pub struct SimCameraSpec {
    pub name: String,
    pub facing: Facing,
    pub supported_sizes: Vec<Resolution>,
    pub preferred_size: Option<Resolution>,
}

impl SimCameraSpec {
    pub fn new(name: impl Into<String>, facing: Facing) -> Self {
        Self {
            name: name.into(),
            facing,
            supported_sizes: vec![
                Resolution::QCIF,
                Resolution::new(320, 240),
                Resolution::VGA,
                Resolution::HD720,
            ],
            preferred_size: Some(Resolution::VGA),
        }
    }

    pub fn with_sizes(mut self, sizes: Vec<Resolution>, preferred: Option<Resolution>) -> Self {
        self.supported_sizes = sizes;
        self.preferred_size = preferred;
        self
    }
}

#[derive(Default)]
struct SimCameraState {
    open: AtomicUsize,
    total_opens: AtomicUsize,
    held_elsewhere: AtomicBool,
    previewing: AtomicBool,
    orientation: AtomicU32,
    preview_size: Mutex<Option<Resolution>>,
    callback: Mutex<Option<Arc<dyn Fn(CameraError) + Send + Sync>>>,
}

/// Simulated cameras; at most one can be open at a time
pub struct SimCameraBackend {
    cameras: Vec<SimCameraSpec>,
    state: Arc<SimCameraState>,
}

impl SimCameraBackend {
    pub fn new(cameras: Vec<SimCameraSpec>) -> Self {
        Self {
            cameras,
            state: Arc::new(SimCameraState::default()),
        }
    }

    /// A back camera and a front camera with the default size list
    pub fn standard() -> Self {
        Self::new(vec![
            SimCameraSpec::new("sim-back", Facing::Back),
            SimCameraSpec::new("sim-front", Facing::Front),
        ])
    }

    /// Make every `open` fail as if another process held the camera
    pub fn set_held_elsewhere(&self, held: bool) {
        self.state.held_elsewhere.store(held, Ordering::SeqCst);
    }

    /// Cameras currently open
    pub fn open_count(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Successful opens since creation
    pub fn total_opens(&self) -> usize {
        self.state.total_opens.load(Ordering::SeqCst)
    }

    pub fn is_previewing(&self) -> bool {
        self.state.previewing.load(Ordering::SeqCst)
    }

    pub fn preview_size(&self) -> Option<Resolution> {
        *self.state.preview_size.lock()
    }

    pub fn orientation(&self) -> u32 {
        self.state.orientation.load(Ordering::SeqCst)
    }

    /// Report the open camera as dead from the calling thread
    pub fn kill(&self, error: CameraError) {
        let callback = self.state.callback.lock().clone();
        match callback {
            Some(callback) => callback(error),
            None => warn!("No open simulated camera to kill"),
        }
    }

    fn open_spec(&self, index: usize) -> Result<Box<dyn CameraHandle>> {
        let spec = self.cameras.get(index).ok_or_else(|| {
            AppError::DeviceUnavailable(format!("No simulated camera {}", index))
        })?;
        if self.state.held_elsewhere.load(Ordering::SeqCst) {
            return Err(AppError::DeviceUnavailable(format!(
                "{} is held by another process",
                spec.name
            )));
        }
        if self
            .state
            .open
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::DeviceUnavailable(format!(
                "{}: a camera is already open",
                spec.name
            )));
        }
        self.state.total_opens.fetch_add(1, Ordering::SeqCst);
        debug!("Opened simulated camera {}", spec.name);

        Ok(Box::new(SimCamera {
            info: CameraInfo {
                index,
                name: spec.name.clone(),
                facing: spec.facing,
            },
            spec: spec.clone(),
            state: self.state.clone(),
            target: None,
            released: false,
        }))
    }
}

impl CameraBackend for SimCameraBackend {
    fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    fn camera_info(&self, index: usize) -> Result<CameraInfo> {
        let spec = self.cameras.get(index).ok_or_else(|| {
            AppError::DeviceUnavailable(format!("No simulated camera {}", index))
        })?;
        Ok(CameraInfo {
            index,
            name: spec.name.clone(),
            facing: spec.facing,
        })
    }

    fn open(&self, index: usize) -> Result<Box<dyn CameraHandle>> {
        self.open_spec(index)
    }

    fn open_default(&self) -> Result<Box<dyn CameraHandle>> {
        self.open_spec(0)
    }
}

struct SimCamera {
    info: CameraInfo,
    spec: SimCameraSpec,
    state: Arc<SimCameraState>,
    target: Option<PreviewTarget>,
    released: bool,
}

impl SimCamera {
    fn check(&self) -> Result<()> {
        if self.released {
            return Err(AppError::IllegalState(format!("{} released", self.info.name)));
        }
        Ok(())
    }
}

impl CameraHandle for SimCamera {
    fn info(&self) -> &CameraInfo {
        &self.info
    }

    fn parameters(&self) -> Result<CameraParameters> {
        self.check()?;
        Ok(CameraParameters {
            supported_preview_sizes: self.spec.supported_sizes.clone(),
            preferred_preview_size_for_video: self.spec.preferred_size,
            preview_formats: vec![PixelFormat::Nv21, PixelFormat::Yuv420],
            current_preview_size: *self.state.preview_size.lock(),
        })
    }

    fn set_preview_size(&mut self, size: Resolution) -> Result<()> {
        self.check()?;
        *self.state.preview_size.lock() = Some(size);
        Ok(())
    }

    fn set_preview_format(&mut self, _format: PixelFormat) -> Result<()> {
        self.check()
    }

    fn set_preview_frame_rate(&mut self, _fps: u32) -> Result<()> {
        self.check()
    }

    fn set_display_orientation(&mut self, degrees: u32) -> Result<()> {
        self.check()?;
        self.state.orientation.store(degrees, Ordering::SeqCst);
        Ok(())
    }

    fn set_preview_target(&mut self, target: PreviewTarget) -> Result<()> {
        self.check()?;
        self.target = Some(target);
        Ok(())
    }

    fn set_error_callback(&mut self, callback: CameraErrorCallback) {
        *self.state.callback.lock() = Some(Arc::from(callback));
    }

    fn start_preview(&mut self) -> Result<()> {
        self.check()?;
        if self.target.is_none() {
            return Err(AppError::InvalidSurface(format!(
                "{} has no preview target",
                self.info.name
            )));
        }
        self.state.previewing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_preview(&mut self) -> Result<()> {
        self.check()?;
        self.state.previewing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.state.previewing.store(false, Ordering::SeqCst);
        *self.state.callback.lock() = None;
        self.state.open.fetch_sub(1, Ordering::SeqCst);
        debug!("Released simulated camera {}", self.info.name);
    }
}

impl Drop for SimCamera {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// Encoders
// ---------------------------------------------------------------------------

/// How a simulated encoder reveals its parameter sets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCodecMode {
    /// Output format change carrying csd-0 / csd-1
    FormatChange,
    /// In-band SPS, PPS and IDR glued into the first output buffer
    InBand,
    /// In-band PPS first, then SPS with the IDR slice
    InBandReversed,
    /// Never produces output
    Silent,
}

#[derive(Default)]
struct SimCodecState {
    live: AtomicUsize,
    created: AtomicUsize,
    next_surface: AtomicU64,
    queued_pts: Mutex<Vec<u64>>,
}

/// Simulated codec catalogue
pub struct SimCodecProvider {
    codecs: Vec<CodecInfo>,
    mode: SimCodecMode,
    state: Arc<SimCodecState>,
}

impl SimCodecProvider {
    /// One H.264 encoder accepting surface, semi-planar and planar input
    pub fn new() -> Self {
        Self::with_codecs(vec![CodecInfo::encoder(SIM_ENCODER_NAME).with_type(
            MIME_AVC,
            vec![
                ColorFormat::Surface,
                ColorFormat::Yuv420SemiPlanar,
                ColorFormat::Yuv420Planar,
            ],
        )])
    }

    pub fn with_codecs(codecs: Vec<CodecInfo>) -> Self {
        Self {
            codecs,
            mode: SimCodecMode::FormatChange,
            state: Arc::new(SimCodecState::default()),
        }
    }

    pub fn with_mode(mut self, mode: SimCodecMode) -> Self {
        self.mode = mode;
        self
    }

    /// Codecs created and not yet released
    pub fn live_codecs(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn created_codecs(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    /// Timestamps of every input buffer queued so far
    pub fn queued_pts(&self) -> Vec<u64> {
        self.state.queued_pts.lock().clone()
    }
}

impl Default for SimCodecProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecProvider for SimCodecProvider {
    fn codecs(&self) -> Vec<CodecInfo> {
        self.codecs.clone()
    }

    fn create_by_name(&self, name: &str) -> Result<Box<dyn HardwareCodec>> {
        if !self.codecs.iter().any(|c| c.name == name) {
            return Err(AppError::Codec(format!("Unknown codec {}", name)));
        }
        self.state.live.fetch_add(1, Ordering::SeqCst);
        self.state.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimCodec {
            name: name.to_string(),
            mode: self.mode,
            state: self.state.clone(),
            format: None,
            surface: None,
            started: false,
            released: false,
            input: Vec::new(),
            input_busy: false,
            pending: VecDeque::new(),
            outputs: HashMap::new(),
            next_output: 0,
            frames: 0,
            format_reported: false,
            last_frame: None,
        }))
    }
}

enum SimOutput {
    FormatChanged,
    Data { data: Bytes, info: BufferInfo },
}

struct SimCodec {
    name: String,
    mode: SimCodecMode,
    state: Arc<SimCodecState>,
    format: Option<EncoderFormat>,
    surface: Option<Surface>,
    started: bool,
    released: bool,
    input: Vec<u8>,
    input_busy: bool,
    pending: VecDeque<SimOutput>,
    outputs: HashMap<usize, Bytes>,
    next_output: usize,
    frames: u64,
    format_reported: bool,
    last_frame: Option<Instant>,
}

impl SimCodec {
    fn check_started(&self) -> Result<()> {
        if !self.started {
            return Err(AppError::Codec(format!("{} not started", self.name)));
        }
        Ok(())
    }

    fn frame_interval(&self) -> Duration {
        let fps = self.format.as_ref().map(|f| f.framerate).unwrap_or(30).max(1);
        Duration::from_micros(1_000_000 / fps as u64)
    }

    fn key_interval_frames(&self) -> u64 {
        self.format
            .as_ref()
            .map(|f| (f.framerate as u64 * f.iframe_interval_secs as u64).max(1))
            .unwrap_or(30)
    }

    fn push_data(&mut self, data: Bytes, pts: u64, flags: BufferFlags) {
        let info = BufferInfo {
            offset: 0,
            size: data.len(),
            presentation_time_us: pts,
            flags,
        };
        self.pending.push_back(SimOutput::Data { data, info });
    }

    /// Encode one frame into pending output according to the mode
    fn encode_frame(&mut self, pts: u64) {
        let first = self.frames == 0;
        let key = self.frames % self.key_interval_frames() == 0;
        self.frames += 1;
        let slice = if key { IDR_SLICE } else { NON_IDR_SLICE };
        let slice_flags = BufferFlags {
            key_frame: key,
            ..Default::default()
        };
        let config_flags = BufferFlags {
            codec_config: true,
            ..Default::default()
        };

        match self.mode {
            SimCodecMode::Silent => {}
            SimCodecMode::FormatChange => {
                if first {
                    self.pending.push_back(SimOutput::FormatChanged);
                }
                self.push_data(annexb(&[slice]), pts, slice_flags);
            }
            SimCodecMode::InBand => {
                if first {
                    self.push_data(annexb(&[SIM_SPS, SIM_PPS, slice]), pts, slice_flags);
                } else {
                    self.push_data(annexb(&[slice]), pts, slice_flags);
                }
            }
            SimCodecMode::InBandReversed => {
                if first {
                    self.push_data(annexb(&[SIM_PPS]), pts, config_flags);
                    self.push_data(annexb(&[SIM_SPS, slice]), pts, slice_flags);
                } else {
                    self.push_data(annexb(&[slice]), pts, slice_flags);
                }
            }
        }
    }
}

impl HardwareCodec for SimCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, format: &EncoderFormat) -> Result<()> {
        if self.started {
            return Err(AppError::Codec(format!("{} configured while running", self.name)));
        }
        if format.width == 0 || format.height == 0 || format.framerate == 0 {
            return Err(AppError::Codec(format!("{} rejected format {:?}", self.name, format)));
        }
        self.input = vec![0; (format.width * format.height * 3 / 2) as usize];
        self.format = Some(format.clone());
        Ok(())
    }

    fn create_input_surface(&mut self) -> Result<Surface> {
        let format = self
            .format
            .as_ref()
            .ok_or_else(|| AppError::Codec(format!("{} not configured", self.name)))?;
        if format.color_format != ColorFormat::Surface {
            return Err(AppError::Codec(format!(
                "{} not configured for surface input",
                self.name
            )));
        }
        let id = self.state.next_surface.fetch_add(1, Ordering::SeqCst) + 1;
        let surface = Surface::new(id, self.name.clone());
        self.surface = Some(surface.clone());
        Ok(surface)
    }

    fn start(&mut self) -> Result<()> {
        if self.format.is_none() {
            return Err(AppError::Codec(format!("{} not configured", self.name)));
        }
        if self.started {
            return Err(AppError::Codec(format!("{} already started", self.name)));
        }
        self.started = true;
        self.last_frame = None;
        if self.surface.is_some() && self.mode != SimCodecMode::Silent {
            // Surface-fed encoders announce their configuration first
            let flags = BufferFlags {
                codec_config: true,
                ..Default::default()
            };
            self.push_data(annexb(&[SIM_SPS, SIM_PPS]), 0, flags);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.check_started()?;
        self.started = false;
        self.pending.clear();
        self.outputs.clear();
        self.input_busy = false;
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.started = false;
        self.state.live.fetch_sub(1, Ordering::SeqCst);
    }

    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> Result<Option<usize>> {
        self.check_started()?;
        if self.surface.is_some() {
            return Err(AppError::Codec(format!("{} is surface-fed", self.name)));
        }
        if self.input_busy {
            return Ok(None);
        }
        self.input_busy = true;
        Ok(Some(0))
    }

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8]> {
        self.check_started()?;
        if index != 0 || !self.input_busy {
            return Err(AppError::Codec(format!("Invalid input buffer {}", index)));
        }
        Ok(&mut self.input)
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: u64,
        _flags: BufferFlags,
    ) -> Result<()> {
        self.check_started()?;
        if index != 0 || !self.input_busy || size > self.input.len() {
            return Err(AppError::Codec(format!("Invalid input buffer {}", index)));
        }
        self.input_busy = false;
        self.state.queued_pts.lock().push(presentation_time_us);
        self.encode_frame(presentation_time_us);
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, timeout: Duration) -> Result<OutputEvent> {
        self.check_started()?;

        if self.pending.is_empty() && self.surface.is_some() && self.mode != SimCodecMode::Silent {
            // Surface-fed: a camera frame arrives every frame interval
            let interval = self.frame_interval();
            let due = self.last_frame.map(|t| t + interval).unwrap_or_else(Instant::now);
            let wait = due.saturating_duration_since(Instant::now());
            if wait > timeout {
                std::thread::sleep(timeout);
                return Ok(OutputEvent::TryAgainLater);
            }
            std::thread::sleep(wait);
            self.last_frame = Some(Instant::now());
            let pts = self.frames * interval.as_micros() as u64;
            self.encode_frame(pts);
        }

        match self.pending.pop_front() {
            Some(SimOutput::FormatChanged) => {
                self.format_reported = true;
                Ok(OutputEvent::FormatChanged)
            }
            Some(SimOutput::Data { data, info }) => {
                let index = self.next_output;
                self.next_output += 1;
                self.outputs.insert(index, data);
                Ok(OutputEvent::Buffer { index, info })
            }
            None => {
                std::thread::sleep(timeout.min(Duration::from_millis(5)));
                Ok(OutputEvent::TryAgainLater)
            }
        }
    }

    fn output_buffer(&self, index: usize, info: &BufferInfo) -> Result<Bytes> {
        let data = self
            .outputs
            .get(&index)
            .ok_or_else(|| AppError::Codec(format!("Invalid output buffer {}", index)))?;
        let end = info.offset + info.size;
        if end > data.len() {
            return Err(AppError::Codec(format!("Output range {}..{} out of bounds", info.offset, end)));
        }
        Ok(data.slice(info.offset..end))
    }

    fn release_output_buffer(&mut self, index: usize) -> Result<()> {
        self.outputs
            .remove(&index)
            .map(|_| ())
            .ok_or_else(|| AppError::Codec(format!("Invalid output buffer {}", index)))
    }

    fn output_format(&self) -> Result<OutputFormat> {
        if !self.format_reported {
            return Ok(OutputFormat::default());
        }
        Ok(OutputFormat {
            csd0: Some(annexb(&[SIM_SPS])),
            csd1: Some(annexb(&[SIM_PPS])),
        })
    }
}

impl Drop for SimCodec {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// Preview view
// ---------------------------------------------------------------------------

/// Preview view that records what the pipeline asked of it
pub struct SimSurfaceProvider {
    ready: AtomicBool,
    attached: Mutex<Option<Surface>>,
    aspect_ratio: Mutex<Option<f64>>,
}

impl SimSurfaceProvider {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(true),
            attached: Mutex::new(None),
            aspect_ratio: Mutex::new(None),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn attached(&self) -> Option<Surface> {
        self.attached.lock().clone()
    }

    pub fn aspect_ratio(&self) -> Option<f64> {
        *self.aspect_ratio.lock()
    }
}

impl Default for SimSurfaceProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SurfaceProvider for SimSurfaceProvider {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn preview_target(&self) -> Option<PreviewTarget> {
        self.is_ready().then_some(PreviewTarget { id: 1 })
    }

    fn attach(&self, surface: Surface) {
        *self.attached.lock() = Some(surface);
    }

    fn detach(&self) {
        *self.attached.lock() = None;
    }

    fn request_aspect_ratio(&self, ratio: f64) {
        *self.aspect_ratio.lock() = Some(ratio);
    }
}

// ---------------------------------------------------------------------------
// Packetizer
// ---------------------------------------------------------------------------

/// What a [`CollectingPacketizer`] received
#[derive(Default)]
pub struct CollectedStream {
    units: Mutex<Vec<AccessUnit>>,
    params: Mutex<Option<CodecParameterSet>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl CollectedStream {
    pub fn units(&self) -> Vec<AccessUnit> {
        self.units.lock().clone()
    }

    pub fn unit_count(&self) -> usize {
        self.units.lock().len()
    }

    pub fn total_bytes(&self) -> usize {
        self.units.lock().iter().map(|u| u.data.len()).sum()
    }

    pub fn parameters(&self) -> Option<CodecParameterSet> {
        self.params.lock().clone()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

/// Packetizer that stores access units instead of sending them
pub struct CollectingPacketizer {
    collected: Arc<CollectedStream>,
    input: Option<EncodedStream>,
    stop_flag: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CollectingPacketizer {
    pub fn new() -> Self {
        Self {
            collected: Arc::new(CollectedStream::default()),
            input: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Shared view of the received data, valid after the packetizer is handed off
    pub fn collected(&self) -> Arc<CollectedStream> {
        self.collected.clone()
    }
}

impl Default for CollectingPacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Packetizer for CollectingPacketizer {
    fn set_stream_parameters(&mut self, params: &CodecParameterSet) {
        *self.collected.params.lock() = Some(params.clone());
    }

    fn set_input_stream(&mut self, stream: EncodedStream) {
        self.input = Some(stream);
    }

    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let mut stream = self
            .input
            .take()
            .ok_or_else(|| AppError::IllegalState("Packetizer has no input stream".to_string()))?;
        self.stop_flag.store(false, Ordering::SeqCst);
        self.collected.starts.fetch_add(1, Ordering::SeqCst);

        let collected = self.collected.clone();
        let stop_flag = self.stop_flag.clone();
        let worker = std::thread::Builder::new()
            .name("sim-packetizer".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::SeqCst) {
                    match stream.next_access_unit(Duration::from_millis(20)) {
                        Ok(Some(unit)) => {
                            let mut units = collected.units.lock();
                            if units.len() < MAX_COLLECTED_UNITS {
                                units.push(unit);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            debug!("Packetizer input ended: {}", e);
                            break;
                        }
                    }
                }
            })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            self.collected.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for CollectingPacketizer {
    fn drop(&mut self) {
        self.stop();
    }
}
