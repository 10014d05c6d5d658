//! Capture → encode pipeline state machine
//!
//! [`StreamPipeline`] coordinates the capture device, the encoder resolver,
//! the parameter-set probe and the live encoder session.
//!
//! ```text
//! Idle ──configure──▶ Configured ──start_preview──▶ PreviewOnly
//!  ▲                      │                            │
//!  │                    start                        start
//!  │                      ▼                            ▼
//!  └──release── Stopped ◀──stop (automatic)──── Streaming
//! ```
//!
//! Every mutating operation runs under one async mutex. Camera death is
//! reported on another thread, forwarded through a channel to a monitor task,
//! and handled under the same mutex, so it can never interleave with a
//! user-initiated `stop`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::capture::{CaptureDevice, CaptureDeviceManager, DeviceNotification};
use super::device::{CameraBackend, Facing};
use super::encoder::probe::CodecConfigProbe;
use super::encoder::registry::{EncoderCapabilityResolver, EncoderConfig};
use super::encoder::session::{EncoderSession, FeedMode};
use super::encoder::traits::CodecProvider;
use super::packetizer::Packetizer;
use super::parameter_set::CodecParameterSet;
use super::quality::QualityDescriptor;
use super::surface::{PreviewTarget, SurfaceProvider};
use crate::config::{ConfigStore, PipelineConfig};
use crate::error::{AppError, Result};
use crate::events::{EventBus, PipelineEvent};

/// Pipeline lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Configured,
    PreviewOnly,
    Streaming,
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Idle => write!(f, "idle"),
            PipelineState::Configured => write!(f, "configured"),
            PipelineState::PreviewOnly => write!(f, "preview_only"),
            PipelineState::Streaming => write!(f, "streaming"),
            PipelineState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Completed pipeline step driving a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Configure,
    StartPreview,
    Start,
    /// Encoder stopped; `preview_kept` when the caller owns the preview
    Stop { had_device: bool, preview_kept: bool },
    Release,
    DeviceLost,
}

impl PipelineState {
    /// State after `transition`, or `IllegalState` if it cannot happen here
    pub fn next(self, transition: Transition) -> Result<PipelineState> {
        use PipelineState::*;

        match (self, transition) {
            (Idle | Configured | Stopped, Transition::Configure) => Ok(Configured),
            // New parameters apply at the next start
            (PreviewOnly | Streaming, Transition::Configure) => Ok(self),

            (Streaming, Transition::StartPreview) => Ok(Streaming),
            (_, Transition::StartPreview) => Ok(PreviewOnly),

            (Idle, Transition::Start) => Err(AppError::IllegalState(
                "start requires a configured pipeline".to_string(),
            )),
            (_, Transition::Start) => Ok(Streaming),

            (state, Transition::Stop { had_device: false, .. }) => Ok(state),
            (_, Transition::Stop { preview_kept: true, .. }) => Ok(PreviewOnly),
            (_, Transition::Stop { .. }) => Ok(Stopped),

            (_, Transition::Release) => Ok(Idle),

            (Idle, Transition::DeviceLost) => Ok(Idle),
            (_, Transition::DeviceLost) => Ok(Stopped),
        }
    }
}

/// Builder for [`StreamPipeline`]
pub struct StreamPipelineBuilder {
    config: PipelineConfig,
    cameras: Arc<dyn CameraBackend>,
    codecs: Arc<dyn CodecProvider>,
    surfaces: Arc<dyn SurfaceProvider>,
    packetizer: Option<Box<dyn Packetizer>>,
    store: Option<ConfigStore>,
    events: Option<Arc<EventBus>>,
}

impl StreamPipelineBuilder {
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn packetizer(mut self, packetizer: Box<dyn Packetizer>) -> Self {
        self.packetizer = Some(packetizer);
        self
    }

    /// Persist probed parameter sets here
    pub fn store(mut self, store: ConfigStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the pipeline; must run inside a tokio runtime
    pub fn build(self) -> Result<StreamPipeline> {
        self.config.validate()?;

        let events = self.events.unwrap_or_default();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(PipelineState::Idle);

        let resolver = EncoderCapabilityResolver::new(self.codecs.clone())
            .with_iframe_interval(self.config.iframe_interval_secs);
        let probe = CodecConfigProbe::new(self.codecs.clone())
            .with_budget(Duration::from_millis(self.config.probe_budget_ms));

        let inner = PipelineInner {
            state: PipelineState::Idle,
            state_tx,
            devices: CaptureDeviceManager::new(self.cameras, notify_tx),
            device: None,
            resolver,
            probe: Arc::new(probe),
            codecs: self.codecs,
            surfaces: self.surfaces,
            packetizer: self.packetizer,
            store: self.store,
            events: events.clone(),
            session: None,
            encoder_config: None,
            params: None,
            active_quality: self.config.default_quality,
            requested_quality: self.config.default_quality,
            active_orientation: self.config.preview_orientation,
            requested_orientation: self.config.preview_orientation,
            needs_update: false,
            manual_preview: false,
            config: self.config,
        };
        let inner = Arc::new(Mutex::new(inner));
        let monitor = tokio::spawn(monitor_devices(Arc::downgrade(&inner), notify_rx));

        Ok(StreamPipeline {
            inner,
            state_rx,
            events,
            monitor,
        })
    }
}

/// Forward device death reports into the pipeline's exclusion domain
async fn monitor_devices(
    inner: Weak<Mutex<PipelineInner>>,
    mut notify_rx: mpsc::UnboundedReceiver<DeviceNotification>,
) {
    while let Some(notification) = notify_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let mut inner = inner.lock().await;
        inner.handle_device_lost(notification).await;
    }
    debug!("Device monitor stopped");
}

/// Capture → encode → parameter-extraction pipeline
pub struct StreamPipeline {
    inner: Arc<Mutex<PipelineInner>>,
    state_rx: watch::Receiver<PipelineState>,
    events: Arc<EventBus>,
    monitor: JoinHandle<()>,
}

impl StreamPipeline {
    pub fn builder(
        cameras: Arc<dyn CameraBackend>,
        codecs: Arc<dyn CodecProvider>,
        surfaces: Arc<dyn SurfaceProvider>,
    ) -> StreamPipelineBuilder {
        StreamPipelineBuilder {
            config: PipelineConfig::default(),
            cameras,
            codecs,
            surfaces,
            packetizer: None,
            store: None,
            events: None,
        }
    }

    /// Current state (lock-free)
    pub fn state(&self) -> PipelineState {
        *self.state_rx.borrow()
    }

    /// Watch state changes
    pub fn state_watch(&self) -> watch::Receiver<PipelineState> {
        self.state_rx.clone()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Resolve an encoder for `quality`, probe its parameter sets and cache them
    ///
    /// Always re-probes. On failure the previously cached parameter set and
    /// the state are left untouched.
    pub async fn configure(&self, quality: QualityDescriptor) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.requested_quality = quality;
        let result = inner.configure().await;
        inner.report("configure", result)
    }

    /// Configure with the quality and orientation requested since the last
    /// `configure`
    pub async fn reconfigure(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let result = inner.configure().await;
        inner.report("configure", result)
    }

    /// Start camera preview and take manual ownership of it
    pub async fn start_preview(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let result = inner.start_preview().await;
        inner.report("start_preview", result)
    }

    /// Start streaming; requires a cached parameter set
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let result = inner.start().await;
        inner.report("start", result)
    }

    /// Stop streaming; keeps the preview if the caller owns it
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let result = inner.stop().await;
        inner.report("stop", result)
    }

    /// Drop manual preview ownership, then stop
    pub async fn stop_preview(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.manual_preview = false;
        let result = inner.stop().await;
        inner.report("stop_preview", result)
    }

    /// The preview view lost its surface
    pub async fn on_surface_destroyed(&self) -> Result<()> {
        info!("Preview surface destroyed, stopping preview");
        self.stop_preview().await
    }

    /// Tear everything down and return to `Idle`, dropping cached parameters
    pub async fn release(&self) {
        let mut inner = self.inner.lock().await;
        inner.release().await;
    }

    /// Parameter sets of the last successful `configure`
    pub async fn codec_parameter_set(&self) -> Result<CodecParameterSet> {
        let inner = self.inner.lock().await;
        inner.params.clone().ok_or_else(|| {
            AppError::IllegalState("No codec parameter set; call configure first".to_string())
        })
    }

    /// Encoder chosen by the last successful `configure`
    pub async fn encoder_config(&self) -> Option<EncoderConfig> {
        self.inner.lock().await.encoder_config.clone()
    }

    /// Quality for the next `reconfigure`
    pub async fn set_quality(&self, quality: QualityDescriptor) -> Result<()> {
        quality.validate()?;
        let mut inner = self.inner.lock().await;
        if inner.requested_quality != quality {
            debug!("Requested quality {}", quality);
            inner.requested_quality = quality;
            inner.needs_update = true;
        }
        Ok(())
    }

    /// Preview rotation in degrees, applied at the next configure
    pub async fn set_preview_orientation(&self, degrees: u32) -> Result<()> {
        if degrees % 90 != 0 || degrees >= 360 {
            return Err(AppError::Config(format!(
                "Invalid preview orientation {}",
                degrees
            )));
        }
        let mut inner = self.inner.lock().await;
        if inner.requested_orientation != degrees {
            inner.requested_orientation = degrees;
            inner.needs_update = true;
        }
        Ok(())
    }

    /// Camera facing tried first the next time a camera is opened
    pub async fn set_facing(&self, facing: Facing) {
        let mut inner = self.inner.lock().await;
        inner.devices.set_facing(facing);
        if inner.device.is_some() {
            debug!("Facing {} applies after the current camera is released", facing);
        }
    }

    /// Whether quality or orientation changed since the last `configure`
    pub async fn needs_update(&self) -> bool {
        self.inner.lock().await.needs_update
    }

    pub async fn active_quality(&self) -> QualityDescriptor {
        self.inner.lock().await.active_quality
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

struct PipelineInner {
    state: PipelineState,
    state_tx: watch::Sender<PipelineState>,
    config: PipelineConfig,
    devices: CaptureDeviceManager,
    device: Option<CaptureDevice>,
    resolver: EncoderCapabilityResolver,
    probe: Arc<CodecConfigProbe>,
    codecs: Arc<dyn CodecProvider>,
    surfaces: Arc<dyn SurfaceProvider>,
    packetizer: Option<Box<dyn Packetizer>>,
    store: Option<ConfigStore>,
    events: Arc<EventBus>,
    session: Option<EncoderSession>,
    encoder_config: Option<EncoderConfig>,
    params: Option<CodecParameterSet>,
    active_quality: QualityDescriptor,
    requested_quality: QualityDescriptor,
    active_orientation: u32,
    requested_orientation: u32,
    needs_update: bool,
    manual_preview: bool,
}

impl PipelineInner {
    fn apply(&mut self, transition: Transition) -> Result<()> {
        let next = self.state.next(transition)?;
        if next != self.state {
            info!("Pipeline state: {} -> {}", self.state, next);
            let from = self.state;
            self.state = next;
            let _ = self.state_tx.send(next);
            self.events.publish(PipelineEvent::StateChanged { from, to: next });
        }
        Ok(())
    }

    fn report<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!("Pipeline {} failed: {}", operation, e);
            self.events.publish(PipelineEvent::Error {
                operation: operation.to_string(),
                kind: e.kind().to_string(),
                message: e.to_string(),
            });
        }
        result
    }

    fn preview_target(&self) -> Result<PreviewTarget> {
        if !self.surfaces.is_ready() {
            return Err(AppError::InvalidSurface(
                "Preview surface is not ready".to_string(),
            ));
        }
        self.surfaces.preview_target().ok_or_else(|| {
            AppError::InvalidSurface("Preview surface has no target".to_string())
        })
    }

    async fn configure(&mut self) -> Result<()> {
        let quality = self.requested_quality;
        quality.validate()?;

        let encoder_config = self.resolver.resolve(
            &self.config.mime_type,
            self.config.preferred_encoder.as_deref(),
        )?;

        let probe = self.probe.clone();
        let probe_config = encoder_config.clone();
        let params = tokio::task::spawn_blocking(move || probe.probe(&probe_config, quality))
            .await
            .map_err(|e| AppError::Internal(format!("Probe task failed: {}", e)))??;

        self.apply(Transition::Configure)?;

        if let Some(store) = &self.store {
            if self.config.persist_parameter_sets {
                if let Err(e) = store
                    .save_parameter_set(
                        &encoder_config.mime,
                        &encoder_config.encoder_name,
                        &quality,
                        &params,
                    )
                    .await
                {
                    warn!("Failed to persist parameter sets: {}", e);
                }
            }
        }

        self.events.publish(PipelineEvent::Configured {
            encoder: encoder_config.encoder_name.clone(),
            vendor: encoder_config.vendor.to_string(),
            color_format: encoder_config.color_format.to_string(),
            quality,
            profile_level_id: params.profile_level_id().to_string(),
            sprop_parameter_sets: params.sprop_parameter_sets(),
        });

        self.active_quality = quality;
        self.active_orientation = self.requested_orientation;
        self.needs_update = false;
        self.encoder_config = Some(encoder_config);
        self.params = Some(params);
        if let Some(device) = self.device.as_mut() {
            device.invalidate();
        }
        Ok(())
    }

    /// Open the camera if needed and get its preview running
    ///
    /// Returns whether the camera was opened by this call. A camera opened
    /// here is released again on failure.
    async fn ensure_preview(&mut self) -> Result<bool> {
        let target = self.preview_target()?;

        let opened = match self.device {
            Some(_) => false,
            None => {
                self.device = Some(self.devices.open().await?);
                true
            }
        };

        if let Err(e) = self.apply_preview(target).await {
            if opened {
                self.release_device().await;
            }
            return Err(e);
        }
        Ok(opened)
    }

    async fn apply_preview(&mut self, target: PreviewTarget) -> Result<()> {
        let orientation = self.active_orientation;
        let quality = self.active_quality;
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| AppError::Internal("No capture device".to_string()))?;

        if !device.is_updated() {
            // Preview parameters cannot change while previewing
            device.stop_preview().await?;
            let size = device.update(orientation, quality, target).await?;
            self.surfaces.request_aspect_ratio(size.aspect_ratio());
        }
        device.start_preview().await
    }

    async fn release_device(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.release().await;
        }
    }

    async fn start_preview(&mut self) -> Result<()> {
        if matches!(self.state, PipelineState::PreviewOnly | PipelineState::Streaming) {
            self.manual_preview = true;
            return Ok(());
        }

        self.ensure_preview().await?;
        self.manual_preview = true;
        self.apply(Transition::StartPreview)?;

        if let Some(device) = &self.device {
            let size = device.preview_size().unwrap_or(self.active_quality.resolution());
            self.events.publish(PipelineEvent::PreviewStarted {
                camera: device.info().name.clone(),
                resolution: (size.width, size.height),
                orientation: self.active_orientation,
            });
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        if self.state == PipelineState::Streaming {
            return Ok(());
        }
        let (Some(encoder_config), Some(params)) = (self.encoder_config.clone(), self.params.clone())
        else {
            return Err(AppError::IllegalState(
                "start requires a codec parameter set; call configure first".to_string(),
            ));
        };
        self.state.next(Transition::Start)?;

        let opened = self.ensure_preview().await?;

        let session = match self.launch_session(&encoder_config, &params) {
            Ok(session) => session,
            Err(e) => {
                // A camera opened here never outlives the failed start
                if opened {
                    self.manual_preview = false;
                    self.release_device().await;
                }
                return Err(e);
            }
        };

        let quality = session.quality();
        self.events.publish(PipelineEvent::StreamingStarted {
            encoder: session.name().to_string(),
            quality,
        });
        self.session = Some(session);

        if opened {
            // Preview started on behalf of the encoder only
            self.manual_preview = false;
        }
        self.apply(Transition::Start)
    }

    /// Start the surface-fed encoder and connect its surface and output
    fn launch_session(
        &mut self,
        encoder_config: &EncoderConfig,
        params: &CodecParameterSet,
    ) -> Result<EncoderSession> {
        let mut session = EncoderSession::launch(
            self.codecs.as_ref(),
            encoder_config,
            self.active_quality,
            FeedMode::Surface,
        )?;

        let surface = session
            .input_surface()
            .cloned()
            .ok_or_else(|| AppError::InvalidSurface("Encoder exposed no input surface".to_string()))?;
        self.surfaces.attach(surface);

        if let Some(packetizer) = self.packetizer.as_mut() {
            let handed_off = session.output_stream().and_then(|stream| {
                packetizer.set_stream_parameters(params);
                packetizer.set_input_stream(stream);
                packetizer.start()
            });
            if let Err(e) = handed_off {
                self.surfaces.detach();
                session.release();
                return Err(e);
            }
        } else {
            debug!("No packetizer attached, encoder output is not consumed");
        }

        Ok(session)
    }

    /// Stop the packetizer and the encoder session, detaching its surface
    fn stop_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Some(packetizer) = self.packetizer.as_mut() {
                packetizer.stop();
            }
            self.surfaces.detach();
            session.release();
        }
    }

    async fn stop(&mut self) -> Result<()> {
        if self.device.is_none() {
            self.stop_session();
            return self.apply(Transition::Stop {
                had_device: false,
                preview_kept: false,
            });
        }

        self.stop_session();

        let preview_kept = if self.manual_preview {
            match self.ensure_preview().await {
                Ok(_) => true,
                Err(e) => {
                    error!("Failed to restore preview: {}", e);
                    self.manual_preview = false;
                    self.release_device().await;
                    false
                }
            }
        } else {
            self.release_device().await;
            false
        };

        self.apply(Transition::Stop {
            had_device: true,
            preview_kept,
        })?;
        self.events.publish(PipelineEvent::Stopped {
            device_released: !preview_kept,
        });
        Ok(())
    }

    async fn release(&mut self) {
        self.manual_preview = false;
        self.stop_session();
        self.release_device().await;
        self.params = None;
        self.encoder_config = None;
        let _ = self.apply(Transition::Release);
        info!("Pipeline released");
    }

    async fn handle_device_lost(&mut self, notification: DeviceNotification) {
        let current = self.device.as_ref().map(|d| d.generation());
        if current != Some(notification.generation) {
            debug!(
                "Ignoring death of stale camera {} (generation {})",
                notification.camera, notification.generation
            );
            return;
        }

        error!(
            "Camera {} died: {}; tearing down",
            notification.camera, notification.error
        );
        self.manual_preview = false;
        self.stop_session();
        self.release_device().await;
        let _ = self.apply(Transition::DeviceLost);

        self.events.publish(PipelineEvent::HardwareFailure {
            device: notification.camera,
            reason: notification.error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::device::CameraError;
    use crate::video::format::Resolution;
    use crate::video::sim::{
        CollectedStream, CollectingPacketizer, SimCameraBackend, SimCameraSpec, SimCodecMode,
        SimCodecProvider, SimSurfaceProvider,
    };
    use tokio::sync::broadcast;

    struct Harness {
        pipeline: StreamPipeline,
        cameras: Arc<SimCameraBackend>,
        codecs: Arc<SimCodecProvider>,
        surfaces: Arc<SimSurfaceProvider>,
        collected: Arc<CollectedStream>,
        events: broadcast::Receiver<PipelineEvent>,
    }

    fn harness_with(codecs: SimCodecProvider, config: PipelineConfig) -> Harness {
        let cameras = Arc::new(SimCameraBackend::standard());
        let codecs = Arc::new(codecs);
        let surfaces = Arc::new(SimSurfaceProvider::new());
        let packetizer = CollectingPacketizer::new();
        let collected = packetizer.collected();
        let bus = Arc::new(EventBus::new());
        let events = bus.subscribe();

        let pipeline = StreamPipeline::builder(cameras.clone(), codecs.clone(), surfaces.clone())
            .config(config)
            .packetizer(Box::new(packetizer))
            .events(bus)
            .build()
            .unwrap();

        Harness {
            pipeline,
            cameras,
            codecs,
            surfaces,
            collected,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(SimCodecProvider::new(), PipelineConfig::default())
    }

    const HD: QualityDescriptor = QualityDescriptor::new(1280, 720, 30, 3_000_000);

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<PipelineEvent>,
        topic: &str,
    ) -> Option<PipelineEvent> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(event)) if event.matches_topic(topic) => return Some(event),
                Ok(Ok(_)) => continue,
                _ => return None,
            }
        }
    }

    #[test]
    fn test_transition_function() {
        use PipelineState::*;

        assert_eq!(Idle.next(Transition::Configure).unwrap(), Configured);
        assert_eq!(Stopped.next(Transition::Configure).unwrap(), Configured);
        assert_eq!(Streaming.next(Transition::Configure).unwrap(), Streaming);
        assert_eq!(Configured.next(Transition::StartPreview).unwrap(), PreviewOnly);
        assert_eq!(Streaming.next(Transition::StartPreview).unwrap(), Streaming);
        assert!(matches!(
            Idle.next(Transition::Start),
            Err(AppError::IllegalState(_))
        ));
        assert_eq!(PreviewOnly.next(Transition::Start).unwrap(), Streaming);

        let keep = Transition::Stop {
            had_device: true,
            preview_kept: true,
        };
        let teardown = Transition::Stop {
            had_device: true,
            preview_kept: false,
        };
        let none = Transition::Stop {
            had_device: false,
            preview_kept: false,
        };
        assert_eq!(Streaming.next(keep).unwrap(), PreviewOnly);
        assert_eq!(Streaming.next(teardown).unwrap(), Stopped);
        assert_eq!(Idle.next(none).unwrap(), Idle);
        assert_eq!(Stopped.next(none).unwrap(), Stopped);

        assert_eq!(Stopped.next(Transition::Release).unwrap(), Idle);
        assert_eq!(Streaming.next(Transition::DeviceLost).unwrap(), Stopped);
    }

    #[tokio::test]
    async fn test_hd_scenario_preview_then_stream() {
        let mut h = harness();

        h.pipeline.configure(HD).await.unwrap();
        assert_eq!(h.pipeline.state(), PipelineState::Configured);
        assert_eq!(h.cameras.open_count(), 0);

        h.pipeline.start_preview().await.unwrap();
        assert_eq!(h.pipeline.state(), PipelineState::PreviewOnly);
        assert_eq!(h.cameras.preview_size(), Some(Resolution::HD720));
        assert!(h.cameras.is_previewing());
        let ratio = h.surfaces.aspect_ratio().unwrap();
        assert!((ratio - 16.0 / 9.0).abs() < 1e-9);

        match next_matching(&mut h.events, "pipeline.preview_started").await {
            Some(PipelineEvent::PreviewStarted { resolution, .. }) => {
                assert_eq!(resolution, (1280, 720))
            }
            other => panic!("unexpected event {:?}", other),
        }

        h.pipeline.start().await.unwrap();
        assert_eq!(h.pipeline.state(), PipelineState::Streaming);
        assert!(h.surfaces.attached().is_some());

        let collected = h.collected.clone();
        assert!(wait_for(|| collected.unit_count() > 0).await);
        assert!(h.collected.total_bytes() > 0);
        assert!(h.collected.units()[0].key_frame);
        assert_eq!(
            h.collected.parameters().unwrap(),
            h.pipeline.codec_parameter_set().await.unwrap()
        );

        // Manual ownership: stop restores the preview
        h.pipeline.stop().await.unwrap();
        assert_eq!(h.pipeline.state(), PipelineState::PreviewOnly);
        assert!(h.surfaces.attached().is_none());
        assert_eq!(h.cameras.open_count(), 1);
        assert!(h.cameras.is_previewing());
        assert_eq!(h.collected.stops(), 1);

        h.pipeline.stop_preview().await.unwrap();
        assert_eq!(h.pipeline.state(), PipelineState::Stopped);
        assert_eq!(h.cameras.open_count(), 0);
        assert_eq!(h.codecs.live_codecs(), 0);
    }

    #[tokio::test]
    async fn test_automatic_ownership_releases_device_on_stop() {
        let h = harness();
        h.pipeline.configure(HD).await.unwrap();

        h.pipeline.start().await.unwrap();
        assert_eq!(h.pipeline.state(), PipelineState::Streaming);
        assert_eq!(h.cameras.open_count(), 1);

        // Starting again is a no-op
        h.pipeline.start().await.unwrap();
        assert_eq!(h.cameras.total_opens(), 1);

        h.pipeline.stop().await.unwrap();
        assert_eq!(h.pipeline.state(), PipelineState::Stopped);
        assert_eq!(h.cameras.open_count(), 0);
        assert_eq!(h.codecs.live_codecs(), 0);

        // Restart from Stopped reuses the cached parameters
        h.pipeline.start().await.unwrap();
        assert_eq!(h.pipeline.state(), PipelineState::Streaming);
        h.pipeline.stop().await.unwrap();
        assert_eq!(h.cameras.open_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let h = harness();
        h.pipeline.stop().await.unwrap();
        h.pipeline.stop().await.unwrap();
        assert_eq!(h.pipeline.state(), PipelineState::Idle);

        h.pipeline.configure(HD).await.unwrap();
        h.pipeline.start().await.unwrap();
        h.pipeline.stop().await.unwrap();
        assert_eq!(h.pipeline.state(), PipelineState::Stopped);
        h.pipeline.stop().await.unwrap();
        h.pipeline.stop_preview().await.unwrap();
        assert_eq!(h.pipeline.state(), PipelineState::Stopped);
        assert_eq!(h.cameras.open_count(), 0);
    }

    #[tokio::test]
    async fn test_repeated_configure_reprobes_without_extra_devices() {
        let h = harness();
        h.pipeline.start_preview().await.unwrap();
        assert_eq!(h.cameras.open_count(), 1);

        h.pipeline.configure(HD).await.unwrap();
        let after_first = h.codecs.created_codecs();
        h.pipeline.configure(HD).await.unwrap();
        assert_eq!(h.codecs.created_codecs(), after_first + 1);

        assert_eq!(h.cameras.open_count(), 1);
        assert_eq!(h.cameras.total_opens(), 1);
        assert_eq!(h.codecs.live_codecs(), 0);
        assert_eq!(h.pipeline.state(), PipelineState::PreviewOnly);

        // Preview picks up the new quality at the next start
        h.pipeline.start().await.unwrap();
        assert_eq!(h.cameras.preview_size(), Some(Resolution::HD720));
        h.pipeline.stop_preview().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_without_configure_is_illegal() {
        let mut h = harness();
        let err = h.pipeline.start().await.unwrap_err();
        assert!(matches!(err, AppError::IllegalState(_)));
        assert_eq!(h.pipeline.state(), PipelineState::Idle);
        assert_eq!(h.cameras.open_count(), 0);
        assert!(matches!(
            h.pipeline.codec_parameter_set().await,
            Err(AppError::IllegalState(_))
        ));

        match next_matching(&mut h.events, "pipeline.error").await {
            Some(PipelineEvent::Error { operation, kind, .. }) => {
                assert_eq!(operation, "start");
                assert_eq!(kind, "illegal_state");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_encoder_keeps_previous_state() {
        let config = PipelineConfig {
            mime_type: "video/x-vnd.on2.vp8".to_string(),
            ..PipelineConfig::default()
        };
        let h = harness_with(SimCodecProvider::new(), config);
        h.pipeline.start_preview().await.unwrap();

        let err = h.pipeline.configure(HD).await.unwrap_err();
        assert!(matches!(err, AppError::UnsupportedConfiguration(_)));
        assert_eq!(h.pipeline.state(), PipelineState::PreviewOnly);
        assert_eq!(h.cameras.open_count(), 1);
        assert_eq!(h.codecs.live_codecs(), 0);

        h.pipeline.stop_preview().await.unwrap();
        assert_eq!(h.cameras.open_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_configure_keeps_cached_parameters() {
        let h = harness();
        h.pipeline.configure(HD).await.unwrap();
        let params = h.pipeline.codec_parameter_set().await.unwrap();

        let bad = QualityDescriptor::new(1280, 720, 0, 3_000_000);
        assert!(h.pipeline.configure(bad).await.is_err());
        assert_eq!(h.pipeline.codec_parameter_set().await.unwrap(), params);
        assert_eq!(h.pipeline.active_quality().await, HD);
        assert_eq!(h.pipeline.state(), PipelineState::Configured);
    }

    #[tokio::test]
    async fn test_probe_timeout_leaves_pipeline_idle() {
        let config = PipelineConfig {
            probe_budget_ms: 150,
            ..PipelineConfig::default()
        };
        let h = harness_with(SimCodecProvider::new().with_mode(SimCodecMode::Silent), config);

        let err = h.pipeline.configure(HD).await.unwrap_err();
        assert!(matches!(err, AppError::ConfigurationTimeout { .. }));
        assert_eq!(h.pipeline.state(), PipelineState::Idle);
        assert!(h.pipeline.codec_parameter_set().await.is_err());
        assert_eq!(h.codecs.live_codecs(), 0);
    }

    #[tokio::test]
    async fn test_device_death_forces_teardown() {
        let mut h = harness();
        h.pipeline.configure(HD).await.unwrap();
        h.pipeline.start_preview().await.unwrap();
        h.pipeline.start().await.unwrap();

        h.cameras.kill(CameraError::ServerDied);

        match next_matching(&mut h.events, "pipeline.hardware_failure").await {
            Some(PipelineEvent::HardwareFailure { device, .. }) => assert_eq!(device, "sim-front"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(h.pipeline.state(), PipelineState::Stopped);
        assert_eq!(h.cameras.open_count(), 0);
        assert_eq!(h.codecs.live_codecs(), 0);
        assert!(h.surfaces.attached().is_none());

        // Cached parameters survive; nothing restarts on its own
        assert!(h.pipeline.codec_parameter_set().await.is_ok());
        h.pipeline.stop().await.unwrap();
        assert_eq!(h.pipeline.state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_surface_not_ready() {
        let h = harness();
        h.surfaces.set_ready(false);

        let err = h.pipeline.start_preview().await.unwrap_err();
        assert!(matches!(err, AppError::InvalidSurface(_)));
        assert_eq!(h.pipeline.state(), PipelineState::Idle);
        assert_eq!(h.cameras.open_count(), 0);
    }

    #[tokio::test]
    async fn test_device_unavailable() {
        let h = harness();
        h.cameras.set_held_elsewhere(true);

        let err = h.pipeline.start_preview().await.unwrap_err();
        assert!(matches!(err, AppError::DeviceUnavailable(_)));
        assert_eq!(h.pipeline.state(), PipelineState::Idle);
        assert_eq!(h.cameras.open_count(), 0);
    }

    #[tokio::test]
    async fn test_surface_destroyed_stops_preview() {
        let h = harness();
        h.pipeline.start_preview().await.unwrap();
        assert_eq!(h.cameras.open_count(), 1);

        h.pipeline.on_surface_destroyed().await.unwrap();
        assert_eq!(h.pipeline.state(), PipelineState::Stopped);
        assert_eq!(h.cameras.open_count(), 0);
    }

    /// Accepts the first `start` and rejects every later one
    struct OneShotPacketizer {
        starts: usize,
    }

    impl Packetizer for OneShotPacketizer {
        fn set_stream_parameters(&mut self, _params: &CodecParameterSet) {}

        fn set_input_stream(&mut self, _stream: crate::video::packetizer::EncodedStream) {}

        fn start(&mut self) -> Result<()> {
            self.starts += 1;
            if self.starts > 1 {
                return Err(AppError::Internal("packetizer down".to_string()));
            }
            Ok(())
        }

        fn stop(&mut self) {}
    }

    #[tokio::test]
    async fn test_failed_restart_after_lost_preview_releases_camera() {
        let cameras = Arc::new(SimCameraBackend::standard());
        let surfaces = Arc::new(SimSurfaceProvider::new());
        let pipeline = StreamPipeline::builder(
            cameras.clone(),
            Arc::new(SimCodecProvider::new()),
            surfaces.clone(),
        )
        .packetizer(Box::new(OneShotPacketizer { starts: 0 }))
        .build()
        .unwrap();

        pipeline.configure(HD).await.unwrap();
        pipeline.start_preview().await.unwrap();
        pipeline.start().await.unwrap();

        // Preview cannot come back, so the camera goes and ownership is dropped
        surfaces.set_ready(false);
        pipeline.stop().await.unwrap();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert_eq!(cameras.open_count(), 0);

        surfaces.set_ready(true);
        let err = pipeline.start().await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert_eq!(cameras.open_count(), 0);
        assert!(surfaces.attached().is_none());

        pipeline.stop().await.unwrap();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_release_returns_to_idle() {
        let h = harness();
        h.pipeline.configure(HD).await.unwrap();
        h.pipeline.start().await.unwrap();

        h.pipeline.release().await;
        assert_eq!(h.pipeline.state(), PipelineState::Idle);
        assert_eq!(h.cameras.open_count(), 0);
        assert_eq!(h.codecs.live_codecs(), 0);
        assert!(h.pipeline.codec_parameter_set().await.is_err());
        assert!(h.pipeline.encoder_config().await.is_none());
    }

    #[tokio::test]
    async fn test_orientation_and_quality_apply_at_configure() {
        let h = harness();
        h.pipeline.set_preview_orientation(90).await.unwrap();
        h.pipeline.set_quality(HD).await.unwrap();
        assert!(h.pipeline.needs_update().await);
        assert!(h.pipeline.set_preview_orientation(45).await.is_err());

        h.pipeline.reconfigure().await.unwrap();
        assert!(!h.pipeline.needs_update().await);
        assert_eq!(h.pipeline.active_quality().await, HD);

        h.pipeline.start_preview().await.unwrap();
        assert_eq!(h.cameras.orientation(), 90);
        h.pipeline.stop_preview().await.unwrap();
    }

    #[tokio::test]
    async fn test_preview_size_fallback_and_facing() {
        let cameras = Arc::new(SimCameraBackend::new(vec![
            SimCameraSpec::new("front", Facing::Front),
            SimCameraSpec::new("back", Facing::Back)
                .with_sizes(vec![Resolution::VGA], Some(Resolution::VGA)),
        ]));
        let surfaces = Arc::new(SimSurfaceProvider::new());
        let pipeline = StreamPipeline::builder(
            cameras.clone(),
            Arc::new(SimCodecProvider::new()),
            surfaces.clone(),
        )
        .build()
        .unwrap();

        pipeline.set_facing(Facing::Back).await;
        pipeline.configure(HD).await.unwrap();
        pipeline.start_preview().await.unwrap();

        assert_eq!(cameras.preview_size(), Some(Resolution::VGA));
        let ratio = surfaces.aspect_ratio().unwrap();
        assert!((ratio - 4.0 / 3.0).abs() < 1e-9);
        pipeline.stop_preview().await.unwrap();
    }

    #[tokio::test]
    async fn test_parameter_sets_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(&dir.path().join("camcast.db")).await.unwrap();

        let pipeline = StreamPipeline::builder(
            Arc::new(SimCameraBackend::standard()),
            Arc::new(SimCodecProvider::new().with_mode(SimCodecMode::InBandReversed)),
            Arc::new(SimSurfaceProvider::new()),
        )
        .store(store.clone())
        .build()
        .unwrap();

        pipeline.configure(HD).await.unwrap();
        let stored = store.list_parameter_sets().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].quality, HD);
        assert_eq!(
            stored[0].to_parameter_set().unwrap(),
            pipeline.codec_parameter_set().await.unwrap()
        );
    }
}
