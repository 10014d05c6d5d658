//! Capture device ownership
//!
//! Every opened camera lives on its own `camera-worker` thread running a
//! private single-threaded runtime. The caller talks to it through a command
//! channel and awaits each reply, so camera callbacks and calls never race
//! with the pipeline. Asynchronous "device died" reports are forwarded on an
//! unbounded channel tagged with the device generation, letting the receiver
//! ignore reports from a device it has already released.

use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::device::{
    cameras_facing, choose_preview_size, CameraBackend, CameraError, CameraHandle, CameraInfo,
    Facing,
};
use super::format::Resolution;
use super::quality::QualityDescriptor;
use super::surface::PreviewTarget;
use crate::error::{AppError, Result};

/// Command queue depth; commands are always awaited one at a time
const COMMAND_QUEUE_SIZE: usize = 8;

/// Asynchronous failure of an open capture device
#[derive(Debug, Clone)]
pub struct DeviceNotification {
    /// Generation of the device that failed
    pub generation: u64,
    pub camera: String,
    pub error: CameraError,
}

enum CaptureCommand {
    Configure {
        orientation: u32,
        quality: QualityDescriptor,
        target: PreviewTarget,
        reply: oneshot::Sender<Result<Resolution>>,
    },
    StartPreview {
        reply: oneshot::Sender<Result<()>>,
    },
    StopPreview {
        reply: oneshot::Sender<Result<()>>,
    },
    Release {
        reply: oneshot::Sender<()>,
    },
}

/// Opens capture devices on dedicated workers
pub struct CaptureDeviceManager {
    backend: Arc<dyn CameraBackend>,
    facing: Facing,
    next_generation: u64,
    notify_tx: mpsc::UnboundedSender<DeviceNotification>,
}

impl CaptureDeviceManager {
    pub fn new(
        backend: Arc<dyn CameraBackend>,
        notify_tx: mpsc::UnboundedSender<DeviceNotification>,
    ) -> Self {
        Self {
            backend,
            facing: Facing::Front,
            next_generation: 1,
            notify_tx,
        }
    }

    /// Facing tried first on the next `open`
    pub fn set_facing(&mut self, facing: Facing) {
        self.facing = facing;
    }

    pub fn facing(&self) -> Facing {
        self.facing
    }

    /// Open a camera on a new worker thread
    ///
    /// Tries the cameras with the configured facing first, then the platform
    /// default. Waits until the worker reports; a failure inside the worker is
    /// returned here.
    pub async fn open(&mut self) -> Result<CaptureDevice> {
        let generation = self.next_generation;
        self.next_generation += 1;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (ready_tx, ready_rx) = oneshot::channel();
        let backend = self.backend.clone();
        let facing = self.facing;
        let notify_tx = self.notify_tx.clone();

        let worker = std::thread::Builder::new()
            .name("camera-worker".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AppError::Io(e)));
                        return;
                    }
                };

                let mut camera = match open_camera(backend.as_ref(), facing) {
                    Ok(camera) => camera,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let name = camera.info().name.clone();
                camera.set_error_callback(Box::new(move |error| {
                    let _ = notify_tx.send(DeviceNotification {
                        generation,
                        camera: name.clone(),
                        error,
                    });
                }));

                if ready_tx.send(Ok(camera.info().clone())).is_err() {
                    // Caller gave up waiting
                    camera.release();
                    return;
                }

                rt.block_on(run_worker(camera, cmd_rx));
            })?;

        let info = match ready_rx.await {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(AppError::DeviceUnavailable(
                    "Camera worker exited before reporting".to_string(),
                ));
            }
        };

        info!(
            "Opened camera {} ({}), generation {}",
            info.name, info.facing, generation
        );

        Ok(CaptureDevice {
            info,
            generation,
            cmd_tx,
            worker: Some(worker),
            updated: false,
            preview_started: false,
            released: false,
            preview_size: None,
        })
    }
}

fn open_camera(backend: &dyn CameraBackend, facing: Facing) -> Result<Box<dyn CameraHandle>> {
    for index in cameras_facing(backend, facing) {
        match backend.open(index) {
            Ok(camera) => return Ok(camera),
            Err(e) => warn!("Failed to open {} camera {}: {}", facing, index, e),
        }
    }
    debug!("No {} camera available, opening default", facing);
    backend.open_default()
}

async fn run_worker(mut camera: Box<dyn CameraHandle>, mut cmd_rx: mpsc::Receiver<CaptureCommand>) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            CaptureCommand::Configure {
                orientation,
                quality,
                target,
                reply,
            } => {
                let _ = reply.send(configure_camera(camera.as_mut(), orientation, quality, target));
            }
            CaptureCommand::StartPreview { reply } => {
                let _ = reply.send(camera.start_preview());
            }
            CaptureCommand::StopPreview { reply } => {
                let _ = reply.send(camera.stop_preview());
            }
            CaptureCommand::Release { reply } => {
                camera.release();
                let _ = reply.send(());
                return;
            }
        }
    }

    // Owner dropped without releasing
    debug!("Camera command channel closed, releasing {}", camera.info().name);
    camera.release();
}

fn configure_camera(
    camera: &mut dyn CameraHandle,
    orientation: u32,
    quality: QualityDescriptor,
    target: PreviewTarget,
) -> Result<Resolution> {
    let params = camera.parameters()?;
    let size = choose_preview_size(&params, quality.resolution());

    if let Some(format) = params.best_preview_format() {
        camera.set_preview_format(format)?;
    }
    camera.set_preview_size(size)?;
    camera.set_preview_frame_rate(quality.framerate)?;
    camera.set_display_orientation(orientation)?;
    camera.set_preview_target(target)?;

    debug!(
        "Configured camera {}: {} @ {}fps, orientation {}",
        camera.info().name,
        size,
        quality.framerate,
        orientation
    );
    Ok(size)
}

/// Handle to a camera owned by a worker thread
pub struct CaptureDevice {
    info: CameraInfo,
    generation: u64,
    cmd_tx: mpsc::Sender<CaptureCommand>,
    worker: Option<JoinHandle<()>>,
    updated: bool,
    preview_started: bool,
    released: bool,
    preview_size: Option<Resolution>,
}

impl CaptureDevice {
    pub fn info(&self) -> &CameraInfo {
        &self.info
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the current quality and orientation have been applied
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    pub fn is_preview_started(&self) -> bool {
        self.preview_started
    }

    /// Preview size chosen by the last `update`
    pub fn preview_size(&self) -> Option<Resolution> {
        self.preview_size
    }

    /// Mark the device as needing `update` before its next preview
    pub fn invalidate(&mut self) {
        self.updated = false;
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> CaptureCommand,
    ) -> Result<T> {
        if self.released {
            return Err(AppError::IllegalState(format!(
                "Camera {} already released",
                self.info.name
            )));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let lost = || AppError::HardwareFailure {
            device: self.info.name.clone(),
            reason: "camera worker is gone".to_string(),
        };
        self.cmd_tx.send(build(reply_tx)).await.map_err(|_| lost())?;
        reply_rx.await.map_err(|_| lost())
    }

    /// Apply orientation, preview size and frame rate for `quality`
    ///
    /// Returns the preview size actually chosen.
    pub async fn update(
        &mut self,
        orientation: u32,
        quality: QualityDescriptor,
        target: PreviewTarget,
    ) -> Result<Resolution> {
        let size = self
            .request(|reply| CaptureCommand::Configure {
                orientation,
                quality,
                target,
                reply,
            })
            .await??;
        self.preview_size = Some(size);
        self.updated = true;
        Ok(size)
    }

    pub async fn start_preview(&mut self) -> Result<()> {
        if self.preview_started {
            return Ok(());
        }
        self.request(|reply| CaptureCommand::StartPreview { reply })
            .await??;
        self.preview_started = true;
        Ok(())
    }

    pub async fn stop_preview(&mut self) -> Result<()> {
        if !self.preview_started {
            return Ok(());
        }
        self.preview_started = false;
        self.request(|reply| CaptureCommand::StopPreview { reply })
            .await?
    }

    /// Stop the worker and give the hardware back; a second call does nothing
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.request(|reply| CaptureCommand::Release { reply }).await {
            // Worker already gone, the camera went with it
            debug!("Release of {}: {}", self.info.name, e);
        }
        self.released = true;
        self.updated = false;
        self.preview_started = false;
        self.preview_size = None;

        if let Some(worker) = self.worker.take() {
            match tokio::task::spawn_blocking(move || worker.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => error!("Camera worker for {} panicked", self.info.name),
                Err(e) => error!("Failed to join camera worker: {}", e),
            }
        }
        info!("Released camera {} (generation {})", self.info.name, self.generation);
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        if !self.released {
            // Closing the command channel makes the worker release the camera
            warn!("Camera {} dropped without release", self.info.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::sim::{SimCameraBackend, SimCameraSpec};

    fn manager(backend: Arc<SimCameraBackend>) -> (CaptureDeviceManager, mpsc::UnboundedReceiver<DeviceNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CaptureDeviceManager::new(backend, tx), rx)
    }

    #[tokio::test]
    async fn test_open_prefers_front_camera() {
        let backend = Arc::new(SimCameraBackend::new(vec![
            SimCameraSpec::new("rear", Facing::Back),
            SimCameraSpec::new("front", Facing::Front),
        ]));
        let (mut manager, _rx) = manager(backend.clone());

        let mut device = manager.open().await.unwrap();
        assert_eq!(device.info().name, "front");
        assert_eq!(backend.open_count(), 1);
        device.release().await;
        assert_eq!(backend.open_count(), 0);

        manager.set_facing(Facing::Back);
        let mut device = manager.open().await.unwrap();
        assert_eq!(device.info().name, "rear");
        device.release().await;
    }

    #[tokio::test]
    async fn test_open_falls_back_to_default() {
        let backend = Arc::new(SimCameraBackend::new(vec![SimCameraSpec::new(
            "usb",
            Facing::External,
        )]));
        let (mut manager, _rx) = manager(backend);
        let mut device = manager.open().await.unwrap();
        assert_eq!(device.info().name, "usb");
        device.release().await;
    }

    #[tokio::test]
    async fn test_open_failure_is_reraised() {
        let backend = Arc::new(SimCameraBackend::new(vec![SimCameraSpec::new(
            "front",
            Facing::Front,
        )]));
        backend.set_held_elsewhere(true);
        let (mut manager, _rx) = manager(backend.clone());

        let err = manager.open().await.err().unwrap();
        assert!(matches!(err, AppError::DeviceUnavailable(_)));
        assert_eq!(backend.open_count(), 0);
    }

    #[tokio::test]
    async fn test_update_and_release_reset_flags() {
        let backend = Arc::new(SimCameraBackend::new(vec![SimCameraSpec::new(
            "front",
            Facing::Front,
        )]));
        let (mut manager, _rx) = manager(backend.clone());
        let mut device = manager.open().await.unwrap();

        let quality = QualityDescriptor::new(1280, 720, 30, 3_000_000);
        let size = device
            .update(90, quality, PreviewTarget { id: 1 })
            .await
            .unwrap();
        assert_eq!(size, Resolution::HD720);
        assert!(device.is_updated());

        device.start_preview().await.unwrap();
        assert!(device.is_preview_started());
        assert!(backend.is_previewing());

        device.release().await;
        assert!(!device.is_updated());
        assert!(!device.is_preview_started());
        assert!(!backend.is_previewing());
        assert_eq!(backend.open_count(), 0);

        // Second release is a no-op
        device.release().await;
        assert!(device.start_preview().await.is_err());
    }

    #[tokio::test]
    async fn test_death_notification_carries_generation() {
        let backend = Arc::new(SimCameraBackend::new(vec![SimCameraSpec::new(
            "front",
            Facing::Front,
        )]));
        let (mut manager, mut rx) = manager(backend.clone());
        let mut device = manager.open().await.unwrap();

        backend.kill(CameraError::ServerDied);
        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.generation, device.generation());
        assert_eq!(notification.error, CameraError::ServerDied);
        device.release().await;
    }
}
