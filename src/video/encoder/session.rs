//! Encoder session lifecycle
//!
//! An [`EncoderSession`] owns one configured hardware codec. It is either
//! surface-fed (the codec exposes an input surface the preview renders into)
//! or buffer-fed (the caller queues raw frames), fixed at creation.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::registry::EncoderConfig;
use super::traits::{CodecProvider, EncoderFormat, HardwareCodec};
use crate::error::{AppError, Result};
use crate::video::format::ColorFormat;
use crate::video::packetizer::EncodedStream;
use crate::video::quality::QualityDescriptor;
use crate::video::surface::Surface;

/// How frames reach the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    /// Frames are rendered into the codec's input surface
    Surface,
    /// Raw frames are queued into input buffers by the caller
    Buffer,
}

pub(crate) type SharedCodec = Arc<Mutex<Box<dyn HardwareCodec>>>;

/// A configured hardware encoder
pub struct EncoderSession {
    codec: SharedCodec,
    name: String,
    config: EncoderConfig,
    quality: QualityDescriptor,
    mode: FeedMode,
    input_surface: Option<Surface>,
    running: Arc<AtomicBool>,
    started: bool,
    released: bool,
}

impl EncoderSession {
    /// Instantiate and configure the encoder named by `config`
    ///
    /// Resolution, bitrate, framerate and key-frame interval are applied here;
    /// `quality` cannot change for the lifetime of the session.
    pub fn open(
        provider: &dyn CodecProvider,
        config: &EncoderConfig,
        quality: QualityDescriptor,
        mode: FeedMode,
    ) -> Result<Self> {
        let mut codec = provider.create_by_name(&config.encoder_name)?;

        let format = EncoderFormat {
            mime: config.mime.clone(),
            width: quality.width,
            height: quality.height,
            bitrate: quality.bitrate,
            framerate: quality.framerate,
            color_format: match mode {
                FeedMode::Surface => ColorFormat::Surface,
                FeedMode::Buffer => config.color_format,
            },
            iframe_interval_secs: config.iframe_interval_secs,
        };

        let configured = codec.configure(&format).and_then(|_| match mode {
            FeedMode::Surface => codec.create_input_surface().map(Some),
            FeedMode::Buffer => Ok(None),
        });
        let input_surface = match configured {
            Ok(surface) => surface,
            Err(e) => {
                codec.release();
                return Err(e);
            }
        };

        debug!(
            "Configured {} ({:?}-fed) for {} color {}",
            config.encoder_name, mode, quality, format.color_format
        );

        Ok(Self {
            name: config.encoder_name.clone(),
            codec: Arc::new(Mutex::new(codec)),
            config: config.clone(),
            quality,
            mode,
            input_surface,
            running: Arc::new(AtomicBool::new(false)),
            started: false,
            released: false,
        })
    }

    /// Open and start in one step
    pub fn launch(
        provider: &dyn CodecProvider,
        config: &EncoderConfig,
        quality: QualityDescriptor,
        mode: FeedMode,
    ) -> Result<Self> {
        let mut session = Self::open(provider, config, quality, mode)?;
        session.start()?;
        Ok(session)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.released {
            return Err(AppError::IllegalState(format!(
                "Encoder {} already released",
                self.name
            )));
        }
        if self.started {
            return Err(AppError::IllegalState(format!(
                "Encoder {} already started",
                self.name
            )));
        }
        self.codec.lock().start()?;
        self.started = true;
        self.running.store(true, Ordering::SeqCst);
        info!("Encoder {} started ({:?}-fed, {})", self.name, self.mode, self.quality);
        Ok(())
    }

    /// Stop encoding; a stopped session stays stopped
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.codec.lock().stop() {
            warn!("Failed to stop encoder {}: {}", self.name, e);
        }
        info!("Encoder {} stopped", self.name);
    }

    /// Stop if needed and free the codec
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.stop();
        self.codec.lock().release();
        self.released = true;
        debug!("Encoder {} released", self.name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn quality(&self) -> QualityDescriptor {
        self.quality
    }

    pub fn mode(&self) -> FeedMode {
        self.mode
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Input surface of a surface-fed session
    pub fn input_surface(&self) -> Option<&Surface> {
        self.input_surface.as_ref()
    }

    /// Direct codec access for buffer-fed sessions
    pub fn with_codec<R>(&self, f: impl FnOnce(&mut dyn HardwareCodec) -> R) -> Result<R> {
        if self.mode != FeedMode::Buffer {
            return Err(AppError::IllegalState(format!(
                "Encoder {} is surface-fed",
                self.name
            )));
        }
        if !self.started {
            return Err(AppError::IllegalState(format!(
                "Encoder {} not started",
                self.name
            )));
        }
        let mut codec = self.codec.lock();
        Ok(f(codec.as_mut()))
    }

    /// Compressed output of a running surface-fed session
    pub fn output_stream(&self) -> Result<EncodedStream> {
        if self.mode != FeedMode::Surface || !self.started {
            return Err(AppError::IllegalState(format!(
                "Encoder {} has no live output",
                self.name
            )));
        }
        Ok(EncodedStream::new(
            self.name.clone(),
            self.codec.clone(),
            self.running.clone(),
        ))
    }
}

impl Drop for EncoderSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::encoder::registry::EncoderCapabilityResolver;
    use crate::video::encoder::traits::MIME_AVC;
    use crate::video::sim::SimCodecProvider;

    fn resolve(provider: &Arc<SimCodecProvider>) -> EncoderConfig {
        EncoderCapabilityResolver::new(provider.clone())
            .resolve(MIME_AVC, None)
            .unwrap()
    }

    #[test]
    fn test_double_start_is_an_error() {
        let provider = Arc::new(SimCodecProvider::new());
        let config = resolve(&provider);
        let mut session = EncoderSession::launch(
            provider.as_ref(),
            &config,
            QualityDescriptor::default(),
            FeedMode::Buffer,
        )
        .unwrap();
        assert!(session.is_started());
        assert!(matches!(session.start(), Err(AppError::IllegalState(_))));

        session.stop();
        session.stop();
        assert!(!session.is_started());
    }

    #[test]
    fn test_feed_modes_are_exclusive() {
        let provider = Arc::new(SimCodecProvider::new());
        let config = resolve(&provider);

        let buffer = EncoderSession::launch(
            provider.as_ref(),
            &config,
            QualityDescriptor::default(),
            FeedMode::Buffer,
        )
        .unwrap();
        assert!(buffer.input_surface().is_none());
        assert!(buffer.output_stream().is_err());
        assert!(buffer.with_codec(|codec| codec.name().to_string()).is_ok());

        let surface = EncoderSession::launch(
            provider.as_ref(),
            &config,
            QualityDescriptor::default(),
            FeedMode::Surface,
        )
        .unwrap();
        assert!(surface.input_surface().is_some());
        assert!(surface.output_stream().is_ok());
        assert!(surface.with_codec(|_| ()).is_err());
    }

    #[test]
    fn test_drop_releases_codec() {
        let provider = Arc::new(SimCodecProvider::new());
        let config = resolve(&provider);
        {
            let _session = EncoderSession::launch(
                provider.as_ref(),
                &config,
                QualityDescriptor::default(),
                FeedMode::Buffer,
            )
            .unwrap();
            assert_eq!(provider.live_codecs(), 1);
        }
        assert_eq!(provider.live_codecs(), 0);
    }
}
