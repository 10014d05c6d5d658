//! Parameter-set extraction by probing the encoder
//!
//! The probe runs a throwaway buffer-fed session and feeds it synthetic frames
//! until the encoder has revealed both H.264 parameter sets. Encoders disagree
//! on how they do that:
//!
//! - most report an output format change carrying `csd-0` (SPS) and `csd-1`
//!   (PPS), each with a leading start code;
//! - some only emit the sets in-band as ordinary Annex-B output, in either
//!   order and sometimes glued to the first slice.
//!
//! Both paths feed one [`ParameterSetCollector`]; in-band units are classified
//! by NAL type, never by position.

use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::registry::EncoderConfig;
use super::session::{EncoderSession, FeedMode};
use super::traits::{BufferFlags, CodecProvider, HardwareCodec, OutputEvent, OutputFormat};
use crate::debug_throttled;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::video::h264::{self, NalUnitType};
use crate::video::parameter_set::CodecParameterSet;
use crate::video::quality::QualityDescriptor;
use crate::video::synthetic;

/// Default time allowed for recovering the parameter sets
pub const DEFAULT_PROBE_BUDGET: Duration = Duration::from_secs(3);

/// Accumulates SPS and PPS from whichever path delivers them first
#[derive(Debug, Default)]
pub struct ParameterSetCollector {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

impl ParameterSetCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Structured path: read `csd-0`/`csd-1` after a format change
    ///
    /// Both entries must be present and well-formed; otherwise nothing is
    /// recorded and probing goes on.
    pub fn offer_format(&mut self, format: &OutputFormat) -> bool {
        let (Some(csd0), Some(csd1)) = (&format.csd0, &format.csd1) else {
            debug!(
                "Format change without full configuration record (csd-0: {}, csd-1: {})",
                format.csd0.is_some(),
                format.csd1.is_some()
            );
            return false;
        };

        let sps = Bytes::copy_from_slice(h264::strip_start_code(csd0));
        let pps = Bytes::copy_from_slice(h264::strip_start_code(csd1));
        if let Err(e) = CodecParameterSet::new(sps.clone(), pps.clone()) {
            warn!("Ignoring malformed configuration record: {}", e);
            return false;
        }
        self.sps = Some(sps);
        self.pps = Some(pps);
        true
    }

    /// Unstructured path: scan one output buffer as Annex-B
    ///
    /// Units are classified by `header & 0x1F`; anything other than SPS or PPS
    /// is ignored. A set already captured is kept.
    pub fn scan(&mut self, data: &[u8]) {
        for nal in h264::nal_units(data) {
            match NalUnitType::from_header(nal[0]) {
                NalUnitType::Sps if self.sps.is_none() => {
                    if h264::parse_profile_level_id(nal).is_some() {
                        debug!("Found SPS in-band ({} bytes)", nal.len());
                        self.sps = Some(Bytes::copy_from_slice(nal));
                    } else {
                        debug!("Skipping truncated SPS ({} bytes)", nal.len());
                    }
                }
                NalUnitType::Pps if self.pps.is_none() => {
                    debug!("Found PPS in-band ({} bytes)", nal.len());
                    self.pps = Some(Bytes::copy_from_slice(nal));
                }
                _ => {}
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    /// Which sets are still missing, for error reports
    pub fn missing(&self) -> &'static str {
        match (self.sps.is_some(), self.pps.is_some()) {
            (false, false) => "SPS and PPS",
            (false, true) => "SPS",
            (true, false) => "PPS",
            (true, true) => "nothing",
        }
    }

    /// Both sets, or `None`; never a partial result
    pub fn into_parameter_set(self) -> Option<CodecParameterSet> {
        match (self.sps, self.pps) {
            (Some(sps), Some(pps)) => CodecParameterSet::new(sps, pps).ok(),
            _ => None,
        }
    }
}

/// Recovers the parameter sets of an encoder configuration
pub struct CodecConfigProbe {
    provider: Arc<dyn CodecProvider>,
    budget: Duration,
}

impl CodecConfigProbe {
    pub fn new(provider: Arc<dyn CodecProvider>) -> Self {
        Self {
            provider,
            budget: DEFAULT_PROBE_BUDGET,
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Run the probe; blocks for at most the budget plus one poll interval
    pub fn probe(
        &self,
        config: &EncoderConfig,
        quality: QualityDescriptor,
    ) -> Result<CodecParameterSet> {
        let started = Instant::now();
        let poll = Duration::from_micros(quality.frame_interval_us());
        info!(
            "Probing {} for parameter sets at {} (budget {}ms)",
            config.encoder_name,
            quality,
            self.budget.as_millis()
        );

        // Dropping the session releases the codec on every path
        let mut session =
            EncoderSession::launch(self.provider.as_ref(), config, quality, FeedMode::Buffer)?;

        let mut feeder = FrameFeeder::new(config, quality);
        let mut collector = ParameterSetCollector::new();
        let throttler = LogThrottler::with_secs(1);

        while started.elapsed() < self.budget && !collector.is_complete() {
            session.with_codec(|codec| -> Result<()> {
                feeder.feed(codec, poll, &throttler)?;
                drain_output(codec, poll, &mut collector, &throttler)
            })??;
        }

        let elapsed = started.elapsed();
        let frames = feeder.frame_index;
        session.release();

        let missing = collector.missing();
        match collector.into_parameter_set() {
            Some(params) => {
                info!(
                    "Parameter sets for {} found after {}ms and {} frames: profile-level-id {}",
                    config.encoder_name,
                    elapsed.as_millis(),
                    frames,
                    params.profile_level_id()
                );
                Ok(params)
            }
            None => {
                warn!(
                    "Probe of {} timed out after {}ms and {} frames, missing {}",
                    config.encoder_name,
                    elapsed.as_millis(),
                    frames,
                    missing
                );
                Err(AppError::ConfigurationTimeout {
                    elapsed_ms: elapsed.as_millis() as u64,
                    reason: format!("{} never produced {}", config.encoder_name, missing),
                })
            }
        }
    }
}

/// Input side of the probe: synthetic frames with increasing timestamps
struct FrameFeeder {
    frame: Vec<u8>,
    frame_index: u64,
    config: EncoderConfig,
    quality: QualityDescriptor,
}

impl FrameFeeder {
    fn new(config: &EncoderConfig, quality: QualityDescriptor) -> Self {
        Self {
            frame: vec![0; quality.resolution().yuv420_frame_size()],
            frame_index: 0,
            config: config.clone(),
            quality,
        }
    }

    fn feed(
        &mut self,
        codec: &mut dyn HardwareCodec,
        timeout: Duration,
        throttler: &LogThrottler,
    ) -> Result<()> {
        let Some(index) = codec.dequeue_input_buffer(timeout)? else {
            debug_throttled!(throttler, "no_input_slot", "No input buffer available");
            return Ok(());
        };

        synthetic::generate_frame(
            self.frame_index,
            self.config.color_format,
            &mut self.frame,
            self.quality.width,
            self.quality.height,
        )?;

        let input = codec.input_buffer(index)?;
        if input.len() < self.frame.len() {
            return Err(AppError::Codec(format!(
                "Input buffer too small: {} < {} bytes",
                input.len(),
                self.frame.len()
            )));
        }
        input[..self.frame.len()].copy_from_slice(&self.frame);

        let pts = synthetic::presentation_time_us(self.frame_index, self.quality.framerate);
        codec.queue_input_buffer(index, self.frame.len(), pts, BufferFlags::default())?;
        self.frame_index += 1;
        Ok(())
    }
}

fn drain_output(
    codec: &mut dyn HardwareCodec,
    timeout: Duration,
    collector: &mut ParameterSetCollector,
    throttler: &LogThrottler,
) -> Result<()> {
    match codec.dequeue_output_buffer(timeout)? {
        OutputEvent::TryAgainLater => {
            debug_throttled!(throttler, "no_output", "No output available yet");
        }
        OutputEvent::FormatChanged => {
            let format = codec.output_format()?;
            if collector.offer_format(&format) {
                debug!("Parameter sets read from output format");
            }
        }
        OutputEvent::BuffersChanged => {
            debug!("Output buffers changed");
        }
        OutputEvent::Buffer { index, info } => {
            let data = codec.output_buffer(index, &info);
            codec.release_output_buffer(index)?;
            collector.scan(&data?);
        }
    }
    Ok(())
}
