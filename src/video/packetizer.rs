//! Hand-off of the compressed stream to the downstream packetizer

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::encoder::session::SharedCodec;
use super::encoder::traits::OutputEvent;
use super::h264;
use super::parameter_set::CodecParameterSet;
use crate::error::{AppError, Result};

/// One encoded access unit in Annex-B form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    pub data: Bytes,
    /// Presentation timestamp in µs
    pub pts_us: u64,
    pub key_frame: bool,
}

/// Compressed output of a running surface-fed encoder
///
/// Ends when the owning session stops.
pub struct EncodedStream {
    encoder: String,
    codec: SharedCodec,
    running: Arc<AtomicBool>,
}

impl EncodedStream {
    pub(crate) fn new(encoder: String, codec: SharedCodec, running: Arc<AtomicBool>) -> Self {
        Self {
            encoder,
            codec,
            running,
        }
    }

    pub fn encoder(&self) -> &str {
        &self.encoder
    }

    pub fn is_open(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Next access unit, or `None` if nothing arrives within `timeout`
    ///
    /// Codec-config buffers are skipped: the parameter sets travel out of band.
    /// Fails with `IllegalState` once the session has stopped.
    pub fn next_access_unit(&mut self, timeout: Duration) -> Result<Option<AccessUnit>> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_open() {
                return Err(AppError::IllegalState(format!(
                    "Encoder {} stopped",
                    self.encoder
                )));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut codec = self.codec.lock();
            match codec.dequeue_output_buffer(remaining)? {
                OutputEvent::TryAgainLater => return Ok(None),
                OutputEvent::FormatChanged | OutputEvent::BuffersChanged => {
                    debug!("Output of {} changed", self.encoder);
                }
                OutputEvent::Buffer { index, info } => {
                    let data = codec.output_buffer(index, &info);
                    codec.release_output_buffer(index)?;
                    let data = data?;
                    if info.flags.codec_config {
                        trace!("Skipping codec config buffer ({} bytes)", data.len());
                    } else if !data.is_empty() {
                        let key_frame = info.flags.key_frame || h264::is_keyframe(&data);
                        return Ok(Some(AccessUnit {
                            data,
                            pts_us: info.presentation_time_us,
                            key_frame,
                        }));
                    }
                }
            }
            drop(codec);

            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }
}

/// Consumer that turns the elementary stream into network packets
///
/// Driven in lockstep with the surface-fed encoder session: parameters and
/// input are handed over before `start`, and `stop` precedes the session stop.
pub trait Packetizer: Send {
    /// Out-of-band codec configuration for the session description
    fn set_stream_parameters(&mut self, params: &CodecParameterSet);

    fn set_input_stream(&mut self, stream: EncodedStream);

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self);
}
