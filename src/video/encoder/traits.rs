//! Hardware codec traits and common types

use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;
use crate::video::format::ColorFormat;
use crate::video::surface::Surface;

/// MIME type of H.264 elementary streams
pub const MIME_AVC: &str = "video/avc";

/// Parameters passed to [`HardwareCodec::configure`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderFormat {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    /// Bits per second
    pub bitrate: u32,
    pub framerate: u32,
    pub color_format: ColorFormat,
    /// Seconds between key frames
    pub iframe_interval_secs: u32,
}

/// Flags attached to a queued or dequeued buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags {
    pub key_frame: bool,
    /// Buffer holds codec configuration (parameter sets) rather than media
    pub codec_config: bool,
    pub end_of_stream: bool,
}

/// Metadata of a dequeued output buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferInfo {
    pub offset: usize,
    pub size: usize,
    pub presentation_time_us: u64,
    pub flags: BufferFlags,
}

/// Result of polling the output side of a codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// Nothing ready within the timeout
    TryAgainLater,
    /// Output format changed; the configuration record is now readable
    FormatChanged,
    /// The set of output buffers was reallocated
    BuffersChanged,
    /// Output buffer `index` holds data
    Buffer { index: usize, info: BufferInfo },
}

/// Configuration record exposed after a format change
///
/// For H.264, `csd0` carries the SPS and `csd1` the PPS, usually each with a
/// leading Annex-B start code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputFormat {
    pub csd0: Option<Bytes>,
    pub csd1: Option<Bytes>,
}

/// A hardware encoder instance
///
/// Calls mirror the platform codec API: configure, optionally create an input
/// surface, start, exchange buffers, stop, release. Buffer calls are only
/// valid between `start` and `stop`.
pub trait HardwareCodec: Send {
    fn name(&self) -> &str;

    fn configure(&mut self, format: &EncoderFormat) -> Result<()>;

    /// Input surface for surface-fed encoding; valid after `configure`
    fn create_input_surface(&mut self) -> Result<Surface>;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Free the hardware; the codec is unusable afterwards
    fn release(&mut self);

    /// Index of a free input buffer, or `None` after `timeout`
    fn dequeue_input_buffer(&mut self, timeout: Duration) -> Result<Option<usize>>;

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8]>;

    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: u64,
        flags: BufferFlags,
    ) -> Result<()>;

    fn dequeue_output_buffer(&mut self, timeout: Duration) -> Result<OutputEvent>;

    /// Bytes `offset..offset + size` of output buffer `index`
    fn output_buffer(&self, index: usize, info: &BufferInfo) -> Result<Bytes>;

    fn release_output_buffer(&mut self, index: usize) -> Result<()>;

    fn output_format(&self) -> Result<OutputFormat>;
}

/// Capabilities of one codec on the device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecInfo {
    pub name: String,
    pub is_encoder: bool,
    pub supported_types: Vec<String>,
    /// Color formats per supported type, in the codec's preference order
    pub color_formats: HashMap<String, Vec<ColorFormat>>,
}

impl CodecInfo {
    pub fn encoder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_encoder: true,
            ..Default::default()
        }
    }

    pub fn with_type(mut self, mime: &str, color_formats: Vec<ColorFormat>) -> Self {
        self.supported_types.push(mime.to_string());
        self.color_formats.insert(mime.to_lowercase(), color_formats);
        self
    }

    /// Case-insensitive MIME type check
    pub fn supports_type(&self, mime: &str) -> bool {
        self.supported_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(mime))
    }

    pub fn color_formats(&self, mime: &str) -> &[ColorFormat] {
        self.color_formats
            .get(&mime.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Enumerates and instantiates codecs
pub trait CodecProvider: Send + Sync {
    fn codecs(&self) -> Vec<CodecInfo>;

    fn create_by_name(&self, name: &str) -> Result<Box<dyn HardwareCodec>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_info_type_lookup_ignores_case() {
        let info = CodecInfo::encoder("OMX.qcom.video.encoder.avc")
            .with_type("Video/AVC", vec![ColorFormat::Yuv420SemiPlanar]);
        assert!(info.supports_type(MIME_AVC));
        assert!(!info.supports_type("video/hevc"));
        assert_eq!(info.color_formats("video/avc"), &[ColorFormat::Yuv420SemiPlanar]);
        assert!(info.color_formats("video/hevc").is_empty());
    }
}
