//! Encoder capability resolution
//!
//! Enumerates the codecs a [`CodecProvider`] offers and picks one encoder and
//! one input color format the pipeline knows how to feed.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::traits::{CodecInfo, CodecProvider};
use crate::error::{AppError, Result};
use crate::video::format::ColorFormat;

/// Default seconds between key frames
pub const DEFAULT_IFRAME_INTERVAL_SECS: u32 = 15;

/// Silicon vendor behind an encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderVendor {
    Qualcomm,
    Exynos,
    Nvidia,
    Ti,
    Intel,
    MediaTek,
    /// Platform software encoder
    Software,
    Unknown,
}

impl EncoderVendor {
    /// Detect vendor from codec name
    pub fn from_codec_name(name: &str) -> Self {
        let name = name.to_lowercase();
        if name.contains(".qcom.") || name.contains(".qti.") {
            EncoderVendor::Qualcomm
        } else if name.contains(".exynos.") || name.contains(".sec.") {
            EncoderVendor::Exynos
        } else if name.contains(".nvidia.") {
            EncoderVendor::Nvidia
        } else if name.contains(".ti.") {
            EncoderVendor::Ti
        } else if name.contains(".intel.") {
            EncoderVendor::Intel
        } else if name.contains(".mtk.") {
            EncoderVendor::MediaTek
        } else if name.starts_with("omx.google.") || name.starts_with("c2.android.") {
            EncoderVendor::Software
        } else {
            EncoderVendor::Unknown
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, EncoderVendor::Software)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            EncoderVendor::Qualcomm => "Qualcomm",
            EncoderVendor::Exynos => "Exynos",
            EncoderVendor::Nvidia => "Nvidia",
            EncoderVendor::Ti => "TI",
            EncoderVendor::Intel => "Intel",
            EncoderVendor::MediaTek => "MediaTek",
            EncoderVendor::Software => "Software",
            EncoderVendor::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for EncoderVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Information about an encoder able to produce a MIME type
#[derive(Debug, Clone)]
pub struct AvailableEncoder {
    pub name: String,
    pub vendor: EncoderVendor,
    /// Color formats advertised for the MIME type
    pub color_formats: Vec<ColorFormat>,
}

impl AvailableEncoder {
    /// `None` unless `info` is an encoder supporting `mime`
    pub fn from_codec_info(info: &CodecInfo, mime: &str) -> Option<Self> {
        if !info.is_encoder || !info.supports_type(mime) {
            return None;
        }
        Some(Self {
            name: info.name.clone(),
            vendor: EncoderVendor::from_codec_name(&info.name),
            color_formats: info.color_formats(mime).to_vec(),
        })
    }

    /// First advertised color format the frame generator can fill
    pub fn first_recognized_format(&self) -> Option<ColorFormat> {
        self.color_formats.iter().copied().find(|f| f.is_recognized())
    }
}

/// Encoder choice for one MIME type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderConfig {
    pub mime: String,
    pub color_format: ColorFormat,
    /// Seconds between key frames
    pub iframe_interval_secs: u32,
    /// Codec name to instantiate
    pub encoder_name: String,
    pub vendor: EncoderVendor,
}

/// Picks an encoder and input color format
pub struct EncoderCapabilityResolver {
    provider: Arc<dyn CodecProvider>,
    iframe_interval_secs: u32,
}

impl EncoderCapabilityResolver {
    pub fn new(provider: Arc<dyn CodecProvider>) -> Self {
        Self {
            provider,
            iframe_interval_secs: DEFAULT_IFRAME_INTERVAL_SECS,
        }
    }

    pub fn with_iframe_interval(mut self, secs: u32) -> Self {
        self.iframe_interval_secs = secs;
        self
    }

    pub fn provider(&self) -> &Arc<dyn CodecProvider> {
        &self.provider
    }

    /// All encoders supporting `mime`, in enumeration order
    pub fn available_encoders(&self, mime: &str) -> Vec<AvailableEncoder> {
        self.provider
            .codecs()
            .iter()
            .filter_map(|info| AvailableEncoder::from_codec_info(info, mime))
            .collect()
    }

    /// Resolve the encoder for `mime`
    ///
    /// With a preferred name only that encoder is accepted; otherwise the first
    /// capable encoder wins. The first recognized color format of the chosen
    /// encoder is used.
    pub fn resolve(&self, mime: &str, preferred: Option<&str>) -> Result<EncoderConfig> {
        let encoders = self.available_encoders(mime);
        for encoder in &encoders {
            debug!(
                "Encoder candidate: {} ({}) formats {:?}",
                encoder.name, encoder.vendor, encoder.color_formats
            );
        }

        let encoder = match preferred {
            Some(name) => encoders.iter().find(|e| e.name == name).ok_or_else(|| {
                AppError::UnsupportedConfiguration(format!(
                    "Encoder {} does not support {}",
                    name, mime
                ))
            })?,
            None => encoders.first().ok_or_else(|| {
                AppError::UnsupportedConfiguration(format!("No encoder for {}", mime))
            })?,
        };

        let color_format = encoder.first_recognized_format().ok_or_else(|| {
            warn!(
                "Encoder {} offers no usable color format: {:?}",
                encoder.name, encoder.color_formats
            );
            AppError::UnsupportedConfiguration(format!(
                "Encoder {} has no supported color format for {}",
                encoder.name, mime
            ))
        })?;

        info!(
            "Resolved encoder {} ({}) for {} with color format {}",
            encoder.name, encoder.vendor, mime, color_format
        );

        Ok(EncoderConfig {
            mime: mime.to_string(),
            color_format,
            iframe_interval_secs: self.iframe_interval_secs,
            encoder_name: encoder.name.clone(),
            vendor: encoder.vendor,
        })
    }
}
