use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::video::encoder::probe::DEFAULT_PROBE_BUDGET;
use crate::video::encoder::registry::DEFAULT_IFRAME_INTERVAL_SECS;
use crate::video::encoder::traits::MIME_AVC;
use crate::video::quality::QualityDescriptor;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Capture and encoding pipeline settings
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()
    }
}

/// Capture → encode pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Encoded stream MIME type
    pub mime_type: String,
    /// Encoder to use; the first capable one when unset
    pub preferred_encoder: Option<String>,
    /// Seconds between key frames
    pub iframe_interval_secs: u32,
    /// Time allowed for recovering parameter sets (ms)
    pub probe_budget_ms: u64,
    /// Quality used until the caller asks for another
    pub default_quality: QualityDescriptor,
    /// Preview rotation in degrees (0, 90, 180, 270)
    pub preview_orientation: u32,
    /// Store every successfully probed parameter set
    pub persist_parameter_sets: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mime_type: MIME_AVC.to_string(),
            preferred_encoder: None,
            iframe_interval_secs: DEFAULT_IFRAME_INTERVAL_SECS,
            probe_budget_ms: DEFAULT_PROBE_BUDGET.as_millis() as u64,
            default_quality: QualityDescriptor::default(),
            preview_orientation: 0,
            persist_parameter_sets: true,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mime_type.trim().is_empty() {
            return Err(AppError::Config("MIME type must not be empty".to_string()));
        }
        if self.iframe_interval_secs == 0 {
            return Err(AppError::Config(
                "Key-frame interval must be positive".to_string(),
            ));
        }
        if self.probe_budget_ms == 0 {
            return Err(AppError::Config("Probe budget must be positive".to_string()));
        }
        if self.preview_orientation % 90 != 0 || self.preview_orientation >= 360 {
            return Err(AppError::Config(format!(
                "Invalid preview orientation {}",
                self.preview_orientation
            )));
        }
        self.default_quality.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.mime_type, "video/avc");
        assert_eq!(config.iframe_interval_secs, 15);
        assert_eq!(config.probe_budget_ms, 3000);
        assert_eq!(
            config.default_quality,
            QualityDescriptor::new(176, 144, 20, 500_000)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"pipeline":{"preview_orientation":90}}"#).unwrap();
        assert_eq!(config.pipeline.preview_orientation, 90);
        assert_eq!(config.pipeline.mime_type, "video/avc");
    }

    #[test]
    fn test_validation_errors() {
        let mut config = PipelineConfig::default();
        config.mime_type = " ".to_string();
        assert!(matches!(config.validate(), Err(AppError::Config(_))));

        let mut config = PipelineConfig::default();
        config.default_quality.framerate = 0;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));

        let mut config = PipelineConfig::default();
        config.preview_orientation = 45;
        assert!(config.validate().is_err());
    }
}
