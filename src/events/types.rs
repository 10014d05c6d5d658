//! Pipeline event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

use crate::video::pipeline::PipelineState;
use crate::video::quality::QualityDescriptor;

/// Pipeline event
///
/// All events are tagged with their event name for serialization.
/// The `serde(tag = "event", content = "data")` attribute creates a
/// JSON structure like:
/// ```json
/// {
///   "event": "pipeline.state_changed",
///   "data": { "from": "configured", "to": "streaming" }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PipelineEvent {
    /// Lifecycle state changed
    #[serde(rename = "pipeline.state_changed")]
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },

    /// Encoder resolved and parameter sets recovered
    #[serde(rename = "pipeline.configured")]
    Configured {
        encoder: String,
        /// Encoder vendor, e.g. "Qualcomm"
        vendor: String,
        /// Input color format used while probing
        color_format: String,
        quality: QualityDescriptor,
        profile_level_id: String,
        /// `base64(SPS),base64(PPS)`
        sprop_parameter_sets: String,
    },

    /// Camera preview running
    #[serde(rename = "pipeline.preview_started")]
    PreviewStarted {
        camera: String,
        /// Chosen preview size (width, height)
        resolution: (u32, u32),
        orientation: u32,
    },

    /// Surface-fed encoder running and handed to the packetizer
    #[serde(rename = "pipeline.streaming_started")]
    StreamingStarted {
        encoder: String,
        quality: QualityDescriptor,
    },

    /// Encoding stopped
    #[serde(rename = "pipeline.stopped")]
    Stopped {
        /// Whether the camera was released (automatic ownership)
        device_released: bool,
    },

    /// Camera died; the pipeline has been torn down
    #[serde(rename = "pipeline.hardware_failure")]
    HardwareFailure {
        device: String,
        reason: String,
    },

    /// A pipeline operation failed
    #[serde(rename = "pipeline.error")]
    Error {
        /// Operation name, e.g. "configure"
        operation: String,
        /// Error kind, e.g. "configuration_timeout"
        kind: String,
        message: String,
    },
}

impl PipelineEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "pipeline.state_changed",
            Self::Configured { .. } => "pipeline.configured",
            Self::PreviewStarted { .. } => "pipeline.preview_started",
            Self::StreamingStarted { .. } => "pipeline.streaming_started",
            Self::Stopped { .. } => "pipeline.stopped",
            Self::HardwareFailure { .. } => "pipeline.hardware_failure",
            Self::Error { .. } => "pipeline.error",
        }
    }

    /// Check if event name matches a topic pattern
    ///
    /// Supports wildcards:
    /// - `*` matches all events
    /// - `pipeline.*` matches all pipeline events
    /// - `pipeline.state_changed` matches exact event
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if topic.ends_with(".*") {
            let prefix = topic.trim_end_matches(".*");
            event_name.starts_with(prefix)
        } else {
            event_name == topic
        }
    }
}
