use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Capture device already held by another process, or the worker failed to acquire it
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// No renderable target attached, or the target is not ready yet
    #[error("Invalid surface: {0}")]
    InvalidSurface(String),

    /// No encoder / color format pair satisfies the request on this device
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Parameter sets were not recovered within the probe budget
    #[error("Configuration timeout after {elapsed_ms}ms: {reason}")]
    ConfigurationTimeout { elapsed_ms: u64, reason: String },

    /// Asynchronous device death, always followed by a forced teardown
    #[error("Hardware failure [{device}]: {reason}")]
    HardwareFailure { device: String, reason: String },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Any other encoder call failure
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Short machine-readable kind, used in published events
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::DeviceUnavailable(_) => "device_unavailable",
            AppError::InvalidSurface(_) => "invalid_surface",
            AppError::UnsupportedConfiguration(_) => "unsupported_configuration",
            AppError::ConfigurationTimeout { .. } => "configuration_timeout",
            AppError::HardwareFailure { .. } => "hardware_failure",
            AppError::IllegalState(_) => "illegal_state",
            AppError::Codec(_) => "codec",
            AppError::Config(_) => "config",
            AppError::Database(_) => "database",
            AppError::Io(_) => "io",
            AppError::Serialization(_) => "serialization",
            AppError::Internal(_) => "internal",
        }
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
