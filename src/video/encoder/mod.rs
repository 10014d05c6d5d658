//! Hardware encoder access
//!
//! - `traits`: the codec interface every platform encoder implements
//! - `registry`: encoder and color-format selection for a MIME type
//! - `session`: a configured encoder, surface-fed or buffer-fed
//! - `probe`: parameter-set recovery with synthetic frames

pub mod probe;
pub mod registry;
pub mod session;
pub mod traits;

pub use probe::{CodecConfigProbe, ParameterSetCollector, DEFAULT_PROBE_BUDGET};
pub use registry::{AvailableEncoder, EncoderCapabilityResolver, EncoderConfig, EncoderVendor};
pub use session::{EncoderSession, FeedMode};
pub use traits::{CodecInfo, CodecProvider, EncoderFormat, HardwareCodec, OutputEvent, MIME_AVC};
