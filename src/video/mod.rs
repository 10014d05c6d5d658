//! Camera capture and hardware encoding
//!
//! Cameras are reached through [`device::CameraBackend`], encoders through
//! [`encoder::traits::CodecProvider`]; [`pipeline::StreamPipeline`] drives
//! both and recovers the H.264 parameter sets a receiver needs up front.

pub mod capture;
pub mod device;
pub mod encoder;
pub mod format;
pub mod h264;
pub mod packetizer;
pub mod parameter_set;
pub mod pipeline;
pub mod quality;
pub mod sim;
pub mod surface;
pub mod synthetic;
pub mod v4l2;

pub use capture::{CaptureDevice, CaptureDeviceManager, DeviceNotification};
pub use device::{CameraBackend, CameraError, CameraHandle, CameraInfo, CameraParameters, Facing};
pub use format::{ColorFormat, PixelFormat, Resolution};
pub use packetizer::{AccessUnit, EncodedStream, Packetizer};
pub use parameter_set::{CodecParameterSet, ParameterSetRecord};
pub use pipeline::{PipelineState, StreamPipeline, StreamPipelineBuilder};
pub use quality::QualityDescriptor;
pub use surface::{PreviewTarget, Surface, SurfaceProvider};
pub use v4l2::{V4l2CameraBackend, V4l2DeviceInfo};
