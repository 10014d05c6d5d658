//! camcast - camera capture to hardware H.264 encoding
//!
//! This crate owns the capture device on a dedicated worker, negotiates a
//! hardware encoder, and recovers the SPS/PPS parameter sets that describe
//! the encoded stream before the first packet leaves.

pub mod config;
pub mod error;
pub mod events;
pub mod utils;
pub mod video;

pub use error::{AppError, Result};
