//! Utility modules shared by the capture and encoder code

pub mod throttle;

pub use throttle::LogThrottler;
