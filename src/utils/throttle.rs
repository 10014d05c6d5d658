//! Log throttling utility
//!
//! Limits how often the same message is recorded, so polling loops that hit
//! the same condition every few milliseconds do not flood the log.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Log throttler that limits how often the same message is logged
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use camcast::utils::LogThrottler;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
///
/// assert!(throttler.should_log("no_input_slot"));
/// assert!(!throttler.should_log("no_input_slot"));
/// ```
pub struct LogThrottler {
    last_logged: RwLock<HashMap<String, Instant>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: RwLock::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` if the message for `key` should be logged now.
    ///
    /// A `true` result records the current instant for the key.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();

        if let Some(last) = self.last_logged.read().get(key) {
            if now.duration_since(*last) < self.interval {
                return false;
            }
        }

        let mut map = self.last_logged.write();
        if let Some(last) = map.get(key) {
            if now.duration_since(*last) < self.interval {
                return false;
            }
        }
        map.insert(key.to_string(), now);
        true
    }

    /// Forget a key so the next occurrence is logged immediately
    pub fn clear(&self, key: &str) {
        self.last_logged.write().remove(key);
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Throttled `debug!` logging keyed by a static string
#[macro_export]
macro_rules! debug_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::debug!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttles_within_interval() {
        let throttler = LogThrottler::new(Duration::from_secs(60));
        assert!(throttler.should_log("a"));
        assert!(!throttler.should_log("a"));
        assert!(throttler.should_log("b"));
    }

    #[test]
    fn test_clear_resets_key() {
        let throttler = LogThrottler::new(Duration::from_secs(60));
        assert!(throttler.should_log("a"));
        throttler.clear("a");
        assert!(throttler.should_log("a"));
    }

    #[test]
    fn test_zero_interval_never_throttles() {
        let throttler = LogThrottler::new(Duration::ZERO);
        assert!(throttler.should_log("a"));
        assert!(throttler.should_log("a"));
    }
}
