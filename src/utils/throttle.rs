//! Log throttling for hot-path diagnostics
//!
//! Backpressure and device-wait messages can repeat for every buffer. The
//! throttler lets one message per key through per interval and counts the
//! ones it swallowed, so the next message that gets through can report them.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry {
    last: Instant,
    suppressed: u64,
}

/// Limits how often the same message is logged
///
/// # Example
///
/// ```rust
/// use m2m_codec::utils::LogThrottler;
/// use std::time::Duration;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
///
/// assert_eq!(throttler.check("no_free_slot"), Some(0));
/// assert_eq!(throttler.check("no_free_slot"), None);
/// ```
#[derive(Debug)]
pub struct LogThrottler {
    entries: Mutex<HashMap<&'static str, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns the number of messages suppressed since the last one logged
    /// for `key`, or `None` if this one should be suppressed as well.
    pub fn check(&self, key: &'static str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                entry.last = now;
                entry.suppressed = 0;
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key,
                    Entry {
                        last: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    pub fn should_log(&self, key: &'static str) -> bool {
        self.check(key).is_some()
    }

    /// Forget `key`, so the next occurrence is logged immediately
    pub fn clear(&self, key: &'static str) {
        self.entries.lock().remove(key);
    }

    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `warn!`, appending how many repeats were dropped
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::warn!("{} ({} similar messages suppressed)", format_args!($($arg)*), suppressed);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

/// Throttled `debug!`, appending how many repeats were dropped
#[macro_export]
macro_rules! debug_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::debug!("{} ({} similar messages suppressed)", format_args!($($arg)*), suppressed);
            } else {
                tracing::debug!($($arg)*);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_suppressed_count() {
        let throttler = LogThrottler::new(Duration::from_millis(50));

        assert_eq!(throttler.check("backpressure"), Some(0));
        assert_eq!(throttler.check("backpressure"), None);
        assert_eq!(throttler.check("backpressure"), None);

        sleep(Duration::from_millis(60));
        assert_eq!(throttler.check("backpressure"), Some(2));
        assert_eq!(throttler.check("backpressure"), None);
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(60);
        assert!(throttler.should_log("a"));
        assert!(throttler.should_log("b"));
        assert!(!throttler.should_log("a"));
    }

    #[test]
    fn test_clear() {
        let throttler = LogThrottler::with_secs(60);
        assert!(throttler.should_log("a"));
        throttler.clear("a");
        assert!(throttler.should_log("a"));
        assert!(throttler.should_log("b"));
        throttler.clear_all();
        assert!(throttler.should_log("b"));
    }

    #[test]
    fn test_macro_compiles() {
        let throttler = LogThrottler::default();
        warn_throttled!(throttler, "slot", "No free slot on {}", "sim0");
        debug_throttled!(throttler, "slot", "No free slot on {}", "sim0");
    }
}
