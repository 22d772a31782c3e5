//! Log throttling
//!
//! Limits how often the same non-fatal condition is logged. A flood of
//! malformed probe echoes or dropped frames produces one line per interval,
//! carrying the number of occurrences swallowed since the previous line.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

struct Entry {
    last_logged: Instant,
    suppressed: u64,
}

/// Per-key log rate limiter
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
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

    /// Check whether a line for `key` should be emitted now.
    ///
    /// Returns `Some(n)` when it should, `n` being the number of occurrences
    /// suppressed since the last emitted line, and `None` when throttled.
    pub fn admit(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                entry.last_logged = now;
                entry.suppressed = 0;
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }
}

/// Throttled `warn!`. Appends the suppressed count when there is one.
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.admit($key) {
            if suppressed > 0 {
                tracing::warn!("{} ({} similar suppressed)", format!($($arg)*), suppressed);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_throttling() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert_eq!(throttler.admit("decode"), Some(0));
        assert_eq!(throttler.admit("decode"), None);
        assert_eq!(throttler.admit("decode"), None);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(throttler.admit("decode"), Some(2));
        assert_eq!(throttler.admit("decode"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);
        assert_eq!(throttler.admit("key1"), Some(0));
        assert_eq!(throttler.admit("key2"), Some(0));
        assert_eq!(throttler.admit("key1"), None);
        assert_eq!(throttler.admit("key2"), None);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(throttler.admit("key1"), Some(1));
        assert_eq!(throttler.admit("key2"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_macro_expands() {
        let throttler = LogThrottler::with_secs(5);
        warn_throttled!(throttler, "macro", "value {}", 1);
        warn_throttled!(throttler, "macro", "value {}", 2);
        tokio::time::advance(Duration::from_secs(5)).await;
        warn_throttled!(throttler, "macro", "value {}", 3);
        assert_eq!(throttler.admit("macro"), None);
    }
}
