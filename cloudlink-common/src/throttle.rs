//! Rate limiting for repeated fault logging.
//!
//! A link that loses its transport tends to hit the same fault on every
//! tick. [`ErrorThrottle`] lets the first occurrence of a fault class through
//! once per window and counts the rest.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Default throttle window.
pub const DEFAULT_THROTTLE_WINDOW: Duration = Duration::from_secs(60);

/// Fault class used as the throttle key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKey {
    /// Handshake refused or timed out.
    ConnectFailed,
    /// The peer answered with an error response.
    ReadError,
    /// The link was severed mid-operation.
    TransportBroken,
    /// The peer answered with something malformed or unexpected.
    ProtocolError,
    /// A single operation exceeded its time bound.
    Timeout,
    /// A payload could not be decoded (or encoded).
    DecodeError,
    /// Anything else.
    Unknown,
}

impl ErrorKey {
    /// Return the string name for this key.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKey::ConnectFailed => "connect-failed",
            ErrorKey::ReadError => "read-error",
            ErrorKey::TransportBroken => "transport-broken",
            ErrorKey::ProtocolError => "protocol-error",
            ErrorKey::Timeout => "timeout",
            ErrorKey::DecodeError => "decode-error",
            ErrorKey::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-key bookkeeping.
#[derive(Debug, Clone, Copy)]
struct ThrottleRecord {
    /// When this key was last allowed through.
    last_emit: Instant,
    /// Occurrences since `last_emit`, including the emitted one.
    occurrences: u64,
}

/// Suppresses repeated identical faults within a time window.
///
/// Owned by a single link; not shared.
#[derive(Debug)]
pub struct ErrorThrottle {
    window: Duration,
    records: HashMap<ErrorKey, ThrottleRecord>,
}

impl Default for ErrorThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE_WINDOW)
    }
}

impl ErrorThrottle {
    /// Create a throttle with the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            records: HashMap::new(),
        }
    }

    /// Record an occurrence of `key` now and decide whether to log it.
    pub fn should_emit(&mut self, key: ErrorKey) -> bool {
        self.should_emit_at(key, Instant::now())
    }

    /// Record an occurrence of `key` at `now` and decide whether to log it.
    ///
    /// Returns `true` for the first occurrence and for any occurrence more
    /// than one window after the last emitted one.
    pub fn should_emit_at(&mut self, key: ErrorKey, now: Instant) -> bool {
        match self.records.get_mut(&key) {
            Some(record) if now.saturating_duration_since(record.last_emit) <= self.window => {
                record.occurrences += 1;
                false
            }
            _ => {
                self.records.insert(
                    key,
                    ThrottleRecord {
                        last_emit: now,
                        occurrences: 1,
                    },
                );
                true
            }
        }
    }

    /// Occurrences of `key` counted in its current window (0 if never seen).
    pub fn occurrences(&self, key: ErrorKey) -> u64 {
        self.records.get(&key).map_or(0, |r| r.occurrences)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_occurrence_emits() {
        let mut throttle = ErrorThrottle::default();
        assert!(throttle.should_emit(ErrorKey::ConnectFailed));
        assert_eq!(throttle.occurrences(ErrorKey::ConnectFailed), 1);
    }

    #[test]
    fn test_repeat_within_window_is_suppressed() {
        let mut throttle = ErrorThrottle::new(Duration::from_secs(60));
        let start = Instant::now();

        let emitted = [
            throttle.should_emit_at(ErrorKey::ReadError, start),
            throttle.should_emit_at(ErrorKey::ReadError, start + Duration::from_secs(30)),
        ];

        assert_eq!(emitted.iter().filter(|e| **e).count(), 1);
        assert_eq!(throttle.occurrences(ErrorKey::ReadError), 2);
    }

    #[test]
    fn test_emits_again_after_window() {
        let mut throttle = ErrorThrottle::new(Duration::from_secs(60));
        let start = Instant::now();
        let at = |secs| start + Duration::from_secs(secs);

        assert!(throttle.should_emit_at(ErrorKey::TransportBroken, at(0)));
        assert!(!throttle.should_emit_at(ErrorKey::TransportBroken, at(1)));
        // Exactly one window later is still inside it.
        assert!(!throttle.should_emit_at(ErrorKey::TransportBroken, at(60)));
        assert_eq!(throttle.occurrences(ErrorKey::TransportBroken), 3);

        assert!(throttle.should_emit_at(ErrorKey::TransportBroken, at(61)));
        assert_eq!(throttle.occurrences(ErrorKey::TransportBroken), 1);
    }

    #[test]
    fn test_keys_are_independent() {
        let mut throttle = ErrorThrottle::default();
        let now = Instant::now();

        assert!(throttle.should_emit_at(ErrorKey::ReadError, now));
        assert!(throttle.should_emit_at(ErrorKey::DecodeError, now));
        assert!(!throttle.should_emit_at(ErrorKey::ReadError, now));
        assert_eq!(throttle.occurrences(ErrorKey::DecodeError), 1);
        assert_eq!(throttle.occurrences(ErrorKey::Unknown), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_follows_tokio_clock() {
        let mut throttle = ErrorThrottle::new(Duration::from_secs(60));

        assert!(throttle.should_emit(ErrorKey::Timeout));
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!throttle.should_emit(ErrorKey::Timeout));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(throttle.should_emit(ErrorKey::Timeout));
    }

    #[test]
    fn test_key_names() {
        assert_eq!(ErrorKey::ConnectFailed.to_string(), "connect-failed");
        assert_eq!(
            serde_json::to_string(&ErrorKey::TransportBroken).unwrap(),
            "\"transport-broken\""
        );
    }
}
