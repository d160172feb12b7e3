//! Next-run offsets after success, failure and shutdown.
//!
//! All functions are pure apart from the random draw in the jittered
//! variants; the acquisition service feeds them the current time, the
//! deadline score and the failure streak.

use std::fmt;
use std::time::Duration;

use rand::RngExt;

use crate::error::ExecutionError;

use super::agent::Interval;
use super::config::{FailureBackoffConfig, ThrottledBackoffConfig};

/// Coarse failure category that selects the backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Network or I/O hiccup; retried quickly.
    Transient,
    /// HTTP 403; retrying soon will not help.
    PermanentForbidden,
    /// Rate limiting; backs off exponentially.
    Throttled,
    /// HTTP 5xx.
    ServerError,
    Unknown,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::PermanentForbidden => "permanent_forbidden",
            FailureClass::Throttled => "throttled",
            FailureClass::ServerError => "server_error",
            FailureClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn mentions_throttling(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("throttl") || lower.contains("rate exceeded") || lower.contains("too many requests")
}

/// Maps an execution failure to its class.
pub fn classify_failure(error: &ExecutionError) -> FailureClass {
    match error {
        ExecutionError::Io(_) | ExecutionError::Timeout(_) => FailureClass::Transient,
        ExecutionError::Http { status, message } => {
            if mentions_throttling(message) {
                return FailureClass::Throttled;
            }
            match *status {
                403 => FailureClass::PermanentForbidden,
                429 => FailureClass::Throttled,
                500..=599 => FailureClass::ServerError,
                _ => FailureClass::Unknown,
            }
        }
        ExecutionError::Panicked(message) | ExecutionError::Other(message) => {
            if mentions_throttling(message) {
                FailureClass::Throttled
            } else {
                FailureClass::Unknown
            }
        }
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Offset that keeps the agent on its cadence: the next run is due one
/// interval after the original acquisition, `deadline - timeout`.
///
/// Without a deadline the plain interval is used.
pub fn cadence_offset_ms(interval: &Interval, deadline_s: Option<i64>, now_ms: i64) -> i64 {
    match deadline_s {
        Some(deadline) => {
            let acquired_ms = deadline * 1000 - millis(interval.timeout);
            (acquired_ms + millis(interval.interval) - now_ms).max(0)
        }
        None => millis(interval.interval),
    }
}

/// `base × multiplier^(streak − 1)`, capped.
pub fn exponential_backoff_ms(config: &ThrottledBackoffConfig, streak: u32) -> i64 {
    let base = millis(config.base) as f64;
    let cap = millis(config.cap);
    let exponent = streak.saturating_sub(1).min(i32::MAX as u32) as i32;
    let raw = (base * config.multiplier.powi(exponent)).round();
    if !raw.is_finite() || raw >= cap as f64 {
        cap
    } else {
        (raw as i64).max(0)
    }
}

/// Failure offset before jitter, by class and streak.
pub fn failure_base_offset_ms(
    config: &FailureBackoffConfig,
    interval: &Interval,
    class: FailureClass,
    streak: u32,
) -> i64 {
    let error_interval = millis(interval.error_interval);
    if !config.enabled {
        return error_interval;
    }

    match class {
        FailureClass::PermanentForbidden => millis(config.permanent_forbidden_backoff),
        FailureClass::Throttled => exponential_backoff_ms(&config.throttled, streak),
        FailureClass::Transient | FailureClass::ServerError => {
            if streak <= config.max_immediate_retries {
                0
            } else {
                error_interval
            }
        }
        FailureClass::Unknown => error_interval,
    }
}

/// Applies `base × (1 + delta)` where `delta = (2·unit − 1)·ratio`, with
/// `unit` in `[0, 1)`. A positive base never jitters down to zero.
pub fn jitter_with(base_ms: i64, ratio: f64, unit: f64) -> i64 {
    if ratio <= 0.0 || base_ms <= 0 {
        return base_ms;
    }
    let ratio = ratio.min(1.0);
    let delta = unit * 2.0 * ratio - ratio;
    let jittered = base_ms as f64 * (1.0 + delta);
    if jittered < 0.0 {
        return 0;
    }
    match jittered.round() as i64 {
        0 => 1,
        value => value,
    }
}

/// Random symmetric jitter of `±ratio`.
pub fn jitter(base_ms: i64, ratio: f64) -> i64 {
    let mut rng = rand::rng();
    jitter_with(base_ms, ratio, rng.random_range(0.0..1.0))
}

/// Rounds a millisecond offset up to a whole second.
pub fn round_up_to_second(ms: i64) -> i64 {
    if ms <= 0 {
        return ms;
    }
    ((ms + 999) / 1000) * 1000
}

/// Complete failure offset: base, jitter, whole-second rounding.
pub fn failure_offset_ms(
    config: &FailureBackoffConfig,
    interval: &Interval,
    class: FailureClass,
    streak: u32,
    jitter_ratio: f64,
) -> i64 {
    let base = failure_base_offset_ms(config, interval, class, streak);
    if base <= 0 {
        return 0;
    }
    round_up_to_second(jitter(base, jitter_ratio))
}

/// Offset used for requeues during shutdown. Keeps cadence when the deadline
/// is known; otherwise spreads restarts over `[1, shutdown_seconds]` seconds.
pub fn shutdown_offset_ms(
    interval: &Interval,
    deadline_s: Option<i64>,
    now_ms: i64,
    shutdown_seconds: u64,
) -> i64 {
    if deadline_s.is_some() {
        return cadence_offset_ms(interval, deadline_s, now_ms);
    }
    if shutdown_seconds == 0 {
        return 0;
    }
    let mut rng = rand::rng();
    let seconds = rng.random_range(1..=shutdown_seconds);
    i64::try_from(seconds.saturating_mul(1000)).unwrap_or(i64::MAX)
}

/// Initial-registration delay in `[0, max_seconds]` seconds.
pub fn registration_jitter_ms(max_seconds: u64) -> i64 {
    if max_seconds == 0 {
        return 0;
    }
    let mut rng = rand::rng();
    let ms = rng.random_range(0..=max_seconds.saturating_mul(1000));
    i64::try_from(ms).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval() -> Interval {
        Interval::new(Duration::from_secs(60), Duration::from_secs(300))
            .with_error_interval(Duration::from_secs(10))
    }

    fn enabled_backoff() -> FailureBackoffConfig {
        FailureBackoffConfig {
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_failure() {
        assert_eq!(
            classify_failure(&ExecutionError::Io("reset".into())),
            FailureClass::Transient
        );
        assert_eq!(
            classify_failure(&ExecutionError::Timeout("slow".into())),
            FailureClass::Transient
        );
        assert_eq!(
            classify_failure(&ExecutionError::http(403, "denied")),
            FailureClass::PermanentForbidden
        );
        assert_eq!(
            classify_failure(&ExecutionError::http(429, "")),
            FailureClass::Throttled
        );
        assert_eq!(
            classify_failure(&ExecutionError::http(400, "Throttling: Rate exceeded")),
            FailureClass::Throttled
        );
        assert_eq!(
            classify_failure(&ExecutionError::http(503, "unavailable")),
            FailureClass::ServerError
        );
        assert_eq!(
            classify_failure(&ExecutionError::http(404, "missing")),
            FailureClass::Unknown
        );
        assert_eq!(
            classify_failure(&ExecutionError::other("Too Many Requests")),
            FailureClass::Throttled
        );
        assert_eq!(
            classify_failure(&ExecutionError::other("bad data")),
            FailureClass::Unknown
        );
    }

    #[test]
    fn test_cadence_offset_preserves_schedule() {
        let now_ms = 1_700_000_000_000;
        // Acquired 20s ago: deadline = acquire + 300s
        let deadline = (now_ms - 20_000) / 1000 + 300;
        assert_eq!(cadence_offset_ms(&interval(), Some(deadline), now_ms), 40_000);

        // Ran longer than the interval: due immediately
        let deadline = (now_ms - 90_000) / 1000 + 300;
        assert_eq!(cadence_offset_ms(&interval(), Some(deadline), now_ms), 0);

        assert_eq!(cadence_offset_ms(&interval(), None, now_ms), 60_000);
    }

    #[test]
    fn test_failure_offset_with_backoff_disabled_uses_error_interval() {
        let config = FailureBackoffConfig::default();
        for class in [
            FailureClass::Transient,
            FailureClass::PermanentForbidden,
            FailureClass::Throttled,
        ] {
            assert_eq!(failure_base_offset_ms(&config, &interval(), class, 3), 10_000);
        }
    }

    #[test]
    fn test_failure_offset_by_class() {
        let config = enabled_backoff();
        assert_eq!(
            failure_base_offset_ms(&config, &interval(), FailureClass::PermanentForbidden, 1),
            30 * 60 * 1000
        );
        assert_eq!(
            failure_base_offset_ms(&config, &interval(), FailureClass::Throttled, 1),
            30_000
        );
        assert_eq!(
            failure_base_offset_ms(&config, &interval(), FailureClass::Throttled, 3),
            120_000
        );
        assert_eq!(
            failure_base_offset_ms(&config, &interval(), FailureClass::Throttled, 10),
            600_000
        );
        assert_eq!(
            failure_base_offset_ms(&config, &interval(), FailureClass::Unknown, 1),
            10_000
        );
    }

    #[test]
    fn test_immediate_retries_for_transient_failures() {
        let config = FailureBackoffConfig {
            enabled: true,
            max_immediate_retries: 2,
            ..Default::default()
        };
        let i = interval();
        assert_eq!(failure_base_offset_ms(&config, &i, FailureClass::Transient, 1), 0);
        assert_eq!(failure_base_offset_ms(&config, &i, FailureClass::ServerError, 2), 0);
        assert_eq!(
            failure_base_offset_ms(&config, &i, FailureClass::Transient, 3),
            10_000
        );
        assert_eq!(failure_offset_ms(&config, &i, FailureClass::Transient, 1, 0.5), 0);
    }

    #[test]
    fn test_jitter_bounds() {
        assert_eq!(jitter_with(10_000, 0.1, 0.0), 9_000);
        assert_eq!(jitter_with(10_000, 0.1, 0.5), 10_000);
        assert_eq!(jitter_with(10_000, 0.0, 0.9), 10_000);
        // A positive base never jitters to zero
        assert_eq!(jitter_with(1, 1.0, 0.0), 1);
        assert_eq!(jitter_with(1, 0.4, 0.0), 1);

        for _ in 0..200 {
            let value = jitter(10_000, 0.2);
            assert!((8_000..=12_000).contains(&value), "{}", value);
        }
    }

    #[test]
    fn test_failure_offset_rounds_up_to_whole_seconds() {
        assert_eq!(round_up_to_second(1), 1_000);
        assert_eq!(round_up_to_second(1_000), 1_000);
        assert_eq!(round_up_to_second(1_001), 2_000);
        assert_eq!(round_up_to_second(0), 0);

        let config = FailureBackoffConfig::default();
        for _ in 0..50 {
            let offset = failure_offset_ms(&config, &interval(), FailureClass::Unknown, 1, 0.1);
            assert_eq!(offset % 1000, 0);
            assert!((9_000..=11_000).contains(&offset), "{}", offset);
        }
    }

    #[test]
    fn test_shutdown_offset() {
        let now_ms = 1_700_000_000_000;
        let deadline = (now_ms - 20_000) / 1000 + 300;
        assert_eq!(shutdown_offset_ms(&interval(), Some(deadline), now_ms, 30), 40_000);
        assert_eq!(shutdown_offset_ms(&interval(), None, now_ms, 0), 0);

        for _ in 0..100 {
            let offset = shutdown_offset_ms(&interval(), None, now_ms, 5);
            assert!((1_000..=5_000).contains(&offset), "{}", offset);
        }
    }

    #[test]
    fn test_registration_jitter_range() {
        assert_eq!(registration_jitter_ms(0), 0);
        for _ in 0..100 {
            assert!((0..=3_000).contains(&registration_jitter_ms(3)));
        }
    }
}
