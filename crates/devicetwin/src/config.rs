//! Retry/backoff tunables named in spec §6, with defaults matching the
//! source (`RetryTimes=5`, `RetryInterval=200ms`).

use std::env;
use std::time::Duration;

/// How many times (and how far apart) `DeviceWorker` retries a failed
/// persistence call before giving up and re-syncing in-memory state from
/// storage.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub times: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            times: 5,
            interval: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Overrides defaults with `DEVICETWIN_RETRY_TIMES` /
    /// `DEVICETWIN_RETRY_INTERVAL_MS` when present and well-formed; falls
    /// back silently on a missing or malformed variable, since a typo in an
    /// optional env override should not prevent the worker from starting.
    pub fn from_env() -> Self {
        let mut policy = Self::default();
        if let Ok(times) = env::var("DEVICETWIN_RETRY_TIMES") {
            if let Ok(times) = times.parse() {
                policy.times = times;
            }
        }
        if let Ok(interval_ms) = env::var("DEVICETWIN_RETRY_INTERVAL_MS") {
            if let Ok(interval_ms) = interval_ms.parse() {
                policy.interval = Duration::from_millis(interval_ms);
            }
        }
        policy
    }
}
