//! Per-source failure tracking with bounded exponential backoff.
//!
//! After `n` consecutive failures a source is skipped for
//! `min(base × 2^(n−1), max)`. Skipping happens on later requests only;
//! nothing is retried inside the request that failed. One success resets
//! the source.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::HealthConfig;

#[derive(Debug, Clone)]
struct Entry {
    failures: u32,
    open_until: Instant,
    last_error: String,
}

pub struct SourceHealth {
    base: Duration,
    max: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl SourceHealth {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Backoff window after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Why `source` is being skipped, if its backoff window is open.
    pub fn skip_reason(&self, source: &str) -> Option<String> {
        self.skip_reason_at(source, Instant::now())
    }

    fn skip_reason_at(&self, source: &str, now: Instant) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(source)?;
        (now < entry.open_until).then(|| {
            format!(
                "skipped for {}ms after {} consecutive failures: {}",
                (entry.open_until - now).as_millis(),
                entry.failures,
                entry.last_error
            )
        })
    }

    pub fn record_failure(&self, source: &str, error: &str) {
        self.record_failure_at(source, error, Instant::now());
    }

    fn record_failure_at(&self, source: &str, error: &str, now: Instant) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let failures = entries.get(source).map_or(1, |e| e.failures.saturating_add(1));
        let backoff = self.backoff(failures);
        entries.insert(
            source.to_string(),
            Entry {
                failures,
                open_until: now + backoff,
                last_error: error.to_string(),
            },
        );
        warn!(source, failures, backoff_ms = backoff.as_millis() as u64, "source marked unhealthy");
    }

    pub fn record_success(&self, source: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.remove(source).is_some() {
            info!(source, "source recovered");
        }
    }

    pub fn failures(&self, source: &str) -> u32 {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(source)
            .map_or(0, |e| e.failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health() -> SourceHealth {
        SourceHealth::new(&HealthConfig {
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
        })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let h = health();
        assert_eq!(h.backoff(0), Duration::ZERO);
        assert_eq!(h.backoff(1), Duration::from_millis(100));
        assert_eq!(h.backoff(2), Duration::from_millis(200));
        assert_eq!(h.backoff(4), Duration::from_millis(800));
        assert_eq!(h.backoff(5), Duration::from_millis(1_000));
        assert_eq!(h.backoff(64), Duration::from_millis(1_000));
    }

    #[test]
    fn test_failure_opens_window_until_it_expires() {
        let h = health();
        let t0 = Instant::now();
        h.record_failure_at("jira:issues", "timeout", t0);
        assert!(h
            .skip_reason_at("jira:issues", t0 + Duration::from_millis(50))
            .is_some_and(|r| r.contains("timeout")));
        assert!(h
            .skip_reason_at("jira:issues", t0 + Duration::from_millis(150))
            .is_none());
        assert!(h.skip_reason_at("slack:eng", t0).is_none());
    }

    #[test]
    fn test_success_resets() {
        let h = health();
        h.record_failure("jira:issues", "timeout");
        h.record_failure("jira:issues", "timeout");
        assert_eq!(h.failures("jira:issues"), 2);
        h.record_success("jira:issues");
        assert_eq!(h.failures("jira:issues"), 0);
        assert!(h.skip_reason("jira:issues").is_none());
    }
}
