//! Threshold monitor: per-source token buckets enforcing declared rate
//! ceilings, plus advisory checks that warn without dropping.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tracing::warn;

use zen_common::{RateLimit, Severity};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThresholdDecision {
    Allowed,
    RateLimited,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

struct SeverityWindow {
    total: u64,
    low: u64,
    warned: bool,
}

/// Events per advisory window before the low-severity ratio is evaluated.
const SEVERITY_WINDOW_SIZE: u64 = 100;
const LOW_SEVERITY_RATIO_WARN: f64 = 0.9;

#[derive(Default)]
pub struct ThresholdMonitor {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    severity: Mutex<HashMap<String, SeverityWindow>>,
}

impl ThresholdMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one token for `source`. Sources without a declared limit are
    /// always allowed.
    pub fn check(&self, source: &str, limit: Option<&RateLimit>) -> ThresholdDecision {
        self.check_at(source, limit, Instant::now())
    }

    pub fn check_at(
        &self,
        source: &str,
        limit: Option<&RateLimit>,
        now: Instant,
    ) -> ThresholdDecision {
        let Some(limit) = limit else {
            return ThresholdDecision::Allowed;
        };
        if limit.requests_per_minute == 0 {
            return ThresholdDecision::Allowed;
        }

        let rate_per_sec = f64::from(limit.requests_per_minute) / 60.0;
        let capacity = f64::from(limit.burst.unwrap_or(limit.requests_per_minute)).max(1.0);

        let mut buckets = self.buckets.lock().expect("threshold buckets lock poisoned");
        let bucket = buckets.entry(source.to_string()).or_insert(TokenBucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate_per_sec).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            ThresholdDecision::Allowed
        } else {
            ThresholdDecision::RateLimited
        }
    }

    /// Advisory: track the low-severity ratio per source and warn when a
    /// window is dominated by LOW/INFO events. Never drops anything.
    pub fn record_severity(&self, source: &str, severity: Severity) {
        let mut map = self.severity.lock().expect("threshold severity lock poisoned");
        let window = map.entry(source.to_string()).or_insert(SeverityWindow {
            total: 0,
            low: 0,
            warned: false,
        });
        window.total += 1;
        if severity <= Severity::Low {
            window.low += 1;
        }
        if window.total >= SEVERITY_WINDOW_SIZE {
            let ratio = window.low as f64 / window.total as f64;
            if ratio > LOW_SEVERITY_RATIO_WARN && !window.warned {
                warn!(
                    source,
                    ratio = format!("{ratio:.2}"),
                    "Source is dominated by low-severity events; consider raising its filter floor"
                );
                window.warned = true;
            }
            window.total = 0;
            window.low = 0;
        }
    }
}
