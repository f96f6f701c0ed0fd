use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

/// Fixed-window request counter keyed by client IP.
///
/// State is process-local: horizontally scaled instances each enforce the
/// limit independently, so the effective global limit is
/// `max_requests * instance_count`.
pub struct RateLimiter {
    max_requests: u32,
    window_ms: i64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    count: u32,
    reset_at_ms: i64,
}

/// Outcome of one rate-limit check, also carried into response headers.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at_ms: i64,
}

impl RateDecision {
    /// Window reset as unix seconds, for `X-RateLimit-Reset`.
    pub fn reset_epoch_secs(&self) -> i64 {
        self.reset_at_ms / 1000
    }
}

impl RateLimiter {
    pub fn new(max_requests: u32, window_ms: i64) -> Self {
        RateLimiter {
            max_requests,
            window_ms,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Utc::now().timestamp_millis())
    }

    /// Same as [`check`](Self::check) with an explicit clock, so window
    /// rollover is testable without sleeping.
    pub fn check_at(&self, key: &str, now_ms: i64) -> RateDecision {
        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            reset_at_ms: now_ms + self.window_ms,
        });
        if now_ms >= bucket.reset_at_ms {
            bucket.count = 0;
            bucket.reset_at_ms = now_ms + self.window_ms;
        }
        if bucket.count >= self.max_requests {
            return RateDecision {
                allowed: false,
                limit: self.max_requests,
                remaining: 0,
                reset_at_ms: bucket.reset_at_ms,
            };
        }
        bucket.count += 1;
        RateDecision {
            allowed: true,
            limit: self.max_requests,
            remaining: self.max_requests - bucket.count,
            reset_at_ms: bucket.reset_at_ms,
        }
    }
}
