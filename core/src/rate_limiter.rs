// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Token-bucket admission control.
//!
//! Two buckets are checked per inbound message: a per-user bucket and a
//! per-config bucket. Both must hold at least one token for the message to
//! pass; a depleted bucket fails closed with a retry hint.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

const USER_CAPACITY: f64 = 20.0;
const CONFIG_CAPACITY: f64 = 60.0;
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
const MIN_RETRY_AFTER_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after_ms: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BucketKey {
    Config(String),
    User(String, String),
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, capacity: f64, window: Duration, now: Instant) {
        let elapsed = now.duration_since(self.last_refill);
        let replenished = elapsed.as_secs_f64() / window.as_secs_f64() * capacity;
        self.tokens = (self.tokens + replenished).min(capacity);
        self.last_refill = now;
    }

    fn retry_after_ms(&self, capacity: f64, window: Duration) -> u64 {
        let missing = (1.0 - self.tokens).max(0.0);
        let wait = (missing / capacity * window.as_millis() as f64).ceil() as u64;
        wait.max(MIN_RETRY_AFTER_MS)
    }
}

pub struct RateLimiter {
    window: Duration,
    buckets: Mutex<HashMap<BucketKey, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject one message for `(config_id, user_id)`. Both buckets
    /// are refilled first; a token is consumed from each only when both can
    /// afford it.
    pub fn check(&self, config_id: &str, user_id: &str) -> RateDecision {
        let now = Instant::now();
        let user_key = BucketKey::User(config_id.to_string(), user_id.to_string());
        let config_key = BucketKey::Config(config_id.to_string());

        let mut buckets = self.buckets.lock().unwrap();

        let user_tokens = {
            let bucket = buckets
                .entry(user_key.clone())
                .or_insert_with(|| Bucket::full(USER_CAPACITY, now));
            bucket.refill(USER_CAPACITY, self.window, now);
            bucket.tokens
        };
        let config_tokens = {
            let bucket = buckets
                .entry(config_key.clone())
                .or_insert_with(|| Bucket::full(CONFIG_CAPACITY, now));
            bucket.refill(CONFIG_CAPACITY, self.window, now);
            bucket.tokens
        };

        if user_tokens < 1.0 || config_tokens < 1.0 {
            let mut retry_after_ms = 0;
            if user_tokens < 1.0 {
                if let Some(bucket) = buckets.get(&user_key) {
                    retry_after_ms =
                        retry_after_ms.max(bucket.retry_after_ms(USER_CAPACITY, self.window));
                }
            }
            if config_tokens < 1.0 {
                if let Some(bucket) = buckets.get(&config_key) {
                    retry_after_ms =
                        retry_after_ms.max(bucket.retry_after_ms(CONFIG_CAPACITY, self.window));
                }
            }
            return RateDecision::Limited {
                retry_after_ms: retry_after_ms.max(MIN_RETRY_AFTER_MS),
            };
        }

        if let Some(bucket) = buckets.get_mut(&user_key) {
            bucket.tokens -= 1.0;
        }
        if let Some(bucket) = buckets.get_mut(&config_key) {
            bucket.tokens -= 1.0;
        }
        RateDecision::Allowed
    }

    /// Drop buckets that have not been touched for two full windows.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let threshold = self.window * 2;
        let mut buckets = self.buckets.lock().unwrap();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_refill) < threshold);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        let buckets = self.buckets.lock().unwrap();
        buckets.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
