//! Requeue backoff with exponential growth and jitter.
//!
//! Reconciles never retry inline. When one fails, the controller's error
//! policy asks [`RequeueBackoff`] how long to wait before the record is
//! reconciled again. Each record keeps its own attempt counter, which is
//! cleared by the next successful reconcile.

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;

/// Backoff parameters for failed reconciles
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Un-jittered delay for the given 1-based attempt, capped at `max_delay`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Delay for the given attempt with 0.5x to 1.5x jitter, still capped
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let secs = self.base_delay(attempt).as_secs_f64() * jitter;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Per-key attempt counters shared by concurrent reconciles
#[derive(Debug, Default)]
pub struct RequeueBackoff {
    config: RetryConfig,
    attempts: DashMap<String, u32>,
}

impl RequeueBackoff {
    /// Create a tracker with the given parameters
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: DashMap::new(),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying
    pub fn next_delay(&self, key: &str) -> Duration {
        let attempt = {
            let mut entry = self.attempts.entry(key.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };
        self.config.jittered_delay(attempt)
    }

    /// Forget the failures recorded for `key`
    pub fn reset(&self, key: &str) {
        self.attempts.remove(key);
    }

    /// Number of consecutive failures recorded for `key`
    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts.get(key).map(|a| *a).unwrap_or(0)
    }
}
