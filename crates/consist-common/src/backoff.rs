//! Per-key exponential backoff for failed reconciles.
//!
//! The controller runtime requeues whatever `error_policy` returns, so the
//! rate limiting a work queue would normally apply is tracked here instead:
//! each failing key doubles its delay (with jitter) until it succeeds again.

use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;

/// Backoff settings
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for the delay
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure
    pub backoff_multiplier: f64,
    /// Whether to randomize delays between 0.5x and 1.5x
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl BackoffConfig {
    /// Delay for the given number of consecutive failures (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(64) as i32;
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let secs = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..1.5)
        } else {
            capped
        };
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Tracks consecutive failures per key
#[derive(Debug)]
pub struct KeyedBackoff<K: Eq + Hash> {
    config: BackoffConfig,
    failures: DashMap<K, u32>,
}

impl<K: Eq + Hash> KeyedBackoff<K> {
    /// Create a tracker with the given settings
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: DashMap::new(),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying
    pub fn next_delay(&self, key: K) -> Duration {
        let mut entry = self.failures.entry(key).or_insert(0);
        *entry = entry.saturating_add(1);
        self.config.delay_for(*entry)
    }

    /// Longest delay this tracker hands out
    pub fn max_delay(&self) -> Duration {
        self.config.max_delay
    }

    /// Forget failures for `key` after a successful pass
    pub fn reset(&self, key: &K) {
        self.failures.remove(key);
    }

    /// Consecutive failures currently recorded for `key`
    pub fn failures(&self, key: &K) -> u32 {
        self.failures.get(key).map(|v| *v).unwrap_or(0)
    }
}

impl<K: Eq + Hash> Default for KeyedBackoff<K> {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
