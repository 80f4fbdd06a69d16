//! Per-object exponential retry delays.

use std::{collections::HashMap, hash::Hash, sync::Mutex, time::Duration};

pub const DEFAULT_BASE: Duration = Duration::from_secs(5);
pub const DEFAULT_CAP: Duration = Duration::from_secs(5 * 60);

/// Tracks consecutive failures per key and hands out doubling delays, capped at a maximum.
///
/// Each key backs off independently, so one broken registry never slows down the others.
#[derive(Debug)]
pub struct Backoff<K> {
    base: Duration,
    cap: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash> Default for Backoff<K> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_CAP)
    }
}

impl<K: Eq + Hash> Backoff<K> {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure for `key` and returns how long to wait before retrying it.
    pub fn next_delay(&self, key: K) -> Duration {
        let attempt = match self.failures.lock() {
            Ok(mut failures) => {
                let count = failures.entry(key).or_insert(0);
                let attempt = *count;
                *count = count.saturating_add(1);
                attempt
            }
            Err(_) => {
                tracing::warn!("backoff state is poisoned, retrying with the base delay");
                0
            }
        };
        self.delay_for_attempt(attempt)
    }

    /// Forgets the failures of `key` after it reconciled successfully.
    pub fn reset(&self, key: &K) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }

    /// Forgets the failures of every key for which `keep` returns false.
    pub fn retain(&self, mut keep: impl FnMut(&K) -> bool) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.retain(|key, _| keep(key));
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(31);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}
