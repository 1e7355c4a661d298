use std::{collections::HashMap, hash::Hash, time::Duration};

use parking_lot::Mutex;

/// Decides how long a failed key waits before it is handed out again.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay for the next retry of `key`; counts as one more failure.
    fn when(&self, key: &K) -> Duration;
    /// Clears the failure history of `key`.
    fn forget(&self, key: &K);
    /// Failures recorded for `key` since it was last forgotten.
    fn num_requeues(&self, key: &K) -> u32;
}

/// `base * 2^failures`, capped at `max`.
pub struct ExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> ExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> Default for ExponentialBackoff<K> {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl<K> RateLimiter<K> for ExponentialBackoff<K>
where
    K: Clone + Eq + Hash + Send + Sync,
{
    fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock();
        let exp = failures.entry(key.clone()).or_insert(0);
        let attempt = *exp;
        *exp = exp.saturating_add(1);

        // 2^31 already overflows any sane base, so clamp the shift
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}
