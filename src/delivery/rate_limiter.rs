//! Fixed-window outbound rate limiter.
//!
//! Counts sends per (key, wall-clock second) and answers whether the
//! configured per-second budget is exceeded. Shared across all senders
//! targeting the same external channel; advisory, never blocking: the
//! caller decides what to do with a `false`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds a counter bucket stays alive before it is pruned.
const BUCKET_TTL_SECS: u64 = 2;

/// Fixed-window per-second counter.
pub struct RateLimiter {
    budget_per_sec: u32,
    buckets: Mutex<HashMap<(String, u64), u32>>,
}

impl RateLimiter {
    /// Create a limiter with the given per-second budget.
    pub fn new(budget_per_sec: u32) -> Self {
        Self {
            budget_per_sec,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Increment the counter for `key` in the current second and return
    /// whether the budget still holds. Must be called immediately before
    /// every outbound send.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, now_epoch_secs())
    }

    fn allow_at(&self, key: &str, now: u64) -> bool {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            // A poisoned counter map still holds valid u32s; keep counting.
            Err(poisoned) => poisoned.into_inner(),
        };
        buckets.retain(|(_, sec), _| now.saturating_sub(*sec) <= BUCKET_TTL_SECS);
        let count = buckets.entry((key.to_owned(), now)).or_insert(0);
        *count += 1;
        *count <= self.budget_per_sec
    }
}

/// Returns current UTC seconds since epoch.
fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn allows_up_to_budget_within_one_second() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.allow_at("chan", 100));
        assert!(limiter.allow_at("chan", 100));
        assert!(limiter.allow_at("chan", 100));
        assert!(!limiter.allow_at("chan", 100));
    }

    #[test]
    fn budget_resets_on_the_next_second() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.allow_at("chan", 100));
        assert!(!limiter.allow_at("chan", 100));
        assert!(limiter.allow_at("chan", 101));
    }

    #[test]
    fn keys_are_counted_independently() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.allow_at("a", 100));
        assert!(limiter.allow_at("b", 100));
        assert!(!limiter.allow_at("a", 100));
    }

    #[test]
    fn stale_buckets_are_pruned() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.allow_at("chan", 100));
        // Far enough in the future that the old bucket expires.
        assert!(limiter.allow_at("chan", 200));
        let buckets = limiter.buckets.lock().unwrap();
        assert_eq!(buckets.len(), 1, "expired bucket must be gone");
    }

    #[test]
    fn concurrent_increments_never_lose_updates() {
        let limiter = Arc::new(RateLimiter::new(16));
        let allowed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let allowed = Arc::clone(&allowed);
                std::thread::spawn(move || {
                    if limiter.allow_at("chan", 100) {
                        allowed.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(allowed.load(Ordering::SeqCst), 16);
    }
}
