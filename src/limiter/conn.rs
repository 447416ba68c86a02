//! Active-connection limiting.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Caps concurrently active connections per key (remote host or client id).
///
/// `allow(key, 1)` claims a slot at accept time; `allow(key, -1)` releases
/// it on close. Release must be idempotent at the call site (the wrapper
/// guarantees a single release per connection).
pub struct ConnLimiter {
    max: usize,
    counts: Mutex<HashMap<String, usize>>,
}

impl ConnLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str, delta: i64) -> bool {
        if self.max == 0 {
            return true;
        }

        let mut counts = self.counts.lock();
        let count = counts.entry(key.to_string()).or_insert(0);

        if delta > 0 {
            if *count >= self.max {
                return false;
            }
            *count += 1;
        } else if delta < 0 {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(key);
            }
        }
        true
    }

    pub fn active(&self, key: &str) -> usize {
        self.counts.lock().get(key).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_and_release() {
        let limiter = ConnLimiter::new(2);
        assert!(limiter.allow("k", 1));
        assert!(limiter.allow("k", 1));
        assert!(!limiter.allow("k", 1));

        assert!(limiter.allow("k", -1));
        assert!(limiter.allow("k", 1));
        assert_eq!(limiter.active("k"), 2);
    }

    #[test]
    fn test_release_below_zero_is_safe() {
        let limiter = ConnLimiter::new(1);
        assert!(limiter.allow("k", -1));
        assert_eq!(limiter.active("k"), 0);
        assert!(limiter.allow("k", 1));
    }
}
