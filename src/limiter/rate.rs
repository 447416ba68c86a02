//! Connection-attempt rate limiting per client host.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const WINDOW: Duration = Duration::from_secs(1);

/// Fixed-window counter: at most `limit` new connections per second per
/// host. Non-blocking; a denied attempt is simply rejected.
pub struct RateLimiter {
    limit: u32,
    windows: Mutex<HashMap<String, (Instant, u32)>>,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, host: &str) -> bool {
        if self.limit == 0 {
            return true;
        }

        let now = Instant::now();
        let mut windows = self.windows.lock();

        if windows.len() > 1024 {
            windows.retain(|_, (start, _)| now.duration_since(*start) < WINDOW);
        }

        let entry = windows.entry(host.to_string()).or_insert((now, 0));
        if now.duration_since(entry.0) >= WINDOW {
            *entry = (now, 0);
        }
        if entry.1 >= self.limit {
            return false;
        }
        entry.1 += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_per_host() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.allow("1.2.3.4"));
        assert!(limiter.allow("1.2.3.4"));
        assert!(!limiter.allow("1.2.3.4"));
        // another host has its own window
        assert!(limiter.allow("5.6.7.8"));
    }

    #[test]
    fn test_zero_means_unlimited() {
        let limiter = RateLimiter::new(0);
        for _ in 0..100 {
            assert!(limiter.allow("x"));
        }
    }
}
