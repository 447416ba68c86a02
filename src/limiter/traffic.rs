//! Byte-budget traffic limiting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use super::Scope;

/// A token bucket refilled continuously at `rate` bytes per second.
///
/// Capacity equals one second of budget, so a fresh connection may burst at
/// most `rate` bytes before throttling kicks in.
pub struct Bucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refilled: Instant,
}

impl Bucket {
    pub fn new(rate: u64) -> Self {
        let rate = rate.max(1) as f64;
        Self {
            rate,
            capacity: rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                refilled: Instant::now(),
            }),
        }
    }

    /// Take up to `want` tokens. Returns either the number granted (> 0) or
    /// the duration to wait before any tokens become available.
    ///
    /// Grants never reorder: a caller that was told to wait holds no claim,
    /// so byte order within a connection is preserved by the caller looping.
    pub fn consume(&self, want: usize) -> Result<usize, Duration> {
        let mut st = self.state.lock();

        let now = Instant::now();
        let elapsed = now.duration_since(st.refilled).as_secs_f64();
        st.tokens = (st.tokens + elapsed * self.rate).min(self.capacity);
        st.refilled = now;

        if st.tokens >= 1.0 {
            let granted = (st.tokens as usize).min(want.max(1));
            st.tokens -= granted as f64;
            Ok(granted)
        } else {
            let deficit = 1.0 - st.tokens;
            Err(Duration::from_secs_f64(deficit / self.rate))
        }
    }

    /// Await the full budget for `n` bytes (used on packet paths where a
    /// datagram cannot be split).
    pub async fn acquire(&self, n: usize) {
        let mut remaining = n;
        while remaining > 0 {
            match self.consume(remaining) {
                Ok(granted) => remaining = remaining.saturating_sub(granted),
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}

/// Input/output bucket pair for one limiter key.
pub struct BucketPair {
    pub input: Option<Bucket>,
    pub output: Option<Bucket>,
}

struct CacheEntry {
    pair: Arc<BucketPair>,
    last_seen: Instant,
}

/// Traffic limiter with service/client/conn scopes.
///
/// The service scope shares a single bucket pair; client and conn scopes
/// lazily create a pair per key, cached and pruned after `cleanup_interval`
/// of inactivity.
pub struct TrafficLimiter {
    limits: HashMap<Scope, (u64, u64)>,
    service_pair: Option<Arc<BucketPair>>,
    cache: RwLock<HashMap<(Scope, String), CacheEntry>>,
    cleanup_interval: Duration,
}

impl TrafficLimiter {
    /// `limits` maps scope to (input, output) bytes/sec; zero disables the
    /// direction.
    pub fn new(limits: HashMap<Scope, (u64, u64)>) -> Self {
        let service_pair = limits
            .get(&Scope::Service)
            .map(|&(i, o)| Arc::new(make_pair(i, o)));
        Self {
            limits,
            service_pair,
            cache: RwLock::new(HashMap::new()),
            cleanup_interval: Duration::from_secs(60),
        }
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Bucket pair for a scope + key, or None when the scope is unlimited.
    pub fn pair(&self, scope: Scope, key: &str) -> Option<Arc<BucketPair>> {
        if scope == Scope::Service {
            return self.service_pair.clone();
        }

        let &(input, output) = self.limits.get(&scope)?;
        if input == 0 && output == 0 {
            return None;
        }

        let cache_key = (scope, key.to_string());
        {
            let mut cache = self.cache.write();
            if let Some(entry) = cache.get_mut(&cache_key) {
                entry.last_seen = Instant::now();
                return Some(entry.pair.clone());
            }

            if cache.len() > 128 {
                let deadline = Instant::now() - self.cleanup_interval;
                cache.retain(|_, e| e.last_seen > deadline);
            }

            let pair = Arc::new(make_pair(input, output));
            cache.insert(
                cache_key,
                CacheEntry {
                    pair: pair.clone(),
                    last_seen: Instant::now(),
                },
            );
            Some(pair)
        }
    }
}

fn make_pair(input: u64, output: u64) -> BucketPair {
    BucketPair {
        input: (input > 0).then(|| Bucket::new(input)),
        output: (output > 0).then(|| Bucket::new(output)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bucket_throughput_bounded() {
        // 10KB/s budget; moving 25KB must take at least ~1.5s beyond the
        // initial burst capacity.
        let bucket = Bucket::new(10_000);
        let started = Instant::now();
        let mut moved = 0usize;
        while moved < 25_000 {
            match bucket.consume(25_000 - moved) {
                Ok(granted) => moved += granted,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
        assert_eq!(moved, 25_000);
        assert!(started.elapsed() >= Duration::from_millis(1200));
    }

    #[test]
    fn test_scope_keys_are_independent() {
        let mut limits = HashMap::new();
        limits.insert(Scope::Conn, (1024, 1024));
        let limiter = TrafficLimiter::new(limits);

        let a = limiter.pair(Scope::Conn, "1.1.1.1:5000").unwrap();
        let b = limiter.pair(Scope::Conn, "2.2.2.2:6000").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));

        let a2 = limiter.pair(Scope::Conn, "1.1.1.1:5000").unwrap();
        assert!(Arc::ptr_eq(&a, &a2));
    }

    #[test]
    fn test_unlimited_scope_has_no_pair() {
        let limiter = TrafficLimiter::new(HashMap::new());
        assert!(limiter.pair(Scope::Client, "alice").is_none());
        assert!(limiter.pair(Scope::Service, "").is_none());
    }
}
