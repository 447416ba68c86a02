//! Service-discovery resolver with a TTL cache.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::net::lookup_host;

use crate::common::Address;
use crate::error::{Error, Result};

/// Resolves a hostname to a concrete endpoint.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> Result<Address>;
}

/// System resolver backed by the OS lookup.
pub struct DnsResolver;

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Address> {
        let mut addrs = lookup_host((host, port)).await?;
        addrs
            .next()
            .map(Address::Socket)
            .ok_or_else(|| Error::NoRoute(format!("{}:{}", host, port)))
    }
}

/// Caching layer over any resolver.
///
/// Entries live for `expiration`; a stale hit falls through to the inner
/// resolver and replaces the entry.
pub struct CachedResolver {
    inner: Box<dyn Resolver>,
    cache: Mutex<LruCache<String, (Address, Instant)>>,
    expiration: Duration,
}

impl CachedResolver {
    pub fn new(inner: Box<dyn Resolver>, capacity: usize, expiration: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            expiration,
        }
    }
}

#[async_trait]
impl Resolver for CachedResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Address> {
        let key = format!("{}:{}", host, port);
        {
            let mut cache = self.cache.lock();
            if let Some((addr, stamp)) = cache.get(&key) {
                if stamp.elapsed() < self.expiration {
                    return Ok(addr.clone());
                }
            }
        }

        let addr = self.inner.resolve(host, port).await?;
        self.cache
            .lock()
            .put(key, (addr.clone(), Instant::now()));
        Ok(addr)
    }
}
