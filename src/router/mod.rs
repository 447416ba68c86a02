//! Router - resolves where and how to dial.
//!
//! Pipeline per request: ingress rewrite -> service-discovery resolve ->
//! chain selection (by name, dereferenced at request time so reloads take
//! effect for new connections only) -> chain dial.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::chain::Chain;
use crate::common::{Address, Network, RequestMeta, Result, Stream};
use crate::ingress::Ingress;
use crate::registry::Registry;
use crate::resolver::Resolver;
use crate::udprelay::{PacketEndpoint, StreamEndpoint, UdpEndpoint};

/// What a router dial produced, for the recorder.
#[derive(Debug, Clone, Default)]
pub struct RouteInfo {
    pub route: String,
    pub dst: String,
}

pub struct Router {
    pub name: String,
    chains: Arc<Registry<Chain>>,
    chain_name: Option<String>,
    ingress: Option<Arc<Ingress>>,
    resolver: Option<Arc<dyn Resolver>>,
    cache: Option<Mutex<LruCache<String, (Address, Instant)>>>,
    cache_expiration: Duration,
}

impl Router {
    pub fn new(name: impl Into<String>, chains: Arc<Registry<Chain>>) -> Self {
        Self {
            name: name.into(),
            chains,
            chain_name: None,
            ingress: None,
            resolver: None,
            cache: None,
            cache_expiration: Duration::from_secs(30),
        }
    }

    pub fn with_chain(mut self, chain: Option<String>) -> Self {
        self.chain_name = chain;
        self
    }

    pub fn with_ingress(mut self, ingress: Option<Arc<Ingress>>) -> Self {
        self.ingress = ingress;
        self
    }

    pub fn with_resolver(mut self, resolver: Option<Arc<dyn Resolver>>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Enable the route cache that pins `(network, address)` resolutions so
    /// hash-based selection stays stable across quick retries.
    pub fn with_cache(mut self, capacity: usize, expiration: Duration) -> Self {
        if capacity > 0 {
            let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
            self.cache = Some(Mutex::new(LruCache::new(capacity)));
            self.cache_expiration = expiration;
        }
        self
    }

    /// The chain for this router, dereferenced by name at request time.
    fn chain(&self) -> Arc<Chain> {
        match &self.chain_name {
            Some(name) => self
                .chains
                .get(name)
                .unwrap_or_else(|| Arc::new(Chain::empty(name.clone()))),
            None => Arc::new(Chain::empty("default")),
        }
    }

    /// Rewrite + resolve the target address.
    async fn resolve_target(
        &self,
        network: Network,
        address: &Address,
    ) -> Result<Address> {
        let cache_key = format!("{}/{}", network, address.canonical());
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock();
            if let Some((addr, stamp)) = cache.get(&cache_key) {
                if stamp.elapsed() < self.cache_expiration {
                    return Ok(addr.clone());
                }
            }
        }

        let mut target = address.clone();

        if let Some(ingress) = &self.ingress {
            if let Some(rule) = ingress.get_rule(&target.canonical()) {
                if !rule.endpoint.is_empty() {
                    debug!("router {}: ingress {} -> {}", self.name, target, rule.endpoint);
                    target = Address::parse(&rule.endpoint)
                        .unwrap_or_else(|_| Address::domain(rule.endpoint.clone(), target.port()));
                }
            }
        }

        if let Some(resolver) = &self.resolver {
            if let Address::Domain(host, port) = &target {
                target = resolver.resolve(host, *port).await?;
            }
        }

        if let Some(cache) = &self.cache {
            cache
                .lock()
                .put(cache_key, (target.clone(), Instant::now()));
        }
        Ok(target)
    }

    /// Dial a stream target through the configured chain.
    pub async fn dial(
        &self,
        network: Network,
        address: &Address,
        req: &RequestMeta,
    ) -> Result<(Stream, RouteInfo)> {
        let target = self.resolve_target(network, address).await?;
        let chain = self.chain();
        let (stream, route) = chain.dial(network, &target, req).await?;
        Ok((
            stream,
            RouteInfo {
                route,
                dst: target.canonical(),
            },
        ))
    }

    /// Obtain a packet endpoint for a UDP association.
    ///
    /// Empty chain: a native ephemeral socket. Through a chain: the chain
    /// is dialed with `network = udp` and datagrams are stream-framed.
    pub async fn dial_udp(&self, req: &RequestMeta) -> Result<Box<dyn PacketEndpoint>> {
        let chain = self.chain();
        if chain.is_empty() {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            return Ok(Box::new(UdpEndpoint::new(socket)));
        }
        let (stream, _route) = chain
            .dial(Network::Udp, &Address::unspecified(), req)
            .await?;
        Ok(Box::new(StreamEndpoint::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::Rule;

    fn chains() -> Arc<Registry<Chain>> {
        Arc::new(Registry::new("chain"))
    }

    #[tokio::test]
    async fn test_ingress_rewrite_applies() {
        let ingress = Arc::new(Ingress::new(vec![Rule {
            hostname: "app.example".into(),
            endpoint: "127.0.0.1:8080".into(),
        }]));
        let router = Router::new("r", chains()).with_ingress(Some(ingress));

        let target = router
            .resolve_target(Network::Tcp, &Address::domain("app.example", 80))
            .await
            .unwrap();
        assert_eq!(target, Address::Socket("127.0.0.1:8080".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_cache_pins_resolution() {
        let ingress = Arc::new(Ingress::new(vec![Rule {
            hostname: "app.example".into(),
            endpoint: "127.0.0.1:8080".into(),
        }]));
        let router = Router::new("r", chains())
            .with_ingress(Some(ingress.clone()))
            .with_cache(16, Duration::from_secs(60));

        let addr = Address::domain("app.example", 80);
        let first = router.resolve_target(Network::Tcp, &addr).await.unwrap();

        // even after the rules change, the cached resolution holds
        let router2_target = router.resolve_target(Network::Tcp, &addr).await.unwrap();
        assert_eq!(first, router2_target);
    }

    #[tokio::test]
    async fn test_unknown_chain_falls_back_to_direct() {
        let router = Router::new("r", chains()).with_chain(Some("ghost".into()));
        assert!(router.chain().is_empty());
    }
}
