//! Named component registries.
//!
//! Each category of live objects (chains, hops, authers, ...) lives in a
//! read-mostly map. Registration replaces nothing: updates swap whole
//! entries, and in-flight connections keep the Arcs they captured, so a
//! reload never dangles.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::admission::Admission;
use crate::auth::Auther;
use crate::bypass::Bypass;
use crate::chain::{Chain, Hop};
use crate::error::{Error, Result};
use crate::ingress::Ingress;
use crate::limiter::{ConnLimiter, RateLimiter, TrafficLimiter};
use crate::recorder::Recorder;
use crate::resolver::Resolver;
use crate::router::Router;

pub struct Registry<T: ?Sized> {
    kind: &'static str,
    inner: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, name: &str, value: Arc<T>) -> Result<()> {
        let mut map = self.inner.write();
        if map.contains_key(name) {
            return Err(Error::Config(format!(
                "{} {:?} is already registered",
                self.kind, name
            )));
        }
        map.insert(name.to_string(), value);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<T>> {
        self.inner.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.inner.read().get(name).cloned()
    }

    pub fn get_all(&self) -> Vec<(String, Arc<T>)> {
        self.inner
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }

    /// Atomically replace the whole map (reload).
    pub fn swap(&self, entries: HashMap<String, Arc<T>>) -> HashMap<String, Arc<T>> {
        let mut map = self.inner.write();
        std::mem::replace(&mut *map, entries)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// All process-wide registries. One instance per running engine.
pub struct Registries {
    pub chains: Arc<Registry<Chain>>,
    pub hops: Arc<Registry<Hop>>,
    pub authers: Arc<Registry<dyn Auther>>,
    pub limiters: Arc<Registry<TrafficLimiter>>,
    pub rate_limiters: Arc<Registry<RateLimiter>>,
    pub conn_limiters: Arc<Registry<ConnLimiter>>,
    pub bypasses: Arc<Registry<Bypass>>,
    pub ingresses: Arc<Registry<Ingress>>,
    pub resolvers: Arc<Registry<dyn Resolver>>,
    pub routers: Arc<Registry<Router>>,
    pub recorders: Arc<Registry<dyn Recorder>>,
    pub admissions: Arc<Registry<Admission>>,
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

impl Registries {
    pub fn new() -> Self {
        Self {
            chains: Arc::new(Registry::new("chain")),
            hops: Arc::new(Registry::new("hop")),
            authers: Arc::new(Registry::new("auther")),
            limiters: Arc::new(Registry::new("limiter")),
            rate_limiters: Arc::new(Registry::new("rate limiter")),
            conn_limiters: Arc::new(Registry::new("conn limiter")),
            bypasses: Arc::new(Registry::new("bypass")),
            ingresses: Arc::new(Registry::new("ingress")),
            resolvers: Arc::new(Registry::new("resolver")),
            routers: Arc::new(Registry::new("router")),
            recorders: Arc::new(Registry::new("recorder")),
            admissions: Arc::new(Registry::new("admission")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_registration_rejected() {
        let reg: Registry<Chain> = Registry::new("chain");
        reg.register("a", Arc::new(Chain::empty("a"))).unwrap();
        assert!(reg.register("a", Arc::new(Chain::empty("a"))).is_err());
        assert!(reg.is_registered("a"));
    }

    #[test]
    fn test_swap_keeps_old_arcs_alive() {
        let reg: Registry<Chain> = Registry::new("chain");
        reg.register("a", Arc::new(Chain::empty("a"))).unwrap();

        // a connection captured this Arc before the reload
        let captured = reg.get("a").unwrap();

        let mut next = HashMap::new();
        next.insert("b".to_string(), Arc::new(Chain::empty("b")));
        let old = reg.swap(next);

        assert!(reg.get("a").is_none());
        assert!(reg.get("b").is_some());
        assert_eq!(old.len(), 1);
        // the captured object is still fully usable
        assert_eq!(captured.name, "a");
    }
}
