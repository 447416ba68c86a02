//! Node selection strategies.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::common::RequestMeta;

use super::node::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    #[default]
    RoundRobin,
    Random,
    Hash,
    Fifo,
}

impl Strategy {
    pub fn from_name(name: &str) -> Self {
        match name {
            "rand" | "random" => Strategy::Random,
            "hash" => Strategy::Hash,
            "fifo" => Strategy::Fifo,
            _ => Strategy::RoundRobin,
        }
    }
}

/// Picks one node per request.
///
/// Selection is stateless apart from the round-robin counter, so it is
/// safe under concurrent calls and under replacement of the node set.
pub struct Selector {
    pub strategy: Strategy,
    pub max_fails: u32,
    pub fail_timeout: Duration,
    counter: AtomicUsize,
}

impl Default for Selector {
    fn default() -> Self {
        Self::new(Strategy::RoundRobin, 1, Duration::from_secs(30))
    }
}

impl Selector {
    pub fn new(strategy: Strategy, max_fails: u32, fail_timeout: Duration) -> Self {
        Self {
            strategy,
            max_fails,
            fail_timeout,
            counter: AtomicUsize::new(0),
        }
    }

    /// Select from `nodes`, honoring liveness and the request hash.
    ///
    /// A request carrying a hash key overrides the strategy with a
    /// deterministic hash over the live nodes. When every node is dead the
    /// first declared one is the fallback.
    pub fn select(&self, nodes: &[Arc<Node>], req: &RequestMeta) -> Option<Arc<Node>> {
        if nodes.is_empty() {
            return None;
        }

        let live: Vec<&Arc<Node>> = nodes
            .iter()
            .filter(|n| n.marker.is_live(self.max_fails, self.fail_timeout))
            .collect();
        if live.is_empty() {
            return Some(nodes[0].clone());
        }

        if let Some(key) = req.hash_key() {
            // rendezvous hashing: the winner only changes when the winner
            // itself leaves the live set
            let winner = live
                .iter()
                .max_by_key(|n| weight(&key, &n.name))
                .map(|n| (*n).clone());
            return winner;
        }

        let idx = match self.strategy {
            Strategy::RoundRobin => self.counter.fetch_add(1, Ordering::Relaxed) % live.len(),
            Strategy::Random => rand::thread_rng().gen_range(0..live.len()),
            Strategy::Fifo => 0,
            // hash strategy without a key behaves like fifo
            Strategy::Hash => 0,
        };
        Some(live[idx].clone())
    }
}

fn weight(key: &str, node: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    node.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;
    use crate::transport::{factories, ConnectorOptions, DialerOptions, Transport};

    fn node(name: &str) -> Arc<Node> {
        let transport = Arc::new(Transport {
            dialer: factories().dialer("tcp", &DialerOptions::default()).unwrap(),
            connector: factories()
                .connector("direct", &ConnectorOptions::default())
                .unwrap(),
            connect_timeout: None,
        });
        Arc::new(Node::new(name, Address::domain(name, 1080), transport))
    }

    #[test]
    fn test_round_robin_cycles() {
        let nodes = vec![node("a"), node("b")];
        let selector = Selector::default();
        let req = RequestMeta::default();

        let first = selector.select(&nodes, &req).unwrap().name.clone();
        let second = selector.select(&nodes, &req).unwrap().name.clone();
        assert_ne!(first, second);
        let third = selector.select(&nodes, &req).unwrap().name.clone();
        assert_eq!(first, third);
    }

    #[test]
    fn test_hash_stable_and_unaffected_by_other_nodes() {
        let nodes = vec![node("a"), node("b"), node("c")];
        let selector = Selector::new(Strategy::RoundRobin, 1, Duration::from_secs(30));
        let mut req = RequestMeta::default();
        req.hash = Some("client-42".to_string());

        let picked = selector.select(&nodes, &req).unwrap().name.clone();
        for _ in 0..10 {
            assert_eq!(selector.select(&nodes, &req).unwrap().name, picked);
        }

        // removing a non-selected node must not move the selection
        let not_picked = nodes.iter().find(|n| n.name != picked).unwrap().name.clone();
        let remaining: Vec<Arc<Node>> = nodes
            .iter()
            .filter(|n| n.name != not_picked)
            .cloned()
            .collect();
        assert_eq!(selector.select(&remaining, &req).unwrap().name, picked);
    }

    #[test]
    fn test_dead_nodes_skipped_and_fallback() {
        let nodes = vec![node("a"), node("b")];
        let selector = Selector::new(Strategy::Fifo, 1, Duration::from_secs(600));

        nodes[0].marker.mark_failed();
        let req = RequestMeta::default();
        assert_eq!(selector.select(&nodes, &req).unwrap().name, "b");

        // all dead: first declared wins
        nodes[1].marker.mark_failed();
        assert_eq!(selector.select(&nodes, &req).unwrap().name, "a");
    }
}
