//! Hop - a selectable set of nodes.

use std::sync::Arc;

use crate::bypass::Bypass;
use crate::common::RequestMeta;

use super::node::Node;
use super::selector::Selector;

pub struct Hop {
    pub name: String,
    nodes: Vec<Arc<Node>>,
    selector: Selector,
    bypass: Option<Arc<Bypass>>,
    /// When set, nodes whose filter rejects the request are kept in the
    /// candidate set anyway.
    ignore_filter: bool,
}

impl Hop {
    pub fn new(name: impl Into<String>, nodes: Vec<Arc<Node>>, selector: Selector) -> Self {
        Self {
            name: name.into(),
            nodes,
            selector,
            bypass: None,
            ignore_filter: false,
        }
    }

    pub fn with_bypass(mut self, bypass: Arc<Bypass>) -> Self {
        self.bypass = Some(bypass);
        self
    }

    pub fn with_ignore_filter(mut self, ignore: bool) -> Self {
        self.ignore_filter = ignore;
        self
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Select one node for the request, or None when the hop opts out
    /// (bypassed target or no candidate).
    pub fn select(&self, req: &RequestMeta) -> Option<Arc<Node>> {
        if let Some(bypass) = &self.bypass {
            if !req.host.is_empty() && bypass.contains(req.network, &req.host) {
                return None;
            }
        }

        if self.ignore_filter {
            return self.selector.select(&self.nodes, req);
        }

        let candidates: Vec<Arc<Node>> = self
            .nodes
            .iter()
            .filter(|n| n.filter.is_empty() || n.filter.matches(req))
            .cloned()
            .collect();
        self.selector.select(&candidates, req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::node::NodeFilter;
    use crate::chain::selector::Strategy;
    use crate::common::{Address, Network};
    use crate::transport::{factories, ConnectorOptions, DialerOptions, Transport};
    use std::time::Duration;

    fn node(name: &str, filter: NodeFilter) -> Arc<Node> {
        let transport = Arc::new(Transport {
            dialer: factories().dialer("tcp", &DialerOptions::default()).unwrap(),
            connector: factories()
                .connector("direct", &ConnectorOptions::default())
                .unwrap(),
            connect_timeout: None,
        });
        Arc::new(Node::new(name, Address::domain(name, 1080), transport).with_filter(filter))
    }

    #[test]
    fn test_filter_restricts_candidates() {
        let a = node(
            "a",
            NodeFilter {
                host: Some("internal.example".to_string()),
                ..Default::default()
            },
        );
        let b = node("b", NodeFilter::default());
        let hop = Hop::new(
            "h",
            vec![a, b],
            Selector::new(Strategy::Fifo, 1, Duration::from_secs(30)),
        );

        let mut req = RequestMeta::new(Network::Tcp);
        req.host = "other.example:80".into();
        assert_eq!(hop.select(&req).unwrap().name, "b");

        req.host = "internal.example:80".into();
        assert_eq!(hop.select(&req).unwrap().name, "a");
    }

    #[test]
    fn test_bypassed_target_selects_nothing() {
        let hop = Hop::new(
            "h",
            vec![node("a", NodeFilter::default())],
            Selector::default(),
        )
        .with_bypass(Arc::new(Bypass::new(&["skip.example".to_string()], false)));

        let mut req = RequestMeta::new(Network::Tcp);
        req.host = "skip.example:80".into();
        assert!(hop.select(&req).is_none());

        req.host = "keep.example:80".into();
        assert!(hop.select(&req).is_some());
    }
}
