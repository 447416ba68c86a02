//! Chain - an ordered dialing pipeline of hops.
//!
//! Dialing selects one node per hop, dials the first node with its own
//! dialer, then extends the conn hop by hop with each node's connector.
//! The last node's connector finally reaches the target.

mod hop;
mod node;
mod selector;

pub use hop::Hop;
pub use node::{Marker, Node, NodeFilter};
pub use selector::{Selector, Strategy};

use std::sync::Arc;

use tracing::debug;

use crate::common::{Address, Network, RequestMeta, Result, Stream};
use crate::error::Error;
use crate::metrics::CHAIN_DIAL_FAILURES;
use crate::transport::{Dialer, TcpDialer, UdpDialer};

pub struct Chain {
    pub name: String,
    hops: Vec<Arc<Hop>>,
}

impl Chain {
    pub fn new(name: impl Into<String>, hops: Vec<Arc<Hop>>) -> Self {
        Self {
            name: name.into(),
            hops,
        }
    }

    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn hops(&self) -> &[Arc<Hop>] {
        &self.hops
    }

    /// Dial `address` over `network` through the chain.
    ///
    /// Returns the layered conn and a route description for the recorder.
    /// The chain never retries; a failed hop is marked and the error
    /// surfaces to the caller.
    pub async fn dial(
        &self,
        network: Network,
        address: &Address,
        req: &RequestMeta,
    ) -> Result<(Stream, String)> {
        if self.hops.is_empty() {
            let stream = match network {
                Network::Tcp => TcpDialer.dial(address).await?,
                Network::Udp => UdpDialer.dial(address).await?,
            };
            return Ok((stream, String::new()));
        }

        // one node per hop, selected against the request target
        let mut sel_req = req.clone();
        sel_req.host = address.canonical();
        let mut route: Vec<Arc<Node>> = Vec::with_capacity(self.hops.len());
        for hop in &self.hops {
            match hop.select(&sel_req) {
                Some(node) => route.push(node),
                None => {
                    CHAIN_DIAL_FAILURES.with_label_values(&[&self.name]).inc();
                    return Err(Error::NoRoute(format!(
                        "{} (hop {} has no node)",
                        address, hop.name
                    )));
                }
            }
        }

        let first = &route[0];
        debug!("chain {}: dial {} via {}", self.name, address, first.name);
        let mut stream = match first.transport.dial(&first.addr).await {
            Ok(s) => s,
            Err(e) => {
                first.marker.mark_failed();
                CHAIN_DIAL_FAILURES.with_label_values(&[&self.name]).inc();
                return Err(e);
            }
        };

        // extend hop by hop; intermediate links are always tcp streams
        for i in 0..route.len() - 1 {
            let node = &route[i];
            let next = &route[i + 1];
            stream = match node
                .transport
                .connector
                .connect(stream, Network::Tcp, &next.addr, req)
                .await
            {
                Ok(s) => {
                    node.marker.reset();
                    s
                }
                Err(e) => {
                    node.marker.mark_failed();
                    CHAIN_DIAL_FAILURES.with_label_values(&[&self.name]).inc();
                    return Err(e);
                }
            };
        }

        let last = route[route.len() - 1].clone();
        let stream = match last
            .transport
            .connector
            .connect(stream, network, address, req)
            .await
        {
            Ok(s) => {
                last.marker.reset();
                s
            }
            Err(e) => {
                last.marker.mark_failed();
                CHAIN_DIAL_FAILURES.with_label_values(&[&self.name]).inc();
                return Err(e);
            }
        };

        let route_desc = route
            .iter()
            .map(|n| n.name.as_str())
            .collect::<Vec<_>>()
            .join(" -> ");
        Ok((stream, route_desc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{factories, ConnectorOptions, DialerOptions, Transport};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Dialer that records which node address was dialed and hands out an
    /// in-memory stream.
    struct FakeDialer {
        dialed: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        async fn dial(&self, addr: &Address) -> Result<Stream> {
            self.dialed.lock().push(addr.to_string());
            let (near, _far) = tokio::io::duplex(16);
            Ok(Box::new(near))
        }
    }

    /// Connector that records the address it was asked to reach.
    struct FakeConnector {
        connected: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl crate::transport::Connector for FakeConnector {
        async fn connect(
            &self,
            stream: Stream,
            _network: Network,
            address: &Address,
            _req: &RequestMeta,
        ) -> Result<Stream> {
            self.connected.lock().push(address.to_string());
            Ok(stream)
        }
    }

    fn tracked_node(
        name: &str,
        dialed: Arc<Mutex<Vec<String>>>,
        connected: Arc<Mutex<Vec<String>>>,
    ) -> Arc<Node> {
        let transport = Arc::new(Transport {
            dialer: Arc::new(FakeDialer { dialed }),
            connector: Arc::new(FakeConnector { connected }),
            connect_timeout: None,
        });
        Arc::new(Node::new(name, Address::domain(name, 1), transport))
    }

    #[tokio::test]
    async fn test_two_hop_round_robin_paths() {
        let dialed = Arc::new(Mutex::new(Vec::new()));
        let connected = Arc::new(Mutex::new(Vec::new()));

        let a = tracked_node("a", dialed.clone(), connected.clone());
        let b = tracked_node("b", dialed.clone(), connected.clone());
        let c = tracked_node("c", dialed.clone(), connected.clone());

        let h1 = Arc::new(Hop::new(
            "h1",
            vec![a.clone(), b.clone()],
            Selector::new(Strategy::RoundRobin, 1, Duration::from_secs(30)),
        ));
        let h2 = Arc::new(Hop::new(
            "h2",
            vec![c],
            Selector::new(Strategy::Fifo, 1, Duration::from_secs(30)),
        ));
        let chain = Chain::new("test", vec![h1, h2]);

        let req = RequestMeta::new(Network::Tcp);
        let target = Address::domain("target.example", 80);

        let (_s1, route1) = chain.dial(Network::Tcp, &target, &req).await.unwrap();
        let (_s2, route2) = chain.dial(Network::Tcp, &target, &req).await.unwrap();

        // round-robin on the first hop: the two dials entered at a and b
        let mut entries: Vec<String> = vec![route1, route2];
        entries.sort();
        assert_eq!(entries, vec!["a -> c", "b -> c"]);

        // dead-marking a forces both subsequent dials through b
        a.marker.mark_failed();
        let (_s3, route3) = chain.dial(Network::Tcp, &target, &req).await.unwrap();
        let (_s4, route4) = chain.dial(Network::Tcp, &target, &req).await.unwrap();
        assert_eq!(route3, "b -> c");
        assert_eq!(route4, "b -> c");
    }

    #[tokio::test]
    async fn test_empty_hop_is_no_route() {
        let hop = Arc::new(Hop::new("empty", vec![], Selector::default()));
        let chain = Chain::new("test", vec![hop]);
        let err = chain
            .dial(
                Network::Tcp,
                &Address::domain("x", 1),
                &RequestMeta::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoRoute(_)));
    }

    #[test]
    fn test_factories_available_for_chain_nodes() {
        // chains are built from registry factories at load time
        assert!(factories().dialer("tls", &DialerOptions::default()).is_ok());
        assert!(factories()
            .connector("relay", &ConnectorOptions::default())
            .is_ok());
    }
}
