//! Request fingerprint - the unified context for routing and selection
//!
//! Selectors and the router ONLY depend on RequestMeta, never on the stream.

use std::net::SocketAddr;

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Network {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" | "tcp4" | "tcp6" | "" => Ok(Network::Tcp),
            "udp" | "udp4" | "udp6" => Ok(Network::Udp),
            other => Err(crate::error::Error::Config(format!(
                "unknown network: {}",
                other
            ))),
        }
    }
}

/// Request fingerprint carried alongside every connection.
///
/// Used for selection hashing, bypass checks, sniff records and routing.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// Network type (TCP/UDP)
    pub network: Network,
    /// Source address of the client connection
    pub src_addr: Option<SocketAddr>,
    /// Authenticated client identity, if any
    pub client_id: Option<String>,
    /// Canonical target host:port
    pub host: String,
    /// Request path (HTTP-family protocols)
    pub path: String,
    /// Sniffed or declared application protocol
    pub proto: String,
    /// Explicit selection-hash key set by the handler (e.g. `hash=host`)
    pub hash: Option<String>,
}

impl RequestMeta {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            ..Default::default()
        }
    }

    /// Builder: set target host (canonicalized to lowercase host:port)
    pub fn with_host(mut self, host: impl AsRef<str>) -> Self {
        self.host = host.as_ref().to_lowercase();
        self
    }

    pub fn with_src(mut self, src: SocketAddr) -> Self {
        self.src_addr = Some(src);
        self
    }

    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// The key hashed by a `hash` selector. An explicit key set by the
    /// handler wins; otherwise client identity, then source IP.
    pub fn hash_key(&self) -> Option<String> {
        if let Some(h) = &self.hash {
            return Some(h.clone());
        }
        if let Some(id) = self.client_id.as_deref() {
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
        self.src_addr.map(|a| a.ip().to_string())
    }
}
