//! Outbound transport layer: dialers and the factory registries.
//!
//! A `Dialer` produces a raw stream to an address; a `Connector` performs
//! the application handshake over an already-dialed stream. A node's
//! `Transport` pairs one of each, plus the dial timeout.

mod tcp;
mod tls;
mod udp;

pub use tcp::TcpDialer;
pub use tls::{
    ensure_crypto_provider, insecure_verifier as tls_insecure_verifier, TlsClientConfig, TlsDialer,
};
pub use udp::{UdpDialer, UdpStream};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use parking_lot::RwLock;

use crate::common::{Address, Network, RequestMeta, Result, Stream};
use crate::error::Error;

/// Network-level client producing a raw conn to an address.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &Address) -> Result<Stream>;
}

/// Application-level client performing the per-protocol handshake
/// (SOCKS5 CONNECT, relay request, ...) over an already-dialed conn.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        stream: Stream,
        network: Network,
        address: &Address,
        req: &RequestMeta,
    ) -> Result<Stream>;
}

/// The transport stack that turns a Node into a usable conn.
pub struct Transport {
    pub dialer: Arc<dyn Dialer>,
    pub connector: Arc<dyn Connector>,
    pub connect_timeout: Option<Duration>,
}

impl Transport {
    /// Dial the node address, honoring the configured connect timeout.
    pub async fn dial(&self, addr: &Address) -> Result<Stream> {
        match self.connect_timeout {
            Some(t) => tokio::time::timeout(t, self.dialer.dial(addr))
                .await
                .map_err(|_| Error::Timeout)?,
            None => self.dialer.dial(addr).await,
        }
    }
}

/// Options handed to a dialer factory.
#[derive(Default, Clone)]
pub struct DialerOptions {
    pub tls: Option<TlsClientConfig>,
}

/// Options handed to a connector factory.
#[derive(Default, Clone)]
pub struct ConnectorOptions {
    pub auth: Option<(String, String)>,
    pub cipher: Option<String>,
    pub password: Option<String>,
}

type DialerFactory = Arc<dyn Fn(&DialerOptions) -> Result<Arc<dyn Dialer>> + Send + Sync>;
type ConnectorFactory = Arc<dyn Fn(&ConnectorOptions) -> Result<Arc<dyn Connector>> + Send + Sync>;

/// Named factory registry for dialers and connectors.
///
/// Built-in kinds are registered at startup; plugins may add their own.
pub struct FactoryRegistry {
    dialers: RwLock<HashMap<String, DialerFactory>>,
    connectors: RwLock<HashMap<String, ConnectorFactory>>,
}

impl FactoryRegistry {
    fn new() -> Self {
        Self {
            dialers: RwLock::new(HashMap::new()),
            connectors: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_dialer(&self, kind: &str, factory: DialerFactory) {
        self.dialers.write().insert(kind.to_string(), factory);
    }

    pub fn register_connector(&self, kind: &str, factory: ConnectorFactory) {
        self.connectors.write().insert(kind.to_string(), factory);
    }

    pub fn dialer(&self, kind: &str, opts: &DialerOptions) -> Result<Arc<dyn Dialer>> {
        let factory = self
            .dialers
            .read()
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown dialer: {}", kind)))?;
        factory(opts)
    }

    pub fn connector(&self, kind: &str, opts: &ConnectorOptions) -> Result<Arc<dyn Connector>> {
        let factory = self
            .connectors
            .read()
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown connector: {}", kind)))?;
        factory(opts)
    }

    pub fn is_registered_dialer(&self, kind: &str) -> bool {
        self.dialers.read().contains_key(kind)
    }
}

lazy_static! {
    static ref FACTORIES: FactoryRegistry = {
        let reg = FactoryRegistry::new();
        register_builtin(&reg);
        reg
    };
}

pub fn factories() -> &'static FactoryRegistry {
    &FACTORIES
}

fn register_builtin(reg: &FactoryRegistry) {
    reg.register_dialer(
        "tcp",
        Arc::new(|_: &DialerOptions| Ok(Arc::new(TcpDialer) as Arc<dyn Dialer>)),
    );
    reg.register_dialer(
        "udp",
        Arc::new(|_: &DialerOptions| Ok(Arc::new(UdpDialer) as Arc<dyn Dialer>)),
    );
    reg.register_dialer(
        "tls",
        Arc::new(|opts: &DialerOptions| {
            let cfg = opts.tls.clone().unwrap_or_default();
            Ok(Arc::new(TlsDialer::new(Arc::new(TcpDialer), cfg)?) as Arc<dyn Dialer>)
        }),
    );

    reg.register_connector(
        "direct",
        Arc::new(|_: &ConnectorOptions| {
            Ok(Arc::new(crate::connector::DirectConnector) as Arc<dyn Connector>)
        }),
    );
    reg.register_connector(
        "http",
        Arc::new(|opts: &ConnectorOptions| {
            Ok(Arc::new(crate::connector::HttpConnector::new(opts.auth.clone()))
                as Arc<dyn Connector>)
        }),
    );
    reg.register_connector(
        "socks5",
        Arc::new(|opts: &ConnectorOptions| {
            Ok(Arc::new(crate::connector::Socks5Connector::new(opts.auth.clone()))
                as Arc<dyn Connector>)
        }),
    );
    reg.register_connector(
        "relay",
        Arc::new(|opts: &ConnectorOptions| {
            Ok(Arc::new(crate::connector::RelayConnector::new(opts.auth.clone()))
                as Arc<dyn Connector>)
        }),
    );
    reg.register_connector(
        "ss",
        Arc::new(|opts: &ConnectorOptions| {
            let cipher = opts.cipher.as_deref().unwrap_or("chacha20-ietf-poly1305");
            let password = opts.password.as_deref().unwrap_or_default();
            Ok(Arc::new(crate::connector::SsConnector::new(cipher, password)?)
                as Arc<dyn Connector>)
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_factories_registered() {
        let reg = factories();
        assert!(reg.is_registered_dialer("tcp"));
        assert!(reg.is_registered_dialer("tls"));
        assert!(reg.dialer("tcp", &DialerOptions::default()).is_ok());
        assert!(reg.connector("direct", &ConnectorOptions::default()).is_ok());
        assert!(reg.dialer("nope", &DialerOptions::default()).is_err());
    }
}
