//! Application-level connectors: the client half of each proxy protocol.

mod direct;
mod http;
mod relay;
mod socks5;
mod ss;

pub use direct::DirectConnector;
pub use http::HttpConnector;
pub use relay::RelayConnector;
pub use socks5::Socks5Connector;
pub use ss::{SsConnector, SsStream};
