//! Viaduct - a pluggable multi-protocol proxy and tunnel engine
//!
//! # Architecture
//!
//! ```text
//! Listener -> Accept -> wrappers -> Handler -> parse -> authenticate
//!          -> Router -> Chain -> Dialer/Connector -> upstream conn
//!          -> Pipe / UDP relay / Sniff+MITM -> close -> Recorder
//! ```
//!
//! ## Core Principles
//!
//! - Components are named and live in registries; connections dereference
//!   by name at request time, so reloads never dangle
//! - Handlers only see `Stream` + `RequestMeta`; transports are pluggable
//!   through dialer/connector factories
//! - Every accepted connection is accounted (stats, metrics, recorder)
//!   until it closes
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Stream, Address, RequestMeta, pipe
//! ├── wrapper/         # per-connection adapters (stats, limits, proxy-protocol)
//! ├── limiter/         # traffic / rate / connection limiting
//! ├── chain/           # chains, hops, nodes, selectors
//! ├── transport/       # dialers + factory registries
//! ├── connector/       # client-side protocol handshakes
//! ├── router/          # ingress rewrite, resolution, chain dialing
//! ├── udprelay/        # packet pump and datagram framings
//! ├── sniff/           # protocol sniffing and TLS MITM
//! ├── handler/         # inbound protocol state machines
//! ├── service.rs       # accept loops
//! ├── registry.rs      # named component registries
//! └── app/             # runtime assembly, reload, control API
//! ```

pub mod admission;
pub mod auth;
pub mod bypass;
pub mod chain;
pub mod common;
pub mod config;
pub mod connector;
pub mod crypto;
pub mod error;
pub mod handler;
pub mod ingress;
pub mod limiter;
pub mod metrics;
pub mod observer;
pub mod recorder;
pub mod registry;
pub mod relay;
pub mod resolver;
pub mod router;
pub mod service;
pub mod sniff;
pub mod stats;
pub mod transport;
pub mod udprelay;
pub mod wrapper;

pub mod app;

// Re-exports for convenience
pub use app::Runtime;
pub use common::{Address, Network, RequestMeta, Stream};
pub use config::Config;
pub use error::{Error, Result};
pub use router::Router;
pub use service::Service;
