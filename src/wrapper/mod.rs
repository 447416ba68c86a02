//! Connection wrappers composed around every accepted connection.
//!
//! Listener-side order, outside-in:
//!
//! ```text
//! raw -> proxy-protocol decode -> metrics -> stats -> admission
//!     -> traffic-limit(service) -> conn-limit -> [TLS] -> handler
//! ```
//!
//! Handlers add a second, per-connection layer after parsing:
//! `stats(per-conn) -> traffic-limit(conn/client scope)`.
//!
//! Every wrapper passes reads and writes through unchanged apart from its
//! own concern; none of them buffers, so byte order is preserved.

mod conn_limit;
mod metrics;
mod proxy_proto;
mod stats;
mod traffic;

pub use conn_limit::ConnLimitStream;
pub use metrics::MetricsStream;
pub use proxy_proto::read_proxy_v1;
pub use stats::StatsStream;
pub use traffic::TrafficStream;
