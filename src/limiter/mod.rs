//! Rate, traffic and connection limiters.
//!
//! Traffic limiting is byte-budget based (token bucket per scope); rate
//! limiting bounds connection attempts per client host; the connection
//! limiter caps concurrently active connections per key.

mod conn;
mod rate;
mod traffic;

pub use conn::ConnLimiter;
pub use rate::RateLimiter;
pub use traffic::{Bucket, BucketPair, TrafficLimiter};

/// Budget scope for the traffic limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// One shared budget for the whole service
    Service,
    /// Budget per authenticated client
    Client,
    /// Budget per connection, keyed by remote address
    Conn,
}
