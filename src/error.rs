//! Error types for Viaduct

use thiserror::Error;

/// Main error type for Viaduct
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("bad version")]
    BadVersion,

    #[error("unknown command")]
    UnknownCmd,

    #[error("unauthorized")]
    Unauthorized,

    #[error("bypass")]
    Bypass,

    #[error("rate limit exceeded")]
    RateLimit,

    #[error("no route to {0}")]
    NoRoute(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

impl Error {
    /// Whether this error comes from the local policy layer rather than
    /// the network (bypass, rate limit, auth).
    pub fn is_policy(&self) -> bool {
        matches!(self, Error::Bypass | Error::RateLimit | Error::Unauthorized)
    }
}

/// Result type alias for Viaduct
pub type Result<T> = std::result::Result<T, Error>;
