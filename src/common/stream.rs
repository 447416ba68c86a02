//! Type-erased connection streams.
//!
//! Handlers, wrappers, connectors and the sniffer all trade in `Stream`;
//! nothing downstream of the accept loop sees a concrete socket type.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

/// Type-erased bidirectional byte stream.
pub type Stream = Box<dyn StreamConn>;

impl fmt::Debug for dyn StreamConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamConn")
    }
}

/// Anything usable as a full-duplex conn: readable, writable, and movable
/// across tasks. Carrying `Send + Unpin` as supertraits keeps the bounds on
/// `dyn StreamConn` itself, so the boxed form works everywhere tokio's
/// split/copy machinery expects them.
pub trait StreamConn: AsyncRead + AsyncWrite + Send + Unpin {
    /// Erase the concrete conn type.
    fn boxed(self) -> Stream
    where
        Self: Sized + 'static,
    {
        Box::new(self)
    }
}

impl<T> StreamConn for T where T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized {}
