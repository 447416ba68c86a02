//! Core types shared by every layer: Stream, Address, RequestMeta.

mod address;
mod metadata;
mod pipe;
mod prefixed;
pub mod socks_addr;
mod stream;

pub use address::Address;
pub use metadata::{Network, RequestMeta};
pub use pipe::{pipe, PIPE_BUFFER_SIZE};
pub use prefixed::PrefixedStream;
pub use stream::{Stream, StreamConn};

pub use crate::error::{Error, Result};
