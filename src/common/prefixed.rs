//! Put-back stream: replays already-consumed bytes before the live stream.
//!
//! The sniffer reads a prefix off a fresh connection to classify it; the
//! prefix is handed back through this wrapper so the upstream sees the
//! original byte sequence untouched.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::stream::Stream;

/// A stream with a replayed prefix. Writes pass straight through.
pub struct PrefixedStream {
    prefix: Bytes,
    inner: Stream,
}

impl PrefixedStream {
    pub fn new(prefix: impl Into<Bytes>, inner: Stream) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    /// Bytes still pending replay.
    pub fn remaining_prefix(&self) -> usize {
        self.prefix.len()
    }
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_prefix_replayed_before_inner() {
        let (near, far) = tokio::io::duplex(64);
        let mut s = PrefixedStream::new(&b"GET "[..], Box::new(near) as Stream);

        let (_, mut fw) = tokio::io::split(far);
        fw.write_all(b"/ HTTP/1.1").await.unwrap();
        fw.shutdown().await.unwrap();

        let mut out = Vec::new();
        s.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"GET / HTTP/1.1");
    }

    #[tokio::test]
    async fn test_small_read_buffer_drains_prefix() {
        let (near, far) = tokio::io::duplex(64);
        drop(far);
        let mut s = PrefixedStream::new(&b"abcdef"[..], Box::new(near) as Stream);

        let mut buf = [0u8; 4];
        let n = s.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        assert_eq!(s.remaining_prefix(), 2);
    }
}
