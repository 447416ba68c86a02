//! Connection-limit wrapper: releases its slot exactly once on drop.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::limiter::ConnLimiter;

pub struct ConnLimitStream<S> {
    inner: S,
    limiter: Arc<ConnLimiter>,
    key: String,
    released: bool,
}

impl<S> ConnLimitStream<S> {
    /// The caller must already hold a slot (`limiter.allow(key, 1)` at
    /// accept time); this wrapper owns the release.
    pub fn new(inner: S, limiter: Arc<ConnLimiter>, key: impl Into<String>) -> Self {
        Self {
            inner,
            limiter,
            key: key.into(),
            released: false,
        }
    }
}

impl<S> Drop for ConnLimitStream<S> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.limiter.allow(&self.key, -1);
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ConnLimitStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ConnLimitStream<S> {
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

    #[tokio::test]
    async fn test_slot_released_on_drop() {
        let limiter = Arc::new(ConnLimiter::new(1));
        assert!(limiter.allow("1.2.3.4", 1));

        let (near, _far) = tokio::io::duplex(16);
        let wrapped = ConnLimitStream::new(near, limiter.clone(), "1.2.3.4");
        assert!(!limiter.allow("1.2.3.4", 1));

        drop(wrapped);
        assert_eq!(limiter.active("1.2.3.4"), 0);
        assert!(limiter.allow("1.2.3.4", 1));
    }
}
