//! Byte-counting wrapper feeding a `Stats` object.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::stats::{Kind, Stats};

/// Counts bytes read as InputBytes and bytes written as OutputBytes.
pub struct StatsStream<S> {
    inner: S,
    stats: Arc<Stats>,
}

impl<S> StatsStream<S> {
    pub fn new(inner: S, stats: Arc<Stats>) -> Self {
        Self { inner, stats }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for StatsStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = buf.filled().len() - before;
            if n > 0 {
                self.stats.add(Kind::InputBytes, n as i64);
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for StatsStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                self.stats.add(Kind::OutputBytes, *n as i64);
            }
        }
        result
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
    async fn test_counts_both_directions() {
        let (near, far) = tokio::io::duplex(256);
        let stats = Arc::new(Stats::new(false));
        let mut wrapped = StatsStream::new(near, stats.clone());

        let (mut fr, mut fw) = tokio::io::split(far);
        fw.write_all(b"12345").await.unwrap();

        let mut buf = [0u8; 16];
        let n = wrapped.read(&mut buf).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(stats.get(Kind::InputBytes), 5);

        wrapped.write_all(b"abc").await.unwrap();
        let mut out = [0u8; 3];
        fr.read_exact(&mut out).await.unwrap();
        assert_eq!(stats.get(Kind::OutputBytes), 3);
    }
}
