//! UDP dialer: a connected socket behind the stream abstraction.
//!
//! Polls map one-to-one onto datagram operations: each read yields at most
//! one datagram, each write sends exactly one, so record boundaries survive
//! the type erasure. A datagram larger than the caller's buffer is cut to
//! it, matching native socket semantics; the relay paths size their buffers
//! from the `udprelay` budget, which caps at the 64KB datagram maximum.

use async_trait::async_trait;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;

use crate::common::{Address, Result, Stream};

use super::Dialer;

pub struct UdpDialer;

#[async_trait]
impl Dialer for UdpDialer {
    async fn dial(&self, addr: &Address) -> Result<Stream> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        match addr {
            Address::Socket(sa) => socket.connect(sa).await?,
            Address::Domain(domain, port) => {
                socket.connect((domain.as_str(), *port)).await?
            }
        }
        Ok(Box::new(UdpStream::from(socket)))
    }
}

/// Connected UDP socket as a Stream. Unbuffered by design.
pub struct UdpStream(UdpSocket);

impl From<UdpSocket> for UdpStream {
    fn from(socket: UdpSocket) -> Self {
        Self(socket)
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.0.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_datagram_boundaries_preserved() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let mut stream = match UdpDialer
            .dial(&Address::Socket(peer_addr))
            .await
        {
            Ok(s) => s,
            Err(e) => panic!("dial: {}", e),
        };

        stream.write_all(b"first").await.unwrap();
        stream.write_all(b"second datagram").await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"first");
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"second datagram");

        // a reply comes back as one read
        peer.send_to(b"pong", from).await.unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }
}
