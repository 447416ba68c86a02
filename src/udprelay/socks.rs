//! Datagram framings: SOCKS5 UDP and stream-framed UDP-over-TCP.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;

use crate::common::{socks_addr, Address, Result, Stream};
use crate::error::Error;

use super::PacketEndpoint;

/// Worst-case SOCKS5 UDP header: RSV(2) FRAG(1) ATYP(1) 255-byte domain + port
pub const SOCKS_UDP_HEADER_MAX: usize = 2 + 1 + 1 + 1 + 255 + 2;

/// SOCKS5 UDP-associate endpoint.
///
/// Client datagrams arrive framed `RSV(2) | FRAG(1) | ATYP | ADDR | PORT |
/// DATA`; fragments (FRAG != 0) are dropped. Replies are framed back to the
/// most recent client source address.
pub struct SocksUdpEndpoint {
    socket: UdpSocket,
    peer: Mutex<Option<SocketAddr>>,
}

impl SocksUdpEndpoint {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            peer: Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl PacketEndpoint for SocksUdpEndpoint {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let mut raw = vec![0u8; buf.len() + SOCKS_UDP_HEADER_MAX];
        loop {
            let (n, from) = self.socket.recv_from(&mut raw).await?;
            *self.peer.lock() = Some(from);

            let mut packet = &raw[..n];
            if packet.remaining() < 4 {
                continue; // malformed, ignore
            }
            packet.advance(2); // RSV
            let frag = packet.get_u8();
            if frag != 0 {
                continue; // no fragment reassembly
            }
            let dst = match socks_addr::decode_addr(&mut packet) {
                Ok(a) => a,
                Err(_) => continue,
            };
            let len = packet.remaining().min(buf.len());
            buf[..len].copy_from_slice(&packet[..len]);
            return Ok((len, dst));
        }
    }

    async fn send_to(&self, buf: &[u8], addr: &Address) -> Result<usize> {
        let peer = (*self.peer.lock())
            .ok_or_else(|| Error::Protocol("udp association has no client yet".into()))?;

        let mut packet = BytesMut::with_capacity(buf.len() + SOCKS_UDP_HEADER_MAX);
        packet.put_slice(&[0, 0, 0]); // RSV + FRAG
        socks_addr::encode_addr(addr, &mut packet);
        packet.put_slice(buf);

        self.socket.send_to(&packet, peer).await?;
        Ok(buf.len())
    }
}

/// Stream-framed datagram transport (UDP-over-TCP).
///
/// One datagram per frame: `ATYP | ADDR | PORT | LEN(2, BE) | DATA`. Used
/// by SOCKS5 UDP-tun, the relay protocol's associate command and udp
/// dialing through a chain.
pub struct StreamEndpoint {
    reader: tokio::sync::Mutex<ReadHalf<Stream>>,
    writer: tokio::sync::Mutex<WriteHalf<Stream>>,
}

impl StreamEndpoint {
    pub fn new(stream: Stream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
        }
    }
}

#[async_trait]
impl PacketEndpoint for StreamEndpoint {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let mut reader = self.reader.lock().await;
        let addr = socks_addr::read_addr(&mut *reader).await?;
        let len = reader.read_u16().await? as usize;

        if len > buf.len() {
            // datagram larger than the relay buffer: truncate is not an
            // option for packet semantics, drain and report
            let mut sink = vec![0u8; len];
            reader.read_exact(&mut sink).await?;
            return Err(Error::Protocol(format!(
                "datagram of {} bytes exceeds buffer",
                len
            )));
        }

        reader.read_exact(&mut buf[..len]).await?;
        Ok((len, addr))
    }

    async fn send_to(&self, buf: &[u8], addr: &Address) -> Result<usize> {
        let mut frame = BytesMut::with_capacity(buf.len() + SOCKS_UDP_HEADER_MAX);
        socks_addr::encode_addr(addr, &mut frame);
        frame.put_u16(buf.len() as u16);
        frame.put_slice(buf);

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::StreamConn;

    #[tokio::test]
    async fn test_stream_endpoint_roundtrip() {
        let (near, far) = tokio::io::duplex(4096);
        let a = StreamEndpoint::new(near.boxed());
        let b = StreamEndpoint::new(far.boxed());

        let dst = Address::domain("echo.example", 7);
        a.send_to(b"ping", &dst).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, addr) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(addr, dst);
    }

    #[tokio::test]
    async fn test_socks_framing_roundtrip() {
        let service = SocksUdpEndpoint::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let service_addr = service.local_addr().unwrap();

        // client sends a framed datagram for 198.51.100.1:53
        let mut framed = BytesMut::new();
        framed.put_slice(&[0, 0, 0]);
        socks_addr::encode_addr(&Address::Socket("198.51.100.1:53".parse().unwrap()), &mut framed);
        framed.put_slice(b"query");
        client.send_to(&framed, service_addr).await.unwrap();

        let mut buf = [0u8; 128];
        let (n, dst) = service.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"query");
        assert_eq!(dst, Address::Socket("198.51.100.1:53".parse().unwrap()));

        // reply flows back framed to the same client
        service
            .send_to(b"answer", &Address::Socket("198.51.100.1:53".parse().unwrap()))
            .await
            .unwrap();
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        let mut packet = &buf[..n];
        packet.advance(3);
        let from = socks_addr::decode_addr(&mut packet).unwrap();
        assert_eq!(from, Address::Socket("198.51.100.1:53".parse().unwrap()));
        assert_eq!(packet, &b"answer"[..]);
    }

    #[tokio::test]
    async fn test_fragmented_packets_ignored() {
        let service = SocksUdpEndpoint::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let service_addr = service.local_addr().unwrap();

        // FRAG = 1 first, then a whole datagram
        let mut frag = BytesMut::new();
        frag.put_slice(&[0, 0, 1]);
        socks_addr::encode_addr(&Address::Socket("198.51.100.1:53".parse().unwrap()), &mut frag);
        frag.put_slice(b"dropped");
        client.send_to(&frag, service_addr).await.unwrap();

        let mut whole = BytesMut::new();
        whole.put_slice(&[0, 0, 0]);
        socks_addr::encode_addr(&Address::Socket("198.51.100.1:53".parse().unwrap()), &mut whole);
        whole.put_slice(b"kept");
        client.send_to(&whole, service_addr).await.unwrap();

        let mut buf = [0u8; 128];
        let (n, _) = service.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"kept");
    }
}
