//! Shadowsocks AEAD packet endpoint.
//!
//! Each datagram on the wire is `salt | AEAD(ATYP | ADDR | PORT | DATA)`
//! with an all-zero nonce (the salt is fresh per packet).

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use rand::RngCore;
use tokio::net::UdpSocket;

use crate::common::{socks_addr, Address, Result};
use crate::crypto::{self, Aead, CipherKind, NONCE_SIZE};
use crate::error::Error;

use super::PacketEndpoint;

pub struct SsPacketEndpoint {
    socket: UdpSocket,
    kind: CipherKind,
    master_key: Vec<u8>,
    peer: Mutex<Option<SocketAddr>>,
}

impl SsPacketEndpoint {
    pub fn new(socket: UdpSocket, kind: CipherKind, master_key: Vec<u8>) -> Self {
        Self {
            socket,
            kind,
            master_key,
            peer: Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn open_packet(&self, raw: &[u8]) -> Result<(Address, Vec<u8>)> {
        open_ss_packet(self.kind, &self.master_key, raw)
    }

    fn seal_packet(&self, addr: &Address, payload: &[u8]) -> Result<Vec<u8>> {
        seal_ss_packet(self.kind, &self.master_key, addr, payload)
    }
}

/// Decrypt one wire packet into (address, payload).
pub fn open_ss_packet(kind: CipherKind, master: &[u8], raw: &[u8]) -> Result<(Address, Vec<u8>)> {
    let salt_len = kind.key_size();
    if raw.len() < salt_len {
        return Err(Error::Protocol("short ss packet".into()));
    }
    let (salt, sealed) = raw.split_at(salt_len);
    let cipher = crypto::session_cipher(kind, master, salt)?;
    let plain = cipher.open(&[0u8; NONCE_SIZE], sealed)?;

    let mut cursor = &plain[..];
    let addr = socks_addr::decode_addr(&mut cursor)?;
    Ok((addr, cursor.to_vec()))
}

/// Encrypt (address, payload) into one wire packet with a fresh salt.
pub fn seal_ss_packet(
    kind: CipherKind,
    master: &[u8],
    addr: &Address,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let mut salt = vec![0u8; kind.key_size()];
    rand::thread_rng().fill_bytes(&mut salt);
    let cipher = crypto::session_cipher(kind, master, &salt)?;

    let mut plain = BytesMut::with_capacity(payload.len() + 32);
    socks_addr::encode_addr(addr, &mut plain);
    plain.put_slice(payload);

    let sealed = cipher.seal(&[0u8; NONCE_SIZE], &plain)?;
    let mut packet = salt;
    packet.extend_from_slice(&sealed);
    Ok(packet)
}

#[async_trait]
impl PacketEndpoint for SsPacketEndpoint {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let mut raw = vec![0u8; 65535];
        loop {
            let (n, from) = self.socket.recv_from(&mut raw).await?;
            *self.peer.lock() = Some(from);

            match self.open_packet(&raw[..n]) {
                Ok((addr, payload)) => {
                    let len = payload.len().min(buf.len());
                    buf[..len].copy_from_slice(&payload[..len]);
                    return Ok((len, addr));
                }
                // undecryptable packets are dropped, not fatal
                Err(_) => continue,
            }
        }
    }

    async fn send_to(&self, buf: &[u8], addr: &Address) -> Result<usize> {
        let peer = (*self.peer.lock())
            .ok_or_else(|| Error::Protocol("ss association has no client yet".into()))?;
        let packet = self.seal_packet(addr, buf)?;
        self.socket.send_to(&packet, peer).await?;
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_packet_seal_open() {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let kind = CipherKind::Aes256Gcm;
        let key = crypto::derive_key("pw", kind.key_size());
        let ep = SsPacketEndpoint::new(sock, kind, key);

        let addr = Address::domain("dns.example", 53);
        let packet = ep.seal_packet(&addr, b"query").unwrap();
        let (got_addr, payload) = ep.open_packet(&packet).unwrap();
        assert_eq!(got_addr, addr);
        assert_eq!(payload, b"query");
    }

    #[tokio::test]
    async fn test_garbage_packet_rejected() {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let kind = CipherKind::Aes128Gcm;
        let ep = SsPacketEndpoint::new(sock, kind, crypto::derive_key("pw", 16));
        assert!(ep.open_packet(&[0u8; 64]).is_err());
        assert!(ep.open_packet(&[0u8; 4]).is_err());
    }
}
