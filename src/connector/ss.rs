//! Shadowsocks client connector: AEAD-chunked TCP stream.
//!
//! Wire format per direction: `salt | chunk...` where each chunk is
//! `AEAD(len, 2) | AEAD(payload, len)` and the nonce is a little-endian
//! counter incremented after every seal/open.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::common::{socks_addr, Address, Network, RequestMeta, Result, Stream};
use crate::crypto::{self, Aead, AeadCipher, CipherKind, NONCE_SIZE, TAG_SIZE};
use crate::error::Error;
use crate::transport::Connector;

/// Maximum payload per chunk (14 bits, per the shadowsocks AEAD spec)
const MAX_CHUNK: usize = 0x3FFF;

pub struct SsConnector {
    kind: CipherKind,
    master_key: Vec<u8>,
}

impl SsConnector {
    pub fn new(cipher: &str, password: &str) -> Result<Self> {
        let kind = CipherKind::from_name(cipher)?;
        let master_key = crypto::derive_key(password, kind.key_size());
        Ok(Self { kind, master_key })
    }
}

#[async_trait]
impl Connector for SsConnector {
    async fn connect(
        &self,
        stream: Stream,
        network: Network,
        address: &Address,
        _req: &RequestMeta,
    ) -> Result<Stream> {
        if network != Network::Tcp {
            return Err(Error::Unsupported(
                "ss connector handles tcp streams only".into(),
            ));
        }

        let mut ss = SsStream::new(stream, self.kind, self.master_key.clone());

        // the target address is the first thing inside the cipher stream
        let mut head = BytesMut::new();
        socks_addr::encode_addr(address, &mut head);
        ss.write_all(&head).await?;
        ss.flush().await?;

        Ok(Box::new(ss))
    }
}

enum WriteState {
    Init,
    Ready { cipher: AeadCipher, nonce: [u8; NONCE_SIZE] },
}

enum ReadState {
    WaitSalt,
    WaitLen { cipher: AeadCipher, nonce: [u8; NONCE_SIZE] },
    WaitPayload {
        cipher: AeadCipher,
        nonce: [u8; NONCE_SIZE],
        len: usize,
    },
}

/// AEAD stream codec over any inner stream.
pub struct SsStream<S> {
    inner: S,
    kind: CipherKind,
    master_key: Vec<u8>,
    write: WriteState,
    pending: BytesMut,
    read: Option<ReadState>,
    raw: BytesMut,
    plain: BytesMut,
    eof: bool,
}

impl<S> SsStream<S> {
    pub fn new(inner: S, kind: CipherKind, master_key: Vec<u8>) -> Self {
        Self {
            inner,
            kind,
            master_key,
            write: WriteState::Init,
            pending: BytesMut::new(),
            read: Some(ReadState::WaitSalt),
            raw: BytesMut::new(),
            plain: BytesMut::new(),
            eof: false,
        }
    }
}

fn bump_nonce(nonce: &mut [u8; NONCE_SIZE]) {
    for b in nonce.iter_mut() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            break;
        }
    }
}

impl<S: AsyncWrite + Unpin> SsStream<S> {
    /// Push buffered ciphertext into the inner stream. Returns true when
    /// the buffer is fully drained.
    fn drain_pending(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<bool>> {
        while !self.pending.is_empty() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.pending) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()))
                }
                Poll::Ready(Ok(n)) => {
                    self.pending.advance(n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Ready(Ok(false)),
            }
        }
        Poll::Ready(Ok(true))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        // backpressure: never grow the ciphertext buffer without bound
        if !this.pending.is_empty() {
            match this.drain_pending(cx)? {
                Poll::Ready(true) => {}
                _ => {
                    if this.pending.len() > 4 * MAX_CHUNK {
                        return Poll::Pending;
                    }
                }
            }
        }

        if let WriteState::Init = this.write {
            let mut salt = vec![0u8; this.kind.key_size()];
            rand::thread_rng().fill_bytes(&mut salt);
            let cipher = crypto::session_cipher(this.kind, &this.master_key, &salt)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            this.pending.put_slice(&salt);
            this.write = WriteState::Ready {
                cipher,
                nonce: [0u8; NONCE_SIZE],
            };
        }

        let chunk = buf.len().min(MAX_CHUNK);
        if let WriteState::Ready { cipher, nonce } = &mut this.write {
            let len_bytes = (chunk as u16).to_be_bytes();
            let sealed_len = cipher
                .seal(nonce.as_slice(), &len_bytes)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            bump_nonce(nonce);
            let sealed_payload = cipher
                .seal(nonce.as_slice(), &buf[..chunk])
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            bump_nonce(nonce);

            this.pending.put_slice(&sealed_len);
            this.pending.put_slice(&sealed_payload);
        }

        // best-effort drain; the chunk is accepted either way
        let _ = this.drain_pending(cx)?;
        Poll::Ready(Ok(chunk))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match this.drain_pending(cx)? {
            Poll::Ready(true) => Pin::new(&mut this.inner).poll_flush(cx),
            _ => Poll::Pending,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match this.drain_pending(cx)? {
            Poll::Ready(true) => Pin::new(&mut this.inner).poll_shutdown(cx),
            _ => Poll::Pending,
        }
    }
}

impl<S: AsyncRead + Unpin> SsStream<S> {
    /// Advance the decrypt state machine as far as the raw buffer allows.
    fn decrypt_available(&mut self) -> std::io::Result<()> {
        loop {
            let state = match self.read.take() {
                Some(s) => s,
                None => return Ok(()),
            };
            match state {
                ReadState::WaitSalt => {
                    if self.raw.len() < self.kind.key_size() {
                        self.read = Some(ReadState::WaitSalt);
                        return Ok(());
                    }
                    let salt = self.raw.split_to(self.kind.key_size());
                    let cipher = crypto::session_cipher(self.kind, &self.master_key, &salt)
                        .map_err(|e| {
                            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
                        })?;
                    self.read = Some(ReadState::WaitLen {
                        cipher,
                        nonce: [0u8; NONCE_SIZE],
                    });
                }
                ReadState::WaitLen { cipher, mut nonce } => {
                    if self.raw.len() < 2 + TAG_SIZE {
                        self.read = Some(ReadState::WaitLen { cipher, nonce });
                        return Ok(());
                    }
                    let sealed = self.raw.split_to(2 + TAG_SIZE);
                    let len_bytes = cipher.open(nonce.as_slice(), &sealed).map_err(|e| {
                        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
                    })?;
                    bump_nonce(&mut nonce);
                    let len =
                        u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize & MAX_CHUNK;
                    self.read = Some(ReadState::WaitPayload { cipher, nonce, len });
                }
                ReadState::WaitPayload {
                    cipher,
                    mut nonce,
                    len,
                } => {
                    if self.raw.len() < len + TAG_SIZE {
                        self.read = Some(ReadState::WaitPayload { cipher, nonce, len });
                        return Ok(());
                    }
                    let sealed = self.raw.split_to(len + TAG_SIZE);
                    let payload = cipher.open(nonce.as_slice(), &sealed).map_err(|e| {
                        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
                    })?;
                    bump_nonce(&mut nonce);
                    self.plain.put_slice(&payload);
                    self.read = Some(ReadState::WaitLen { cipher, nonce });
                }
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.plain.is_empty() {
                let n = this.plain.len().min(buf.remaining());
                buf.put_slice(&this.plain.split_to(n));
                return Poll::Ready(Ok(()));
            }

            if this.eof {
                if this.raw.is_empty() {
                    return Poll::Ready(Ok(())); // clean EOF
                }
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "truncated cipher stream",
                )));
            }

            let mut tmp = [0u8; 4096];
            let mut tmp_buf = ReadBuf::new(&mut tmp);
            match Pin::new(&mut this.inner).poll_read(cx, &mut tmp_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = tmp_buf.filled();
                    if filled.is_empty() {
                        this.eof = true;
                    } else {
                        this.raw.put_slice(filled);
                        this.decrypt_available()?;
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let kind = CipherKind::Chacha20Poly1305;
        let key = crypto::derive_key("pw", kind.key_size());

        let (near, far) = tokio::io::duplex(64 * 1024);
        let mut client = SsStream::new(near, kind, key.clone());
        let mut server = SsStream::new(far, kind, key);

        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 256) as u8).collect();
        let send = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&send).await.unwrap();
            client.flush().await.unwrap();
            client.shutdown().await.unwrap();
        });

        let mut out = vec![0u8; payload.len()];
        server.read_exact(&mut out).await.unwrap();
        writer.await.unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let kind = CipherKind::Aes128Gcm;
        let (near, far) = tokio::io::duplex(4096);
        let mut client = SsStream::new(near, kind, crypto::derive_key("right", 16));
        let mut server = SsStream::new(far, kind, crypto::derive_key("wrong", 16));

        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();

        let mut out = [0u8; 5];
        assert!(server.read_exact(&mut out).await.is_err());
    }
}
