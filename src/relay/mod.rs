//! The relay wire protocol (version 1).
//!
//! Length-framed request/response with TLV features:
//!
//! ```text
//! Request:  VERSION(1) | CMD(1) | NFEATURES(1) | features...
//! Response: VERSION(1) | STATUS(1) | NFEATURES(1) | features...
//! Feature:  TYPE(1) | LEN(2, BE) | VALUE
//! ```
//!
//! The high bit of CMD carries the FUDP flag; the low nibble is the
//! command. Unknown feature types are skipped so newer peers stay
//! compatible.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{socks_addr, Address};
use crate::error::{Error, Result};

pub const VERSION1: u8 = 0x01;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_ASSOCIATE: u8 = 0x03;
/// Low nibble selects the command
pub const CMD_MASK: u8 = 0x0F;
/// High bit requests UDP transport for CONNECT
pub const FLAG_UDP: u8 = 0x80;

pub const STATUS_OK: u8 = 0x01;
pub const STATUS_BAD_REQUEST: u8 = 0x02;
pub const STATUS_UNAUTHORIZED: u8 = 0x03;
pub const STATUS_FORBIDDEN: u8 = 0x04;
pub const STATUS_NETWORK_UNREACHABLE: u8 = 0x05;
pub const STATUS_HOST_UNREACHABLE: u8 = 0x06;
pub const STATUS_INTERNAL_ERROR: u8 = 0x07;

const FEATURE_USER_AUTH: u8 = 0x01;
const FEATURE_ADDR: u8 = 0x02;
const FEATURE_NETWORK: u8 = 0x03;
const FEATURE_TUNNEL: u8 = 0x04;

pub const NETWORK_TCP: u8 = 0x00;
pub const NETWORK_UDP: u8 = 0x01;

/// Maximum encoded feature length accepted from a peer.
const MAX_FEATURE_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feature {
    UserAuth { username: String, password: String },
    Addr(Address),
    Network(u8),
    Tunnel(u128),
}

impl Feature {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Feature::UserAuth { username, password } => {
                let ulen = username.len().min(255);
                let mut value = BytesMut::with_capacity(1 + ulen + password.len());
                value.put_u8(ulen as u8);
                value.put_slice(&username.as_bytes()[..ulen]);
                value.put_slice(password.as_bytes());
                put_feature(buf, FEATURE_USER_AUTH, &value);
            }
            Feature::Addr(addr) => {
                let mut value = BytesMut::new();
                socks_addr::encode_addr(addr, &mut value);
                put_feature(buf, FEATURE_ADDR, &value);
            }
            Feature::Network(id) => {
                put_feature(buf, FEATURE_NETWORK, &[*id]);
            }
            Feature::Tunnel(id) => {
                put_feature(buf, FEATURE_TUNNEL, &id.to_be_bytes());
            }
        }
    }

    fn decode(ftype: u8, mut value: Bytes) -> Result<Option<Self>> {
        match ftype {
            FEATURE_USER_AUTH => {
                if value.remaining() < 1 {
                    return Err(Error::Protocol("truncated auth feature".into()));
                }
                let ulen = value.get_u8() as usize;
                if value.remaining() < ulen {
                    return Err(Error::Protocol("truncated auth feature".into()));
                }
                let user = value.split_to(ulen);
                Ok(Some(Feature::UserAuth {
                    username: String::from_utf8_lossy(&user).to_string(),
                    password: String::from_utf8_lossy(&value).to_string(),
                }))
            }
            FEATURE_ADDR => Ok(Some(Feature::Addr(socks_addr::decode_addr(&mut value)?))),
            FEATURE_NETWORK => {
                if value.remaining() < 1 {
                    return Err(Error::Protocol("truncated network feature".into()));
                }
                Ok(Some(Feature::Network(value.get_u8())))
            }
            FEATURE_TUNNEL => {
                if value.remaining() < 16 {
                    return Err(Error::Protocol("truncated tunnel feature".into()));
                }
                Ok(Some(Feature::Tunnel(value.get_u128())))
            }
            // forward compatibility: unknown features are ignored
            _ => Ok(None),
        }
    }
}

fn put_feature(buf: &mut BytesMut, ftype: u8, value: &[u8]) {
    buf.put_u8(ftype);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
}

async fn read_features<S: AsyncRead + Unpin>(stream: &mut S, count: usize) -> Result<Vec<Feature>> {
    let mut features = Vec::with_capacity(count.min(16));
    for _ in 0..count {
        let ftype = stream.read_u8().await?;
        let len = stream.read_u16().await? as usize;
        if len > MAX_FEATURE_LEN {
            return Err(Error::Protocol("oversized feature".into()));
        }
        let mut value = vec![0u8; len];
        stream.read_exact(&mut value).await?;
        if let Some(f) = Feature::decode(ftype, Bytes::from(value))? {
            features.push(f);
        }
    }
    Ok(features)
}

#[derive(Debug, Clone, Default)]
pub struct Request {
    pub version: u8,
    pub cmd: u8,
    pub features: Vec<Feature>,
}

impl Request {
    pub fn new(cmd: u8) -> Self {
        Self {
            version: VERSION1,
            cmd,
            features: Vec::new(),
        }
    }

    pub fn command(&self) -> u8 {
        self.cmd & CMD_MASK
    }

    pub fn is_udp(&self) -> bool {
        self.cmd & FLAG_UDP != 0
    }

    pub async fn read_from<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Self> {
        let mut head = [0u8; 3];
        stream.read_exact(&mut head).await?;
        let features = read_features(stream, head[2] as usize).await?;
        Ok(Self {
            version: head[0],
            cmd: head[1],
            features,
        })
    }

    pub async fn write_to<S: AsyncWrite + Unpin>(&self, stream: &mut S) -> Result<()> {
        stream.write_all(&self.encode()).await?;
        stream.flush().await?;
        Ok(())
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.version);
        buf.put_u8(self.cmd);
        buf.put_u8(self.features.len() as u8);
        for f in &self.features {
            f.encode(&mut buf);
        }
        buf.freeze()
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub version: u8,
    pub status: u8,
    pub features: Vec<Feature>,
}

impl Response {
    pub fn new(status: u8) -> Self {
        Self {
            version: VERSION1,
            status,
            features: Vec::new(),
        }
    }

    pub async fn read_from<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Self> {
        let mut head = [0u8; 3];
        stream.read_exact(&mut head).await?;
        let features = read_features(stream, head[2] as usize).await?;
        Ok(Self {
            version: head[0],
            status: head[1],
            features,
        })
    }

    pub async fn write_to<S: AsyncWrite + Unpin>(&self, stream: &mut S) -> Result<()> {
        stream.write_all(&self.encode()).await?;
        stream.flush().await?;
        Ok(())
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.version);
        buf.put_u8(self.status);
        buf.put_u8(self.features.len() as u8);
        for f in &self.features {
            f.encode(&mut buf);
        }
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_request_with_fudp_flag() {
        let mut req = Request::new(CMD_CONNECT | FLAG_UDP);
        req.features.push(Feature::Addr(Address::domain("echo.example", 9)));

        let encoded = req.encode();
        let parsed = Request::read_from(&mut Cursor::new(encoded.to_vec()))
            .await
            .unwrap();

        assert_eq!(parsed.command(), CMD_CONNECT);
        assert!(parsed.is_udp());
        assert_eq!(parsed.features.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_feature_skipped() {
        // version | cmd | 2 features: unknown type 0x7F, then network udp
        let mut wire = vec![VERSION1, CMD_ASSOCIATE, 2];
        wire.extend_from_slice(&[0x7F, 0x00, 0x03, 1, 2, 3]);
        wire.extend_from_slice(&[0x03, 0x00, 0x01, NETWORK_UDP]);

        let parsed = Request::read_from(&mut Cursor::new(wire)).await.unwrap();
        assert_eq!(parsed.features, vec![Feature::Network(NETWORK_UDP)]);
    }

    #[tokio::test]
    async fn test_auth_feature_roundtrip() {
        let mut req = Request::new(CMD_CONNECT);
        req.features.push(Feature::UserAuth {
            username: "alice".into(),
            password: "secret".into(),
        });
        let parsed = Request::read_from(&mut Cursor::new(req.encode().to_vec()))
            .await
            .unwrap();
        match &parsed.features[0] {
            Feature::UserAuth { username, password } => {
                assert_eq!(username, "alice");
                assert_eq!(password, "secret");
            }
            other => panic!("unexpected feature: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_feature_rejected() {
        let mut wire = vec![VERSION1, CMD_CONNECT, 1];
        wire.extend_from_slice(&[0x02, 0xFF, 0xFF]); // 65535-byte feature
        wire.extend_from_slice(&[0u8; 64]);
        assert!(Request::read_from(&mut Cursor::new(wire)).await.is_err());
    }
}
