//! SOCKS-style address codec: `ATYP | ADDR | PORT(2, BE)`.
//!
//! Shared by the SOCKS5 machinery, the relay protocol's Addr feature, the
//! Shadowsocks packet header and the stream-framed datagram transports.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

use super::Address;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Append the encoded address to `buf`.
pub fn encode_addr(addr: &Address, buf: &mut impl BufMut) {
    match addr {
        Address::Socket(SocketAddr::V4(v4)) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&v4.ip().octets());
            buf.put_u16(v4.port());
        }
        Address::Socket(SocketAddr::V6(v6)) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&v6.ip().octets());
            buf.put_u16(v6.port());
        }
        Address::Domain(domain, port) => {
            buf.put_u8(ATYP_DOMAIN);
            let name = &domain.as_bytes()[..domain.len().min(255)];
            buf.put_u8(name.len() as u8);
            buf.put_slice(name);
            buf.put_u16(*port);
        }
    }
}

/// Decode an address from a buffer, advancing it.
pub fn decode_addr(buf: &mut impl Buf) -> Result<Address> {
    if buf.remaining() < 1 {
        return Err(Error::Protocol("truncated address".into()));
    }
    let atyp = buf.get_u8();
    match atyp {
        ATYP_IPV4 => {
            if buf.remaining() < 6 {
                return Err(Error::Protocol("truncated ipv4 address".into()));
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            Ok(Address::Socket(SocketAddr::new(
                Ipv4Addr::from(octets).into(),
                port,
            )))
        }
        ATYP_IPV6 => {
            if buf.remaining() < 18 {
                return Err(Error::Protocol("truncated ipv6 address".into()));
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            Ok(Address::Socket(SocketAddr::new(
                Ipv6Addr::from(octets).into(),
                port,
            )))
        }
        ATYP_DOMAIN => {
            if buf.remaining() < 1 {
                return Err(Error::Protocol("truncated domain length".into()));
            }
            let len = buf.get_u8() as usize;
            if buf.remaining() < len + 2 {
                return Err(Error::Protocol("truncated domain address".into()));
            }
            let mut name = vec![0u8; len];
            buf.copy_to_slice(&mut name);
            let port = buf.get_u16();
            let domain = String::from_utf8_lossy(&name).to_string();
            Ok(Address::Domain(domain, port))
        }
        other => Err(Error::Protocol(format!("bad address type: {}", other))),
    }
}

/// Read an address directly off a stream.
pub async fn read_addr<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Address> {
    let atyp = stream.read_u8().await?;
    match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            Ok(Address::Socket(SocketAddr::new(
                Ipv4Addr::from(octets).into(),
                port,
            )))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            Ok(Address::Socket(SocketAddr::new(
                Ipv6Addr::from(octets).into(),
                port,
            )))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let port = stream.read_u16().await?;
            let domain = String::from_utf8_lossy(&name).to_string();
            Ok(Address::Domain(domain, port))
        }
        other => Err(Error::Protocol(format!("bad address type: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_domain_codec() {
        let mut buf = BytesMut::new();
        encode_addr(&Address::domain("example.com", 443), &mut buf);
        assert_eq!(buf[0], ATYP_DOMAIN);
        assert_eq!(buf[1] as usize, "example.com".len());

        let decoded = decode_addr(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, Address::domain("example.com", 443));
    }

    #[test]
    fn test_truncated_input_rejected() {
        let mut buf = BytesMut::new();
        encode_addr(&Address::Socket("10.0.0.1:53".parse().unwrap()), &mut buf);
        let mut short = buf.freeze();
        let _ = short.split_off(4); // cut mid-address
        assert!(decode_addr(&mut short).is_err());
    }
}
