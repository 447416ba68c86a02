//! PROXY protocol v1 decode.
//!
//! When a service sits behind an L4 balancer that prepends the v1 text
//! header, this reads it off the wire before any protocol bytes and yields
//! the original client address. v2 (binary) is rejected.

use std::net::{IpAddr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

const MAX_HEADER: usize = 107;

/// Read one `PROXY ...\r\n` line and return the advertised source address.
/// `PROXY UNKNOWN` yields None.
pub async fn read_proxy_v1<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Option<SocketAddr>> {
    // byte-at-a-time up to the CRLF so no protocol bytes are consumed
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        line.push(byte[0]);
        if line.len() >= 2 && line[line.len() - 2..] == *b"\r\n" {
            break;
        }
        if line.len() > MAX_HEADER {
            return Err(Error::Protocol("proxy-protocol header too long".into()));
        }
    }
    line.truncate(line.len() - 2);

    let text = std::str::from_utf8(&line)
        .map_err(|_| Error::Protocol("proxy-protocol header not ascii".into()))?;
    let mut parts = text.split(' ');

    if parts.next() != Some("PROXY") {
        return Err(Error::Protocol("missing PROXY signature".into()));
    }

    match parts.next() {
        Some("TCP4") | Some("TCP6") => {}
        Some("UNKNOWN") => return Ok(None),
        _ => return Err(Error::Protocol("unsupported proxy-protocol family".into())),
    }

    let src_ip: IpAddr = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Protocol("bad proxy-protocol source ip".into()))?;
    let _dst_ip = parts.next();
    let src_port: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Protocol("bad proxy-protocol source port".into()))?;

    Ok(Some(SocketAddr::new(src_ip, src_port)))
}
