//! Protocol sniffing.
//!
//! A fresh connection's first bytes are read once (bounded by the sniffing
//! timeout), classified, and handed back through a `PrefixedStream` so the
//! upstream sees the identical byte sequence when the connection is proxied
//! transparently.

mod mitm;

pub use mitm::{CertPool, Sniffer};

use std::time::Duration;

use tokio::io::AsyncReadExt;

use crate::common::{PrefixedStream, Stream};

/// Sniff window size. Enough for a request line or a TLS record header.
const SNIFF_WINDOW: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Http,
    Tls,
    None,
}

impl Proto {
    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::Http => "http",
            Proto::Tls => "tls",
            Proto::None => "",
        }
    }
}

const HTTP_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

/// Read the initial bytes off `stream` and classify them.
///
/// Returns the classification and a stream replaying everything consumed.
/// A timeout or immediate EOF yields `Proto::None` with whatever was read.
pub async fn sniff(mut stream: Stream, timeout: Option<Duration>) -> (Proto, PrefixedStream) {
    let mut buf = vec![0u8; SNIFF_WINDOW];

    let read = async { stream.read(&mut buf).await };
    let n = match timeout {
        Some(t) if !t.is_zero() => match tokio::time::timeout(t, read).await {
            Ok(Ok(n)) => n,
            Ok(Err(_)) | Err(_) => 0,
        },
        _ => read.await.unwrap_or(0),
    };
    buf.truncate(n);

    let proto = classify(&buf);
    (proto, PrefixedStream::new(buf, stream))
}

/// Classification rules:
/// - HTTP: a known method token, a space, and a URI token.
/// - TLS: handshake record (0x16), version 3.1-3.4, plausible length.
pub fn classify(data: &[u8]) -> Proto {
    if is_tls(data) {
        return Proto::Tls;
    }
    if is_http(data) {
        return Proto::Http;
    }
    Proto::None
}

fn is_tls(data: &[u8]) -> bool {
    if data.len() < 5 {
        return false;
    }
    if data[0] != 0x16 || data[1] != 0x03 || !(0x01..=0x04).contains(&data[2]) {
        return false;
    }
    let len = u16::from_be_bytes([data[3], data[4]]) as usize;
    len > 0 && len <= 16384 + 2048
}

fn is_http(data: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(data) else {
        return false;
    };
    let line = text.lines().next().unwrap_or(text);
    let mut parts = line.split(' ');
    let Some(method) = parts.next() else {
        return false;
    };
    if !HTTP_METHODS.contains(&method) {
        return false;
    }
    // a URI token must follow the method
    matches!(parts.next(), Some(uri) if !uri.is_empty())
}
