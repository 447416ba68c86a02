//! HTTP CONNECT client connector.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{Address, Network, RequestMeta, Result, Stream};
use crate::error::Error;
use crate::transport::Connector;

pub struct HttpConnector {
    auth: Option<(String, String)>,
}

impl HttpConnector {
    pub fn new(auth: Option<(String, String)>) -> Self {
        Self { auth }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        mut stream: Stream,
        network: Network,
        address: &Address,
        _req: &RequestMeta,
    ) -> Result<Stream> {
        if network != Network::Tcp {
            return Err(Error::Unsupported("http connector is tcp-only".into()));
        }

        let target = address.canonical();
        let mut request = format!(
            "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: keep-alive\r\n"
        );
        if let Some((user, pass)) = &self.auth {
            let cred = BASE64.encode(format!("{}:{}", user, pass));
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", cred));
        }
        request.push_str("\r\n");

        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        // read the response head byte-wise so no tunneled bytes are consumed
        let mut head = Vec::with_capacity(128);
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await?;
            head.push(byte[0]);
            if head.len() > 8 * 1024 {
                return Err(Error::Protocol("oversized CONNECT response".into()));
            }
        }

        let status_line = std::str::from_utf8(&head)
            .ok()
            .and_then(|s| s.lines().next())
            .unwrap_or_default();
        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Protocol("malformed CONNECT response".into()))?;

        match status {
            200..=299 => Ok(stream),
            401 | 407 => Err(Error::Unauthorized),
            403 => Err(Error::Bypass),
            other => Err(Error::Protocol(format!("CONNECT failed: {}", other))),
        }
    }
}
