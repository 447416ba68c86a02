//! HTTP-over-QUIC service.
//!
//! Accepts QUIC connections (quinn); every bidirectional stream carries one
//! HTTP/1.1-syntax proxy request handled by the plain HTTP machinery, so
//! dialing goes through the router exactly as for TCP inbounds. Dial
//! failures here do not mark nodes; marking stays in the chain where the
//! failing hop is known.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use quinn::{Endpoint, RecvStream, SendStream};
use rustls::pki_types::PrivateKeyDer;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::common::{Result, Stream};
use crate::error::Error;

use super::{ConnContext, Handler};

pub struct Http3Service {
    service: String,
    handler: Arc<dyn Handler>,
}

impl Http3Service {
    pub fn new(service: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            service: service.into(),
            handler,
        }
    }

    /// Accept loop over the QUIC endpoint.
    pub async fn serve(&self, endpoint: Endpoint, shutdown: broadcast::Sender<()>) -> Result<()> {
        let mut rx = shutdown.subscribe();
        info!(
            "[{}] quic listening on {}",
            self.service,
            endpoint.local_addr()?
        );

        loop {
            tokio::select! {
                incoming = endpoint.accept() => {
                    let Some(incoming) = incoming else { return Ok(()) };
                    let handler = self.handler.clone();
                    let service = self.service.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(incoming, handler, shutdown).await {
                            debug!("[{}] quic connection: {}", service, e);
                        }
                    });
                }
                _ = rx.recv() => {
                    endpoint.close(0u32.into(), b"shutdown");
                    return Ok(());
                }
            }
        }
    }
}

async fn serve_connection(
    incoming: quinn::Incoming,
    handler: Arc<dyn Handler>,
    shutdown: broadcast::Sender<()>,
) -> Result<()> {
    let connection = incoming
        .await
        .map_err(|e| Error::Protocol(format!("quic handshake: {}", e)))?;
    let remote = connection.remote_address();
    debug!("quic conn from {}", remote);

    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(pair) => pair,
            // peer closed the connection; not an error
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::ConnectionClosed(_)) => return Ok(()),
            Err(e) => return Err(Error::Protocol(format!("quic accept: {}", e))),
        };

        let ctx = ConnContext {
            sid: Uuid::new_v4().to_string(),
            remote_addr: remote.to_string(),
            local_addr: String::new(),
            client_addr: None,
            shutdown: shutdown.clone(),
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            let stream: Stream = Box::new(BidiStream { recv, send });
            if let Err(e) = handler.handle(&ctx, stream).await {
                if !e.is_policy() {
                    error!("quic stream handler: {}", e);
                }
            }
        });
    }
}

/// One QUIC bidirectional stream presented as a conn. Reads come from the
/// peer-initiated half, writes go to ours; shutting down the write side
/// finishes the QUIC stream.
struct BidiStream {
    recv: RecvStream,
    send: SendStream,
}

impl AsyncRead for BidiStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for BidiStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

/// Build the server endpoint from PEM cert and key files.
pub fn make_endpoint(addr: SocketAddr, cert_file: &str, key_file: &str) -> Result<Endpoint> {
    crate::transport::ensure_crypto_provider();

    let certs = {
        let pem = std::fs::read(cert_file)?;
        rustls_pemfile::certs(&mut pem.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Config(format!("quic cert: {}", e)))?
    };
    let key: PrivateKeyDer<'static> = {
        let pem = std::fs::read(key_file)?;
        rustls_pemfile::private_key(&mut pem.as_slice())
            .map_err(|e| Error::Config(format!("quic key: {}", e)))?
            .ok_or_else(|| Error::Config("quic key file has no key".into()))?
    };

    let server_config = quinn::ServerConfig::with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("quic server config: {}", e)))?;
    let endpoint = Endpoint::server(server_config, addr)?;
    Ok(endpoint)
}
