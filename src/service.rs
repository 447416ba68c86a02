//! Service - binds a listener to a handler.
//!
//! Each accepted connection gets the wrapper stack (proxy-protocol decode,
//! metrics, admission, service-scope traffic limit, conn limit, optional
//! TLS or WebSocket) and runs in its own task with a fresh SID. A panic in
//! a connection task is logged and closes only that connection.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, UdpSocket, UnixListener};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admission::Admission;
use crate::common::{StreamConn, Result, Stream};
use crate::error::Error;
use crate::handler::{http3::Http3Service, ss_udp::SsUdpHandler, ConnContext, Handler};
use crate::limiter::{ConnLimiter, Scope, TrafficLimiter};
use crate::metrics::{SERVICE_CONNECTIONS_ACTIVE, SERVICE_CONNECTIONS_TOTAL};
use crate::wrapper::{read_proxy_v1, ConnLimitStream, MetricsStream, TrafficStream};

/// How a stream service terminates the transport before the handler.
pub enum ListenerKind {
    Tcp,
    Tls(TlsAcceptor),
    Ws { path: String },
    Unix,
}

/// What the service runs.
pub enum ServiceKind {
    Stream {
        listener: ListenerKind,
        handler: Arc<dyn Handler>,
    },
    /// Shadowsocks UDP service
    SsUdp(Arc<SsUdpHandler>),
    /// HTTP-over-QUIC service
    Quic {
        service: Arc<Http3Service>,
        cert_file: String,
        key_file: String,
    },
}

pub struct Service {
    pub name: String,
    addr: String,
    kind: ServiceKind,
    admission: Option<Arc<Admission>>,
    conn_limiter: Option<Arc<ConnLimiter>>,
    limiter: Option<Arc<TrafficLimiter>>,
    proxy_protocol: bool,
    shutdown: broadcast::Sender<()>,
}

impl Service {
    pub fn new(name: impl Into<String>, addr: impl Into<String>, kind: ServiceKind) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            name: name.into(),
            addr: addr.into(),
            kind,
            admission: None,
            conn_limiter: None,
            limiter: None,
            proxy_protocol: false,
            shutdown,
        }
    }

    pub fn with_admission(mut self, admission: Option<Arc<Admission>>) -> Self {
        self.admission = admission;
        self
    }

    pub fn with_conn_limiter(mut self, limiter: Option<Arc<ConnLimiter>>) -> Self {
        self.conn_limiter = limiter;
        self
    }

    pub fn with_limiter(mut self, limiter: Option<Arc<TrafficLimiter>>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_proxy_protocol(mut self, enabled: bool) -> Self {
        self.proxy_protocol = enabled;
        self
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Stop the accept loop. In-flight connections run to completion;
    /// long-lived relays subscribed to the shutdown signal wind down.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// Bind and serve until stopped. Bind failures surface to the caller
    /// (the service supervisor).
    pub async fn serve(&self) -> Result<()> {
        match &self.kind {
            ServiceKind::Stream { listener, handler } => match listener {
                ListenerKind::Unix => self.serve_unix(handler.clone()).await,
                _ => self.serve_stream(handler.clone()).await,
            },
            ServiceKind::SsUdp(handler) => {
                let socket = UdpSocket::bind(&self.addr).await?;
                handler.serve(socket, self.shutdown.clone()).await
            }
            ServiceKind::Quic {
                service,
                cert_file,
                key_file,
            } => {
                let addr = self
                    .addr
                    .parse()
                    .map_err(|_| Error::InvalidAddress(self.addr.clone()))?;
                let endpoint = crate::handler::http3::make_endpoint(addr, cert_file, key_file)?;
                service.serve(endpoint, self.shutdown.clone()).await
            }
        }
    }

    async fn serve_stream(&self, handler: Arc<dyn Handler>) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        let local_addr = listener.local_addr()?;
        info!("[{}] listening on {}", self.name, local_addr);

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            let (conn, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("[{}] accept: {}", self.name, e);
                        continue;
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("[{}] shutting down", self.name);
                    return Ok(());
                }
            };

            // admission is decided before any bytes are read
            if let Some(admission) = &self.admission {
                if !admission.admit(peer.ip()) {
                    debug!("[{}] admission rejected {}", self.name, peer);
                    continue;
                }
            }

            let conn_key = peer.ip().to_string();
            let mut limited: Option<(Arc<ConnLimiter>, String)> = None;
            if let Some(limiter) = &self.conn_limiter {
                if !limiter.allow(&conn_key, 1) {
                    debug!("[{}] connection limit reached for {}", self.name, conn_key);
                    continue;
                }
                limited = Some((limiter.clone(), conn_key));
            }

            let _ = conn.set_nodelay(true);
            let mut stream: Stream = match limited {
                Some((limiter, key)) => Box::new(ConnLimitStream::new(conn, limiter, key)),
                None => conn.boxed(),
            };

            SERVICE_CONNECTIONS_TOTAL
                .with_label_values(&[&self.name])
                .inc();
            SERVICE_CONNECTIONS_ACTIVE
                .with_label_values(&[&self.name])
                .inc();

            let name = self.name.clone();
            let handler = handler.clone();
            let shutdown = self.shutdown.clone();
            let proxy_protocol = self.proxy_protocol;
            let limiter = self.limiter.clone();
            let tls = match &self.kind {
                ServiceKind::Stream {
                    listener: ListenerKind::Tls(acceptor),
                    ..
                } => Some(acceptor.clone()),
                _ => None,
            };
            let ws_path = match &self.kind {
                ServiceKind::Stream {
                    listener: ListenerKind::Ws { path },
                    ..
                } => Some(path.clone()),
                _ => None,
            };

            let panic_name = self.name.clone();
            tokio::spawn(async move {
                let task = async move {
                    let mut client_addr = None;
                    if proxy_protocol {
                        match read_proxy_v1(&mut stream).await {
                            Ok(src) => client_addr = src.map(|a| a.to_string()),
                            Err(e) => {
                                warn!("[{}] proxy-protocol from {}: {}", name, peer, e);
                                return;
                            }
                        }
                    }

                    let mut stream: Stream = Box::new(MetricsStream::new(stream, &name));
                    if let Some(limiter) = &limiter {
                        stream = Box::new(TrafficStream::new(
                            stream,
                            limiter,
                            Scope::Service,
                            "",
                        ));
                    }

                    if let Some(acceptor) = tls {
                        stream = match acceptor.accept(stream).await {
                            Ok(tls_stream) => tls_stream.boxed(),
                            Err(e) => {
                                debug!("[{}] tls accept from {}: {}", name, peer, e);
                                return;
                            }
                        };
                    }
                    if let Some(path) = ws_path {
                        stream = match accept_ws(stream, &path).await {
                            Ok(ws) => ws,
                            Err(e) => {
                                debug!("[{}] ws accept from {}: {}", name, peer, e);
                                return;
                            }
                        };
                    }

                    let ctx = ConnContext {
                        sid: Uuid::new_v4().to_string(),
                        remote_addr: peer.to_string(),
                        local_addr: local_addr.to_string(),
                        client_addr,
                        shutdown,
                    };
                    if let Err(e) = handler.handle(&ctx, stream).await {
                        if e.is_policy() {
                            debug!("[{}] {}: {}", name, peer, e);
                        } else {
                            warn!("[{}] {}: {}", name, peer, e);
                        }
                    }
                };

                if let Err(panic) = std::panic::AssertUnwindSafe(task).catch_unwind().await {
                    error!("[{}] connection task panicked: {:?}", panic_name, panic);
                }
                SERVICE_CONNECTIONS_ACTIVE
                    .with_label_values(&[&panic_name])
                    .dec();
            });
        }
    }

    async fn serve_unix(&self, handler: Arc<dyn Handler>) -> Result<()> {
        // stale socket files from a previous run are removed before bind
        let _ = std::fs::remove_file(&self.addr);
        let listener = UnixListener::bind(&self.addr)?;
        info!("[{}] listening on unix:{}", self.name, self.addr);

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            let (conn, _peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("[{}] accept: {}", self.name, e);
                        continue;
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("[{}] shutting down", self.name);
                    let _ = std::fs::remove_file(&self.addr);
                    return Ok(());
                }
            };

            SERVICE_CONNECTIONS_TOTAL
                .with_label_values(&[&self.name])
                .inc();

            let name = self.name.clone();
            let handler = handler.clone();
            let shutdown = self.shutdown.clone();
            let local = self.addr.clone();
            tokio::spawn(async move {
                let ctx = ConnContext {
                    sid: Uuid::new_v4().to_string(),
                    remote_addr: "@".to_string(),
                    local_addr: local,
                    client_addr: None,
                    shutdown,
                };
                if let Err(e) = handler.handle(&ctx, conn.boxed()).await {
                    warn!("[{}] unix conn: {}", name, e);
                }
            });
        }
    }
}

/// Accept a WebSocket handshake and expose binary frames as a byte stream.
async fn accept_ws(stream: Stream, _path: &str) -> Result<Stream> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| Error::Protocol(format!("ws handshake: {}", e)))?;
    Ok(Box::new(WsByteStream::new(ws)))
}

/// Adapter: WebSocket binary messages <-> AsyncRead/AsyncWrite.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Vec<u8>,
    read_pos: usize,
}

impl<S> WsByteStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Vec::new(),
            read_pos: 0,
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WsByteStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if self.read_pos < self.read_buf.len() {
                let n = (self.read_buf.len() - self.read_pos).min(buf.remaining());
                let start = self.read_pos;
                buf.put_slice(&self.read_buf[start..start + n]);
                self.read_pos += n;
                return Poll::Ready(Ok(()));
            }

            match futures_util::ready!(self.inner.poll_next_unpin(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    self.read_buf = data;
                    self.read_pos = 0;
                }
                Some(Ok(Message::Text(text))) => {
                    self.read_buf = text.into_bytes();
                    self.read_pos = 0;
                }
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Ok(_)) => continue, // ping/pong handled by tungstenite
                Some(Err(e)) => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        e.to_string(),
                    )))
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for WsByteStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match futures_util::ready!(self.inner.poll_ready_unpin(cx)) {
            Ok(()) => {}
            Err(e) => {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e.to_string(),
                )))
            }
        }
        match self.inner.start_send_unpin(Message::Binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                e.to_string(),
            ))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner
            .poll_flush_unpin(cx)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner
            .poll_close_unpin(cx)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::handler::socks5::{Socks5Handler, Socks5Metadata};
    use crate::handler::HandlerOptions;
    use crate::registry::Registry;
    use crate::router::Router;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn socks5_service(addr: &str) -> Service {
        let chains = Arc::new(Registry::<Chain>::new("chain"));
        let router = Arc::new(Router::new("svc", chains));
        let handler = Arc::new(Socks5Handler::new(
            HandlerOptions::new("svc", router),
            Socks5Metadata::default(),
        ));
        Service::new(
            "svc",
            addr,
            ServiceKind::Stream {
                listener: ListenerKind::Tcp,
                handler,
            },
        )
    }

    #[tokio::test]
    async fn test_service_accepts_and_dispatches() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = echo.accept().await.unwrap();
            let (mut r, mut w) = conn.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        // bind on an ephemeral port chosen by the OS
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let svc_addr = probe.local_addr().unwrap();
        drop(probe);

        let service = Arc::new(socks5_service(&svc_addr.to_string()));
        let serving = service.clone();
        tokio::spawn(async move { serving.serve().await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let mut client = TcpStream::connect(svc_addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00];
        crate::common::socks_addr::encode_addr(
            &crate::common::Address::Socket(echo_addr),
            &mut request,
        );
        client.write_all(&request).await.unwrap();
        let mut resp = [0u8; 10];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp[1], 0x00);

        client.write_all(b"through the service").await.unwrap();
        let mut out = [0u8; 19];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"through the service");

        service.stop();
    }

    #[tokio::test]
    async fn test_admission_rejects_silently() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let svc_addr = probe.local_addr().unwrap();
        drop(probe);

        let service = Arc::new(
            socks5_service(&svc_addr.to_string())
                .with_admission(Some(Arc::new(Admission::new(
                    &["127.0.0.1".to_string()],
                    false,
                )))),
        );
        let serving = service.clone();
        tokio::spawn(async move { serving.serve().await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let mut client = TcpStream::connect(svc_addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        // rejected before any protocol bytes: the conn just closes
        let mut buf = [0u8; 2];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        service.stop();
    }
}
