//! Relay protocol server handler.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::chain::Hop;
use crate::common::{pipe, Address, StreamConn, Network, RequestMeta, Result, Stream};
use crate::error::Error;
use crate::metrics::SERVICE_HANDLER_ERRORS;
use crate::recorder::RecorderObject;
use crate::relay::{
    Feature, Request, Response, CMD_ASSOCIATE, CMD_BIND, CMD_CONNECT, NETWORK_UDP, STATUS_BAD_REQUEST,
    STATUS_FORBIDDEN, STATUS_NETWORK_UNREACHABLE, STATUS_OK, STATUS_UNAUTHORIZED, VERSION1,
};
use crate::sniff::{self, Proto, Sniffer};
use crate::stats::{Kind, Stats};
use crate::udprelay::{Relay, StreamEndpoint};
use crate::wrapper::StatsStream;

use super::{ConnContext, Handler, HandlerOptions};

#[derive(Default)]
pub struct RelayMetadata {
    /// Send the OK response immediately instead of piggybacking it on the
    /// first upstream write (costs one extra RTT).
    pub no_delay: bool,
    pub sniffing: bool,
    pub sniffing_timeout: Option<std::time::Duration>,
    pub udp_buffer_size: usize,
    pub hash: Option<String>,
}

pub struct RelayHandler {
    options: HandlerOptions,
    md: RelayMetadata,
    sniffer: Sniffer,
    forward_hop: Option<Arc<Hop>>,
}

impl RelayHandler {
    pub fn new(options: HandlerOptions, md: RelayMetadata) -> Self {
        Self {
            options,
            md,
            sniffer: Sniffer::new(),
            forward_hop: None,
        }
    }

    pub fn with_sniffer(mut self, sniffer: Sniffer) -> Self {
        self.sniffer = sniffer;
        self
    }

    /// Forward mode: requests are tunneled to a hop-selected node instead
    /// of being dialed per target.
    pub fn forward(mut self, hop: Arc<Hop>) -> Self {
        self.forward_hop = Some(hop);
        self
    }
}

#[async_trait]
impl Handler for RelayHandler {
    async fn handle(&self, ctx: &ConnContext, stream: Stream) -> Result<()> {
        let start = Instant::now();
        let mut ro = self.options.recorder_object(ctx, "tcp");

        let pstats = Arc::new(Stats::new(false));
        let stream: Stream = Box::new(StatsStream::new(stream, pstats.clone()));

        info!("[{}] {} <> {}", self.options.service, ctx.remote_addr, ctx.local_addr);

        let result = self.handle_inner(ctx, stream, &mut ro).await;

        if let Err(e) = &result {
            ro.err = Some(e.to_string());
            SERVICE_HANDLER_ERRORS
                .with_label_values(&[&self.options.service])
                .inc();
        }
        ro.input_bytes += pstats.get(Kind::InputBytes);
        ro.output_bytes += pstats.get(Kind::OutputBytes);
        ro.set_duration(start.elapsed());
        self.options.recorder.record(&ro).await;

        info!(
            "[{}] {} >< {} in={} out={}",
            self.options.service, ctx.remote_addr, ctx.local_addr, ro.input_bytes, ro.output_bytes
        );
        result
    }
}

impl RelayHandler {
    async fn handle_inner(
        &self,
        ctx: &ConnContext,
        mut stream: Stream,
        ro: &mut RecorderObject,
    ) -> Result<()> {
        if !self.options.check_rate_limit(ctx) {
            return Err(Error::RateLimit);
        }

        let request = self
            .options
            .with_read_timeout(Request::read_from(&mut stream))
            .await?;

        if request.version != VERSION1 {
            Response::new(STATUS_BAD_REQUEST).write_to(&mut stream).await?;
            return Err(Error::BadVersion);
        }

        let mut user = String::new();
        let mut pass = String::new();
        let mut address: Option<Address> = None;
        let mut network_id = 0u8;
        for feature in &request.features {
            match feature {
                Feature::UserAuth { username, password } => {
                    user = username.clone();
                    pass = password.clone();
                }
                // the last Addr feature is the target (an earlier one may
                // carry the original source for associate)
                Feature::Addr(addr) => address = Some(addr.clone()),
                Feature::Network(id) => network_id = *id,
                Feature::Tunnel(_) => {}
            }
        }

        if !user.is_empty() {
            ro.client_id = user.clone();
        }

        let mut client_id = None;
        if let Some(auther) = &self.options.auther {
            match auther.authenticate(&user, &pass).await {
                Some(id) => {
                    ro.client_id = id.clone();
                    client_id = Some(id);
                }
                None => {
                    Response::new(STATUS_UNAUTHORIZED).write_to(&mut stream).await?;
                    return Err(Error::Unauthorized);
                }
            }
        }

        let network = if request.is_udp() || network_id == NETWORK_UDP {
            Network::Udp
        } else {
            Network::Tcp
        };
        ro.network = network.as_str().into();
        if let Some(addr) = &address {
            ro.host = addr.canonical();
        }

        let mut req = RequestMeta::new(network);
        req.src_addr = ctx.src_ip();
        req.client_id = client_id;
        if let Some(addr) = &address {
            req.host = addr.canonical();
            if self.md.hash.as_deref() == Some("host") {
                req.hash = Some(addr.canonical());
            }
        }

        if let Some(hop) = &self.forward_hop {
            return self
                .handle_forward(ctx, stream, hop.clone(), &request, req, ro)
                .await;
        }

        match request.command() {
            0 | CMD_CONNECT => self.handle_connect(ctx, stream, address, req, ro).await,
            CMD_BIND => self.handle_bind(ctx, stream, req, ro).await,
            CMD_ASSOCIATE => self.handle_associate(ctx, stream, req, ro).await,
            _ => {
                Response::new(STATUS_BAD_REQUEST).write_to(&mut stream).await?;
                Err(Error::UnknownCmd)
            }
        }
    }

    async fn handle_connect(
        &self,
        ctx: &ConnContext,
        stream: Stream,
        address: Option<Address>,
        req: RequestMeta,
        ro: &mut RecorderObject,
    ) -> Result<()> {
        let client_id = req.client_id.clone().unwrap_or_default();
        let (mut stream, _guard) =
            self.options
                .wrap_client_stream(stream, &client_id, &ctx.remote_addr);

        let Some(address) = address else {
            Response::new(STATUS_BAD_REQUEST).write_to(&mut stream).await?;
            return Err(Error::Protocol("target not specified".into()));
        };

        debug!(
            "[{}] {} >> {}/{} connect",
            self.options.service, ctx.remote_addr, address, req.network
        );

        if let Some(bypass) = &self.options.bypass {
            if bypass.contains(req.network, &req.host) {
                Response::new(STATUS_FORBIDDEN).write_to(&mut stream).await?;
                return Err(Error::Bypass);
            }
        }

        let (upstream, route) = match self.options.router.dial(req.network, &address, &req).await {
            Ok(r) => r,
            Err(e) => {
                Response::new(STATUS_NETWORK_UNREACHABLE)
                    .write_to(&mut stream)
                    .await?;
                return Err(e);
            }
        };
        ro.route = route.route;
        ro.dst_addr = route.dst;

        let ok = Response::new(STATUS_OK);
        let mut stream: Stream = if self.md.no_delay {
            ok.write_to(&mut stream).await?;
            stream
        } else {
            // piggyback the header on the first byte written back to the
            // peer to save an RTT
            Box::new(PiggybackStream::new(stream, ok.encode().to_vec()))
        };

        if self.md.sniffing && req.network == Network::Tcp {
            let (proto, sniffed) = sniff::sniff(stream, self.md.sniffing_timeout).await;
            ro.proto = proto.as_str().into();
            let sniffed: Stream = Box::new(sniffed);
            stream = sniffed;
            match proto {
                Proto::Http => return self.sniffer.handle_http(stream, upstream, ro).await,
                Proto::Tls => {
                    return self.sniffer.handle_tls(stream, upstream, &req.host, ro).await
                }
                Proto::None => {}
            }
        }

        pipe(stream, upstream).await;
        Ok(())
    }

    async fn handle_bind(
        &self,
        ctx: &ConnContext,
        mut stream: Stream,
        req: RequestMeta,
        _ro: &mut RecorderObject,
    ) -> Result<()> {
        let listener = TcpListener::bind("0.0.0.0:0").await?;
        let bound = listener.local_addr()?;

        let mut response = Response::new(STATUS_OK);
        response.features.push(Feature::Addr(Address::Socket(bound)));
        response.write_to(&mut stream).await?;
        debug!("[{}] {} bind on {}", self.options.service, ctx.remote_addr, bound);

        let mut shutdown = ctx.shutdown.subscribe();
        let (incoming, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.recv() => return Ok(()),
        };
        drop(listener);

        let mut notify = Response::new(STATUS_OK);
        notify.features.push(Feature::Addr(Address::Socket(peer)));
        notify.write_to(&mut stream).await?;

        let client_id = req.client_id.clone().unwrap_or_default();
        let (stream, _guard) =
            self.options
                .wrap_client_stream(stream, &client_id, &ctx.remote_addr);
        pipe(stream, incoming.boxed()).await;
        Ok(())
    }

    async fn handle_associate(
        &self,
        ctx: &ConnContext,
        mut stream: Stream,
        req: RequestMeta,
        _ro: &mut RecorderObject,
    ) -> Result<()> {
        Response::new(STATUS_OK).write_to(&mut stream).await?;

        let client_id = req.client_id.clone().unwrap_or_default();
        let (stream, _guard) =
            self.options
                .wrap_client_stream(stream, &client_id, &ctx.remote_addr);

        let client_ep = Arc::new(StreamEndpoint::new(stream));
        let upstream = self.options.router.dial_udp(&req).await?;

        let mut relay = Relay::new(client_ep, Arc::from(upstream))
            .with_bypass(self.options.bypass.clone());
        if self.md.udp_buffer_size > 0 {
            relay = relay.with_buffer_size(self.md.udp_buffer_size);
        }
        relay.run(ctx.shutdown.subscribe()).await
    }

    /// Forward mode: tunnel the whole request to a hop-selected node.
    async fn handle_forward(
        &self,
        ctx: &ConnContext,
        mut stream: Stream,
        hop: Arc<Hop>,
        request: &Request,
        req: RequestMeta,
        ro: &mut RecorderObject,
    ) -> Result<()> {
        let Some(node) = hop.select(&req) else {
            Response::new(STATUS_NETWORK_UNREACHABLE)
                .write_to(&mut stream)
                .await?;
            return Err(Error::NoRoute(req.host.clone()));
        };
        debug!(
            "[{}] {} forward via {}",
            self.options.service, ctx.remote_addr, node.name
        );

        let (mut upstream, route) = match self
            .options
            .router
            .dial(Network::Tcp, &node.addr, &req)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                node.marker.mark_failed();
                Response::new(STATUS_NETWORK_UNREACHABLE)
                    .write_to(&mut stream)
                    .await?;
                return Err(e);
            }
        };
        node.marker.reset();
        ro.route = route.route;
        ro.dst_addr = node.addr.canonical();

        // replay the already-parsed request to the next relay
        request.write_to(&mut upstream).await?;

        let client_id = req.client_id.clone().unwrap_or_default();
        let (stream, _guard) =
            self.options
                .wrap_client_stream(stream, &client_id, &ctx.remote_addr);
        pipe(stream, upstream).await;
        Ok(())
    }
}

/// Stream that prepends a cached header to the first write.
struct PiggybackStream<S> {
    inner: S,
    header: BytesMut,
}

impl<S> PiggybackStream<S> {
    fn new(inner: S, header: Vec<u8>) -> Self {
        Self {
            inner,
            header: BytesMut::from(&header[..]),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PiggybackStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PiggybackStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        while !this.header.is_empty() {
            let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &this.header))?;
            if n == 0 {
                return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
            }
            this.header.advance(n);
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        while !this.header.is_empty() {
            let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &this.header))?;
            if n == 0 {
                return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
            }
            this.header.advance(n);
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::registry::Registry;
    use crate::router::Router;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, UdpSocket};
    use tokio::sync::broadcast;

    fn handler(no_delay: bool) -> RelayHandler {
        let chains = Arc::new(Registry::<Chain>::new("chain"));
        let router = Arc::new(Router::new("test", chains));
        let options = HandlerOptions::new("relay-test", router);
        RelayHandler::new(
            options,
            RelayMetadata {
                no_delay,
                ..Default::default()
            },
        )
    }

    fn ctx() -> ConnContext {
        let (shutdown, _) = broadcast::channel(1);
        ConnContext {
            sid: "sid-relay".into(),
            remote_addr: "127.0.0.1:40000".into(),
            local_addr: "127.0.0.1:8421".into(),
            client_addr: None,
            shutdown,
        }
    }

    #[tokio::test]
    async fn test_connect_with_piggybacked_response() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = echo.accept().await.unwrap();
            let (mut r, mut w) = conn.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        let (client, server) = tokio::io::duplex(8192);
        let h = handler(false);
        let context = ctx();
        tokio::spawn(async move { h.handle(&context, server.boxed()).await });

        let (mut cr, mut cw) = tokio::io::split(client);

        let mut request = Request::new(CMD_CONNECT);
        request
            .features
            .push(Feature::Addr(Address::Socket(echo_addr)));
        cw.write_all(&request.encode()).await.unwrap();

        // client data flows before the response frame arrives (piggyback)
        cw.write_all(b"hello relay").await.unwrap();

        let response = Response::read_from(&mut cr).await.unwrap();
        assert_eq!(response.status, STATUS_OK);

        let mut out = [0u8; 11];
        cr.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello relay");
    }

    #[tokio::test]
    async fn test_bad_version_rejected() {
        let (client, server) = tokio::io::duplex(1024);
        let h = handler(true);
        let context = ctx();
        let task = tokio::spawn(async move { h.handle(&context, server.boxed()).await });

        let (mut cr, mut cw) = tokio::io::split(client);
        cw.write_all(&[0x02, CMD_CONNECT, 0x00]).await.unwrap();

        let response = Response::read_from(&mut cr).await.unwrap();
        assert_eq!(response.status, STATUS_BAD_REQUEST);
        assert!(matches!(task.await.unwrap().unwrap_err(), Error::BadVersion));
    }

    #[tokio::test]
    async fn test_associate_udp_echo() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let (client, server) = tokio::io::duplex(8192);
        let h = handler(true);
        let context = ctx();
        tokio::spawn(async move { h.handle(&context, server.boxed()).await });

        let (mut cr, mut cw) = tokio::io::split(client);

        let mut request = Request::new(CMD_ASSOCIATE);
        request.features.push(Feature::Network(NETWORK_UDP));
        request
            .features
            .push(Feature::Addr(Address::Socket(echo_addr)));
        cw.write_all(&request.encode()).await.unwrap();

        let response = Response::read_from(&mut cr).await.unwrap();
        assert_eq!(response.status, STATUS_OK);

        // 16-byte datagram through the tun framing
        let mut frame = BytesMut::new();
        crate::common::socks_addr::encode_addr(&Address::Socket(echo_addr), &mut frame);
        let payload = [0x5Au8; 16];
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(&payload);
        cw.write_all(&frame).await.unwrap();

        let from = crate::common::socks_addr::read_addr(&mut cr).await.unwrap();
        assert_eq!(from, Address::Socket(echo_addr));
        let len = cr.read_u16().await.unwrap() as usize;
        let mut data = vec![0u8; len];
        cr.read_exact(&mut data).await.unwrap();
        assert_eq!(data, payload);
    }
}
