//! SOCKS5 server handler (RFC 1928/1929 plus vendor commands).

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info};

use crate::common::{pipe, socks_addr, Address, StreamConn, Network, RequestMeta, Result, Stream};
use crate::error::Error;
use crate::metrics::SERVICE_HANDLER_ERRORS;
use crate::recorder::RecorderObject;
use crate::sniff::{self, Proto, Sniffer};
use crate::stats::{Kind, Stats};
use crate::udprelay::{Relay, SocksUdpEndpoint, StreamEndpoint};
use crate::wrapper::StatsStream;

use super::{ConnContext, Handler, HandlerOptions};

pub const SOCKS5_VERSION: u8 = 0x05;

pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_PASSWORD: u8 = 0x02;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;
/// Vendor: multiplexed bind
pub const CMD_MUX_BIND: u8 = 0xF1;
/// Vendor: UDP datagrams framed over the control stream
pub const CMD_UDP_TUN: u8 = 0xF3;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_FAILURE: u8 = 0x01;
pub const REP_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Handler-specific knobs parsed from service metadata.
#[derive(Default)]
pub struct Socks5Metadata {
    pub enable_udp: bool,
    pub udp_buffer_size: usize,
    /// BND.ADDR host override for NATed deployments
    pub public_addr: Option<std::net::IpAddr>,
    pub sniffing: bool,
    pub sniffing_timeout: Option<std::time::Duration>,
    /// selection hash source: "host" pins chain selection per target
    pub hash: Option<String>,
}

pub struct Socks5Handler {
    options: HandlerOptions,
    md: Socks5Metadata,
    sniffer: Sniffer,
    forward_hop: Option<Arc<crate::chain::Hop>>,
}

impl Socks5Handler {
    pub fn new(options: HandlerOptions, md: Socks5Metadata) -> Self {
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

    /// Forward mode: CONNECT requests reach their target through a
    /// hop-selected node's own connector.
    pub fn forward(mut self, hop: Arc<crate::chain::Hop>) -> Self {
        self.forward_hop = Some(hop);
        self
    }
}

#[async_trait]
impl Handler for Socks5Handler {
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

impl Socks5Handler {
    async fn handle_inner(
        &self,
        ctx: &ConnContext,
        mut stream: Stream,
        ro: &mut RecorderObject,
    ) -> Result<()> {
        if !self.options.check_rate_limit(ctx) {
            return Err(Error::RateLimit);
        }

        // negotiation and request parsing run under the read timeout
        let (client_id, request) = self
            .options
            .with_read_timeout(async {
                let client_id = self.negotiate(&mut stream).await?;
                let request = read_request(&mut stream).await?;
                Ok((client_id, request))
            })
            .await?;

        if let Some(id) = &client_id {
            ro.client_id = id.clone();
        }

        let (cmd, address) = match request {
            Ok(parsed) => parsed,
            Err(reply) => {
                write_reply(&mut stream, reply, None).await?;
                return Err(Error::Protocol("bad socks5 request".into()));
            }
        };
        ro.host = address.canonical();

        let mut req = RequestMeta::new(Network::Tcp).with_host(address.canonical());
        req.src_addr = ctx.src_ip();
        if let Some(id) = &client_id {
            req.client_id = Some(id.clone());
        }
        if self.md.hash.as_deref() == Some("host") {
            req.hash = Some(address.canonical());
        }

        match cmd {
            CMD_CONNECT => {
                if let Some(hop) = &self.forward_hop {
                    return self
                        .handle_forward(ctx, stream, hop.clone(), address, req, ro)
                        .await;
                }
                self.handle_connect(ctx, stream, address, req, ro).await
            }
            CMD_BIND => self.handle_bind(ctx, stream, req, ro).await,
            CMD_UDP_ASSOCIATE => {
                ro.network = "udp".into();
                req.network = Network::Udp;
                self.handle_udp(ctx, stream, req, ro).await
            }
            CMD_UDP_TUN => {
                ro.network = "udp".into();
                req.network = Network::Udp;
                self.handle_udp_tun(ctx, stream, req, ro).await
            }
            // no multiplexer in this build; acknowledged as unsupported
            CMD_MUX_BIND => {
                write_reply(&mut stream, REP_CMD_NOT_SUPPORTED, None).await?;
                Err(Error::Unsupported("mux bind".into()))
            }
            _ => {
                write_reply(&mut stream, REP_CMD_NOT_SUPPORTED, None).await?;
                Err(Error::UnknownCmd)
            }
        }
    }

    /// Method negotiation + optional username/password sub-negotiation.
    async fn negotiate(&self, stream: &mut Stream) -> Result<Option<String>> {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS5_VERSION {
            return Err(Error::BadVersion);
        }
        let mut methods = vec![0u8; head[1] as usize];
        stream.read_exact(&mut methods).await?;

        let selected = if self.options.auther.is_some() {
            if methods.contains(&AUTH_PASSWORD) {
                AUTH_PASSWORD
            } else {
                AUTH_NO_ACCEPTABLE
            }
        } else if methods.contains(&AUTH_NONE) {
            AUTH_NONE
        } else {
            AUTH_NO_ACCEPTABLE
        };

        stream.write_all(&[SOCKS5_VERSION, selected]).await?;
        stream.flush().await?;

        match selected {
            AUTH_NO_ACCEPTABLE => Err(Error::Protocol("no acceptable auth method".into())),
            AUTH_PASSWORD => {
                let ver = stream.read_u8().await?;
                if ver != 0x01 {
                    return Err(Error::Protocol("bad auth version".into()));
                }
                let ulen = stream.read_u8().await? as usize;
                let mut user = vec![0u8; ulen];
                stream.read_exact(&mut user).await?;
                let plen = stream.read_u8().await? as usize;
                let mut pass = vec![0u8; plen];
                stream.read_exact(&mut pass).await?;

                let user = String::from_utf8_lossy(&user).to_string();
                let pass = String::from_utf8_lossy(&pass).to_string();

                let auther = self.options.auther.as_ref().ok_or(Error::Unauthorized)?;
                match auther.authenticate(&user, &pass).await {
                    Some(client_id) => {
                        stream.write_all(&[0x01, 0x00]).await?;
                        stream.flush().await?;
                        Ok(Some(client_id))
                    }
                    None => {
                        stream.write_all(&[0x01, 0x01]).await?;
                        stream.flush().await?;
                        Err(Error::Unauthorized)
                    }
                }
            }
            _ => Ok(None),
        }
    }

    async fn handle_connect(
        &self,
        ctx: &ConnContext,
        stream: Stream,
        address: Address,
        req: RequestMeta,
        ro: &mut RecorderObject,
    ) -> Result<()> {
        debug!(
            "[{}] {} >> {} connect",
            self.options.service, ctx.remote_addr, address
        );

        let client_id = req.client_id.clone().unwrap_or_default();
        let (mut stream, _guard) =
            self.options
                .wrap_client_stream(stream, &client_id, &ctx.remote_addr);

        if let Some(bypass) = &self.options.bypass {
            if bypass.contains(Network::Tcp, &req.host) {
                write_reply(&mut stream, REP_NOT_ALLOWED, None).await?;
                return Err(Error::Bypass);
            }
        }

        let (upstream, route) = match self.options.router.dial(Network::Tcp, &address, &req).await {
            Ok(r) => r,
            Err(e) => {
                let reply = match &e {
                    Error::NoRoute(_) => REP_NETWORK_UNREACHABLE,
                    _ => REP_HOST_UNREACHABLE,
                };
                write_reply(&mut stream, reply, None).await?;
                return Err(e);
            }
        };
        ro.route = route.route;
        ro.dst_addr = route.dst;

        write_reply(&mut stream, REP_SUCCESS, None).await?;

        if self.md.sniffing {
            let (proto, sniffed) = sniff::sniff(stream, self.md.sniffing_timeout).await;
            ro.proto = proto.as_str().into();
            let sniffed: Stream = Box::new(sniffed);
            match proto {
                Proto::Http => return self.sniffer.handle_http(sniffed, upstream, ro).await,
                Proto::Tls => {
                    return self
                        .sniffer
                        .handle_tls(sniffed, upstream, &req.host, ro)
                        .await
                }
                Proto::None => {
                    let (up, down) = pipe(sniffed, upstream).await;
                    debug!(
                        "[{}] {} closed up={} down={}",
                        self.options.service, ctx.remote_addr, up, down
                    );
                    return Ok(());
                }
            }
        }

        let (up, down) = pipe(stream, upstream).await;
        debug!(
            "[{}] {} closed up={} down={}",
            self.options.service, ctx.remote_addr, up, down
        );
        Ok(())
    }

    /// Forward mode: the request target picks the node; the node's own
    /// connector performs the handshake toward the target.
    async fn handle_forward(
        &self,
        ctx: &ConnContext,
        stream: Stream,
        hop: Arc<crate::chain::Hop>,
        address: Address,
        req: RequestMeta,
        ro: &mut RecorderObject,
    ) -> Result<()> {
        let client_id = req.client_id.clone().unwrap_or_default();
        let (mut stream, _guard) =
            self.options
                .wrap_client_stream(stream, &client_id, &ctx.remote_addr);

        let Some(node) = hop.select(&req) else {
            write_reply(&mut stream, REP_NETWORK_UNREACHABLE, None).await?;
            return Err(Error::NoRoute(req.host.clone()));
        };
        debug!(
            "[{}] {} forward {} via {}",
            self.options.service, ctx.remote_addr, address, node.name
        );

        let upstream = match node.transport.dial(&node.addr).await {
            Ok(conn) => {
                match node
                    .transport
                    .connector
                    .connect(conn, Network::Tcp, &address, &req)
                    .await
                {
                    Ok(upstream) => {
                        node.marker.reset();
                        upstream
                    }
                    Err(e) => {
                        node.marker.mark_failed();
                        write_reply(&mut stream, REP_HOST_UNREACHABLE, None).await?;
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                node.marker.mark_failed();
                write_reply(&mut stream, REP_NETWORK_UNREACHABLE, None).await?;
                return Err(e);
            }
        };
        ro.route = node.name.clone();
        ro.dst_addr = node.addr.canonical();

        write_reply(&mut stream, REP_SUCCESS, None).await?;
        pipe(stream, upstream).await;
        Ok(())
    }

    /// BIND: listen on behalf of the client and splice the first incoming
    /// connection.
    async fn handle_bind(
        &self,
        ctx: &ConnContext,
        mut stream: Stream,
        req: RequestMeta,
        _ro: &mut RecorderObject,
    ) -> Result<()> {
        let listener = TcpListener::bind("0.0.0.0:0").await?;
        let bound = listener.local_addr()?;
        write_reply(&mut stream, REP_SUCCESS, Some(Address::Socket(bound))).await?;
        debug!(
            "[{}] {} bind on {}",
            self.options.service, ctx.remote_addr, bound
        );

        let mut shutdown = ctx.shutdown.subscribe();
        let (incoming, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.recv() => return Ok(()),
        };
        drop(listener); // single-use bind

        write_reply(&mut stream, REP_SUCCESS, Some(Address::Socket(peer))).await?;

        let client_id = req.client_id.clone().unwrap_or_default();
        let (stream, _guard) =
            self.options
                .wrap_client_stream(stream, &client_id, &ctx.remote_addr);
        pipe(stream, incoming.boxed()).await;
        Ok(())
    }

    /// UDP ASSOCIATE: ephemeral UDP socket, SOCKS5 framing on the client
    /// side, routed datagrams upstream.
    async fn handle_udp(
        &self,
        ctx: &ConnContext,
        mut stream: Stream,
        req: RequestMeta,
        ro: &mut RecorderObject,
    ) -> Result<()> {
        if !self.md.enable_udp {
            write_reply(&mut stream, REP_NOT_ALLOWED, None).await?;
            return Err(Error::Unsupported("udp relay is disabled".into()));
        }

        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(e) => {
                write_reply(&mut stream, REP_FAILURE, None).await?;
                return Err(e.into());
            }
        };
        let client_ep = Arc::new(SocksUdpEndpoint::new(socket));
        let mut bound = client_ep.local_addr()?;
        ro.src_addr = bound.to_string();

        // the advertised host prefers the configured public address, then
        // the address the control conn arrived on
        if let Some(ip) = self.md.public_addr {
            bound.set_ip(ip);
        } else if let Ok(local) = ctx.local_addr.parse::<std::net::SocketAddr>() {
            bound.set_ip(local.ip());
        }
        write_reply(&mut stream, REP_SUCCESS, Some(Address::Socket(bound))).await?;
        debug!(
            "[{}] {} udp associate on {}",
            self.options.service, ctx.remote_addr, bound
        );

        let upstream = self.options.router.dial_udp(&req).await?;

        let mut relay = Relay::new(client_ep, Arc::from(upstream))
            .with_bypass(self.options.bypass.clone());
        if self.md.udp_buffer_size > 0 {
            relay = relay.with_buffer_size(self.md.udp_buffer_size);
        }

        let shutdown = ctx.shutdown.subscribe();
        let relay_task = tokio::spawn(async move { relay.run(shutdown).await });

        // the association lives as long as the control connection
        let mut sink = tokio::io::sink();
        let _ = tokio::io::copy(&mut stream, &mut sink).await;
        relay_task.abort();
        Ok(())
    }

    /// UDP-TUN: datagrams framed over the control stream itself.
    async fn handle_udp_tun(
        &self,
        ctx: &ConnContext,
        mut stream: Stream,
        req: RequestMeta,
        _ro: &mut RecorderObject,
    ) -> Result<()> {
        if !self.md.enable_udp {
            write_reply(&mut stream, REP_NOT_ALLOWED, None).await?;
            return Err(Error::Unsupported("udp relay is disabled".into()));
        }

        write_reply(&mut stream, REP_SUCCESS, None).await?;

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
}

/// Request line: `VER | CMD | RSV | ATYP ADDR PORT`.
///
/// Inner `Err(reply_code)` means the request parsed enough to answer with a
/// protocol error code.
async fn read_request(stream: &mut Stream) -> Result<std::result::Result<(u8, Address), u8>> {
    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(Error::BadVersion);
    }
    match socks_addr::read_addr(stream).await {
        Ok(address) => Ok(Ok((head[1], address))),
        Err(Error::Protocol(_)) => Ok(Err(REP_ATYP_NOT_SUPPORTED)),
        Err(e) => Err(e),
    }
}

async fn write_reply(stream: &mut Stream, reply: u8, bound: Option<Address>) -> Result<()> {
    let mut out = BytesMut::with_capacity(32);
    out.extend_from_slice(&[SOCKS5_VERSION, reply, 0x00]);
    socks_addr::encode_addr(
        &bound.unwrap_or_else(Address::unspecified),
        &mut out,
    );
    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::registry::Registry;
    use crate::router::Router;
    use tokio::sync::broadcast;

    fn handler(enable_udp: bool) -> Socks5Handler {
        let chains = Arc::new(Registry::<Chain>::new("chain"));
        let router = Arc::new(Router::new("test", chains));
        let options = HandlerOptions::new("socks5-test", router);
        Socks5Handler::new(
            options,
            Socks5Metadata {
                enable_udp,
                ..Default::default()
            },
        )
    }

    fn ctx() -> ConnContext {
        let (shutdown, _) = broadcast::channel(1);
        ConnContext {
            sid: "sid-1".into(),
            remote_addr: "127.0.0.1:50000".into(),
            local_addr: "127.0.0.1:1080".into(),
            client_addr: None,
            shutdown,
        }
    }

    #[tokio::test]
    async fn test_connect_and_echo() {
        // upstream echo server
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = echo.accept().await.unwrap();
            let (mut r, mut w) = conn.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        let (client, server) = tokio::io::duplex(4096);
        let h = handler(false);
        let context = ctx();
        let server_task =
            tokio::spawn(async move { h.handle(&context, server.boxed()).await });

        let (mut cr, mut cw) = tokio::io::split(client);

        // greeting: no-auth
        cw.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        cr.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        // CONNECT 127.0.0.1:<echo>
        let mut request = vec![0x05, 0x01, 0x00];
        socks_addr::encode_addr(&Address::Socket(echo_addr), &mut request);
        cw.write_all(&request).await.unwrap();

        let mut head = [0u8; 3];
        cr.read_exact(&mut head).await.unwrap();
        assert_eq!(head[..2], [0x05, 0x00]);
        // skip BND.ADDR (ipv4)
        let mut bnd = [0u8; 7];
        cr.read_exact(&mut bnd).await.unwrap();

        // pipe is live: echo round trip
        cw.write_all(b"ping").await.unwrap();
        let mut out = [0u8; 4];
        cr.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"ping");

        drop(cw);
        let _ = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_command_rejected() {
        let (client, server) = tokio::io::duplex(1024);
        let h = handler(false);
        let context = ctx();
        let server_task =
            tokio::spawn(async move { h.handle(&context, server.boxed()).await });

        let (mut cr, mut cw) = tokio::io::split(client);
        cw.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        cr.read_exact(&mut reply).await.unwrap();

        let mut request = vec![0x05, 0x7A, 0x00];
        socks_addr::encode_addr(&Address::domain("x", 1), &mut request);
        cw.write_all(&request).await.unwrap();

        let mut head = [0u8; 3];
        cr.read_exact(&mut head).await.unwrap();
        assert_eq!(head[1], REP_CMD_NOT_SUPPORTED);

        let err = server_task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::UnknownCmd));
    }

    #[tokio::test]
    async fn test_udp_associate_disabled() {
        let (client, server) = tokio::io::duplex(1024);
        let h = handler(false);
        let context = ctx();
        let server_task =
            tokio::spawn(async move { h.handle(&context, server.boxed()).await });

        let (mut cr, mut cw) = tokio::io::split(client);
        cw.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        cr.read_exact(&mut reply).await.unwrap();

        let mut request = vec![0x05, CMD_UDP_ASSOCIATE, 0x00];
        socks_addr::encode_addr(&Address::unspecified(), &mut request);
        cw.write_all(&request).await.unwrap();

        let mut head = [0u8; 3];
        cr.read_exact(&mut head).await.unwrap();
        assert_eq!(head[1], REP_NOT_ALLOWED);
        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_udp_tun_echo() {
        // udp echo upstream
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
        cw.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        cr.read_exact(&mut reply).await.unwrap();

        let mut request = vec![0x05, CMD_UDP_TUN, 0x00];
        socks_addr::encode_addr(&Address::unspecified(), &mut request);
        cw.write_all(&request).await.unwrap();

        let mut head = [0u8; 3];
        cr.read_exact(&mut head).await.unwrap();
        assert_eq!(head[1], REP_SUCCESS);
        let mut bnd = [0u8; 7];
        cr.read_exact(&mut bnd).await.unwrap();

        // stream-framed datagram to the echo server
        let mut frame = BytesMut::new();
        socks_addr::encode_addr(&Address::Socket(echo_addr), &mut frame);
        let payload = [0xA5u8; 16];
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(&payload);
        cw.write_all(&frame).await.unwrap();

        // echoed back with the same framing
        let echoed_addr = socks_addr::read_addr(&mut cr).await.unwrap();
        assert_eq!(echoed_addr, Address::Socket(echo_addr));
        let len = cr.read_u16().await.unwrap() as usize;
        let mut data = vec![0u8; len];
        cr.read_exact(&mut data).await.unwrap();
        assert_eq!(data, payload);
    }
}
