//! HTTP/1.1 proxy handler: CONNECT tunnels, forward proxying, CONNECT-UDP.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::chain::Hop;
use crate::common::{pipe, Address, Network, RequestMeta, Result, Stream};
use crate::error::Error;
use crate::metrics::SERVICE_HANDLER_ERRORS;
use crate::recorder::{HttpRecord, RecorderObject};
use crate::sniff::{self, Proto, Sniffer};
use crate::stats::{Kind, Stats};
use crate::udprelay::{Relay, StreamEndpoint};
use crate::wrapper::StatsStream;

use super::{ConnContext, Handler, HandlerOptions};

/// Hop-by-hop headers never forwarded upstream.
const HOP_HEADERS: &[&str] = &[
    "proxy-connection",
    "proxy-authorization",
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "upgrade",
];

#[derive(Default)]
pub struct HttpMetadata {
    pub enable_udp: bool,
    pub udp_buffer_size: usize,
    pub sniffing: bool,
    pub sniffing_timeout: Option<std::time::Duration>,
    pub hash: Option<String>,
}

pub struct HttpHandler {
    options: HandlerOptions,
    md: HttpMetadata,
    sniffer: Sniffer,
    forward_hop: Option<Arc<Hop>>,
}

impl HttpHandler {
    pub fn new(options: HandlerOptions, md: HttpMetadata) -> Self {
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

    pub fn forward(mut self, hop: Arc<Hop>) -> Self {
        self.forward_hop = Some(hop);
        self
    }
}

#[async_trait]
impl Handler for HttpHandler {
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

impl HttpHandler {
    async fn handle_inner(
        &self,
        ctx: &ConnContext,
        mut stream: Stream,
        ro: &mut RecorderObject,
    ) -> Result<()> {
        if !self.options.check_rate_limit(ctx) {
            return Err(Error::RateLimit);
        }

        let head = self
            .options
            .with_read_timeout(read_head(&mut stream))
            .await?;
        let parsed = ParsedRequest::parse(&head)?;
        debug!(
            "[{}] {} {} {}",
            self.options.service, ctx.remote_addr, parsed.method, parsed.uri
        );

        // proxy auth
        let client_id = match self.authenticate(&parsed).await {
            Ok(id) => id,
            Err(e) => {
                respond(
                    &mut stream,
                    407,
                    "Proxy Authentication Required",
                    &[("Proxy-Authenticate", "Basic realm=\"proxy\"")],
                )
                .await?;
                return Err(e);
            }
        };
        if let Some(id) = &client_id {
            ro.client_id = id.clone();
        }

        let is_connect = parsed.method.eq_ignore_ascii_case("CONNECT");
        let target = parsed.target()?;
        ro.host = target.canonical();

        let mut req = RequestMeta::new(Network::Tcp).with_host(target.canonical());
        req.src_addr = ctx.src_ip();
        req.client_id = client_id;
        req.path = parsed.path();
        req.proto = "http".into();
        if self.md.hash.as_deref() == Some("host") {
            req.hash = Some(target.canonical());
        }

        let (stream, _guard) = self.options.wrap_client_stream(
            stream,
            req.client_id.as_deref().unwrap_or_default(),
            &ctx.remote_addr,
        );
        let mut stream = stream;

        if let Some(bypass) = &self.options.bypass {
            if bypass.contains(Network::Tcp, &req.host) {
                respond(&mut stream, 403, "Forbidden", &[]).await?;
                return Err(Error::Bypass);
            }
        }

        // CONNECT-UDP: udp scheme or explicit header
        if is_connect && (parsed.uri.starts_with("udp://") || parsed.header("x-udp").is_some()) {
            ro.network = "udp".into();
            req.network = Network::Udp;
            return self.handle_udp(ctx, stream, req, ro).await;
        }

        if let Some(hop) = &self.forward_hop {
            return self.handle_forward(ctx, stream, hop.clone(), &head, req, ro).await;
        }

        if is_connect {
            self.handle_connect(ctx, stream, target, req, ro).await
        } else {
            self.handle_request(ctx, stream, &parsed, target, req, ro).await
        }
    }

    async fn authenticate(&self, parsed: &ParsedRequest) -> Result<Option<String>> {
        let Some(auther) = &self.options.auther else {
            return Ok(None);
        };

        let header = parsed
            .header("proxy-authorization")
            .ok_or(Error::Unauthorized)?;
        let encoded = header
            .strip_prefix("Basic ")
            .or_else(|| header.strip_prefix("basic "))
            .ok_or(Error::Unauthorized)?;
        let decoded = BASE64
            .decode(encoded.trim())
            .map_err(|_| Error::Unauthorized)?;
        let text = String::from_utf8_lossy(&decoded);
        let (user, pass) = text.split_once(':').ok_or(Error::Unauthorized)?;

        auther
            .authenticate(user, pass)
            .await
            .map(Some)
            .ok_or(Error::Unauthorized)
    }

    async fn handle_connect(
        &self,
        ctx: &ConnContext,
        mut stream: Stream,
        target: Address,
        req: RequestMeta,
        ro: &mut RecorderObject,
    ) -> Result<()> {
        let (upstream, route) = match self.options.router.dial(Network::Tcp, &target, &req).await {
            Ok(r) => r,
            Err(e) => {
                respond(&mut stream, 502, "Bad Gateway", &[]).await?;
                return Err(e);
            }
        };
        ro.route = route.route;
        ro.dst_addr = route.dst;

        respond(&mut stream, 200, "Connection established", &[]).await?;

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
                    pipe(sniffed, upstream).await;
                    return Ok(());
                }
            }
        }

        pipe(stream, upstream).await;
        Ok(())
    }

    /// Forward-proxy a plain request: rewrite to origin-form, strip
    /// hop-by-hop headers, then go transparent.
    async fn handle_request(
        &self,
        _ctx: &ConnContext,
        mut stream: Stream,
        parsed: &ParsedRequest,
        target: Address,
        req: RequestMeta,
        ro: &mut RecorderObject,
    ) -> Result<()> {
        let (mut upstream, route) =
            match self.options.router.dial(Network::Tcp, &target, &req).await {
                Ok(r) => r,
                Err(e) => {
                    respond(&mut stream, 502, "Bad Gateway", &[]).await?;
                    return Err(e);
                }
            };
        ro.route = route.route;
        ro.dst_addr = route.dst;

        upstream.write_all(&parsed.origin_form()).await?;
        upstream.flush().await?;

        ro.http = Some(HttpRecord {
            method: parsed.method.clone(),
            uri: parsed.uri.clone(),
            host: target.canonical(),
            request_headers: parsed.headers.clone(),
            ..Default::default()
        });

        let (up, down) = pipe(stream, upstream).await;
        if let Some(http) = &mut ro.http {
            http.request_len = up;
            http.response_len = down;
        }
        Ok(())
    }

    /// CONNECT-UDP: bridge stream-framed datagrams to a routed association.
    async fn handle_udp(
        &self,
        ctx: &ConnContext,
        mut stream: Stream,
        req: RequestMeta,
        ro: &mut RecorderObject,
    ) -> Result<()> {
        if !self.md.enable_udp {
            respond(&mut stream, 403, "Forbidden", &[]).await?;
            return Err(Error::Unsupported("udp relay is disabled".into()));
        }

        respond(&mut stream, 200, "OK", &[]).await?;

        let upstream = self.options.router.dial_udp(&req).await?;
        let client_ep = Arc::new(StreamEndpoint::new(stream));
        let mut relay = Relay::new(client_ep, Arc::from(upstream))
            .with_bypass(self.options.bypass.clone());
        if self.md.udp_buffer_size > 0 {
            relay = relay.with_buffer_size(self.md.udp_buffer_size);
        }
        ro.proto = "udp-tun".into();
        relay.run(ctx.shutdown.subscribe()).await
    }

    /// Forward mode: the Host header picks the node; the original head is
    /// replayed verbatim.
    async fn handle_forward(
        &self,
        ctx: &ConnContext,
        stream: Stream,
        hop: Arc<Hop>,
        head: &[u8],
        req: RequestMeta,
        ro: &mut RecorderObject,
    ) -> Result<()> {
        let mut stream = stream;
        let Some(node) = hop.select(&req) else {
            respond(&mut stream, 502, "Bad Gateway", &[]).await?;
            return Err(Error::NoRoute(req.host.clone()));
        };
        debug!(
            "[{}] {} forward {} via {}",
            self.options.service, ctx.remote_addr, req.host, node.name
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
                respond(&mut stream, 502, "Bad Gateway", &[]).await?;
                return Err(e);
            }
        };
        node.marker.reset();
        ro.route = route.route;
        ro.dst_addr = node.addr.canonical();

        upstream.write_all(head).await?;
        upstream.flush().await?;
        pipe(stream, upstream).await;
        Ok(())
    }
}

struct ParsedRequest {
    method: String,
    uri: String,
    version: String,
    headers: Vec<(String, String)>,
}

impl ParsedRequest {
    fn parse(head: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(head)
            .map_err(|_| Error::Protocol("request head not utf-8".into()))?;
        let mut lines = text.lines();
        let request_line = lines
            .next()
            .ok_or_else(|| Error::Protocol("empty request".into()))?;
        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| Error::Protocol("missing method".into()))?
            .to_string();
        let uri = parts
            .next()
            .ok_or_else(|| Error::Protocol("missing uri".into()))?
            .to_string();
        let version = parts.next().unwrap_or("HTTP/1.1").to_string();

        let headers = lines
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        Ok(Self {
            method,
            uri,
            version,
            headers,
        })
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The dial target: CONNECT authority, absolute-form host, or the Host
    /// header.
    fn target(&self) -> Result<Address> {
        if self.method.eq_ignore_ascii_case("CONNECT") {
            let authority = self
                .uri
                .strip_prefix("udp://")
                .unwrap_or(&self.uri);
            return Address::parse(authority)
                .or_else(|_| Ok(Address::domain(authority.to_string(), 443)));
        }

        if let Some(rest) = self
            .uri
            .strip_prefix("http://")
            .or_else(|| self.uri.strip_prefix("https://"))
        {
            let authority = rest.split('/').next().unwrap_or(rest);
            let default_port = if self.uri.starts_with("https") { 443 } else { 80 };
            return Address::parse(authority)
                .or_else(|_| Ok(Address::domain(authority.to_string(), default_port)));
        }

        let host = self
            .header("host")
            .ok_or_else(|| Error::Protocol("missing host".into()))?;
        Address::parse(host).or_else(|_| Ok(Address::domain(host.to_string(), 80)))
    }

    fn path(&self) -> String {
        if let Some(rest) = self
            .uri
            .strip_prefix("http://")
            .or_else(|| self.uri.strip_prefix("https://"))
        {
            match rest.find('/') {
                Some(idx) => rest[idx..].to_string(),
                None => "/".to_string(),
            }
        } else {
            self.uri.clone()
        }
    }

    /// Rebuild the head in origin form without hop-by-hop headers.
    fn origin_form(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.path(), self.version);
        for (name, value) in &self.headers {
            if HOP_HEADERS.contains(&name.to_lowercase().as_str()) {
                continue;
            }
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

async fn read_head(stream: &mut Stream) -> Result<Vec<u8>> {
    let mut head = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
        if head.len() > 16 * 1024 {
            return Err(Error::Protocol("oversized request head".into()));
        }
    }
    Ok(head)
}

async fn respond(
    stream: &mut Stream,
    status: u16,
    reason: &str,
    headers: &[(&str, &str)],
) -> Result<()> {
    let mut out = format!("HTTP/1.1 {} {}\r\n", status, reason);
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("\r\n");
    stream.write_all(out.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
