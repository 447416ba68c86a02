//! Unix socket handler - forward mode only.
//!
//! Every accepted connection is piped to the configured target (or to a
//! hop-selected node), dialed through the router.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::chain::Hop;
use crate::common::{pipe, Address, Network, RequestMeta, Result, Stream};
use crate::error::Error;
use crate::metrics::SERVICE_HANDLER_ERRORS;
use crate::recorder::RecorderObject;
use crate::stats::{Kind, Stats};
use crate::wrapper::StatsStream;

use super::{ConnContext, Handler, HandlerOptions};

pub struct UnixHandler {
    options: HandlerOptions,
    /// Fixed forward target; a forward hop overrides it per connection.
    target: Option<Address>,
    forward_hop: Option<Arc<Hop>>,
}

impl UnixHandler {
    pub fn new(options: HandlerOptions, target: Option<Address>) -> Self {
        Self {
            options,
            target,
            forward_hop: None,
        }
    }

    pub fn forward(mut self, hop: Arc<Hop>) -> Self {
        self.forward_hop = Some(hop);
        self
    }
}

#[async_trait]
impl Handler for UnixHandler {
    async fn handle(&self, ctx: &ConnContext, stream: Stream) -> Result<()> {
        let start = Instant::now();
        let mut ro = self.options.recorder_object(ctx, "unix");

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
        result
    }
}

impl UnixHandler {
    async fn handle_inner(
        &self,
        ctx: &ConnContext,
        stream: Stream,
        ro: &mut RecorderObject,
    ) -> Result<()> {
        if !self.options.check_rate_limit(ctx) {
            return Err(Error::RateLimit);
        }

        let mut req = RequestMeta::new(Network::Tcp);
        req.src_addr = ctx.src_ip();

        // the connection's target semantic is the configured address
        let target = match (&self.forward_hop, &self.target) {
            (Some(hop), fixed) => {
                if let Some(addr) = fixed {
                    req.host = addr.canonical();
                }
                let node = hop
                    .select(&req)
                    .ok_or_else(|| Error::NoRoute("no forward node".into()))?;
                node.addr.clone()
            }
            (None, Some(addr)) => addr.clone(),
            (None, None) => return Err(Error::Config("unix handler has no target".into())),
        };
        ro.host = target.canonical();
        req.host = target.canonical();

        if let Some(bypass) = &self.options.bypass {
            if bypass.contains(Network::Tcp, &req.host) {
                return Err(Error::Bypass);
            }
        }

        let (upstream, route) = self.options.router.dial(Network::Tcp, &target, &req).await?;
        ro.route = route.route;
        ro.dst_addr = route.dst;

        let (stream, _guard) = self.options.wrap_client_stream(stream, "", &ctx.remote_addr);

        debug!("[{}] {} <-> {}", self.options.service, ctx.remote_addr, target);
        pipe(stream, upstream).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::common::StreamConn;
    use crate::registry::Registry;
    use crate::router::Router;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::broadcast;

    #[tokio::test]
    async fn test_forward_to_fixed_target() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = echo.accept().await.unwrap();
            let (mut r, mut w) = conn.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        let chains = Arc::new(Registry::<Chain>::new("chain"));
        let router = Arc::new(Router::new("test", chains));
        let handler = UnixHandler::new(
            HandlerOptions::new("unix-test", router),
            Some(Address::Socket(echo_addr)),
        );

        let (shutdown, _) = broadcast::channel(1);
        let ctx = ConnContext {
            sid: "sid-unix".into(),
            remote_addr: "@client".into(),
            local_addr: "/tmp/test.sock".into(),
            client_addr: None,
            shutdown,
        };

        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(async move { handler.handle(&ctx, server.boxed()).await });

        let (mut cr, mut cw) = tokio::io::split(client);
        cw.write_all(b"over unix").await.unwrap();
        let mut out = [0u8; 9];
        cr.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"over unix");
    }
}
