//! Protocol handlers - the inbound state machines.
//!
//! Every handler follows the same skeleton: build the recorder object,
//! wrap per-connection stats, enforce the rate limit, parse the protocol
//! under the read timeout, authenticate, dispatch the command, and record
//! the outcome on every exit path.

pub mod http;
pub mod http3;
pub mod relay;
pub mod socks5;
pub mod ss_udp;
pub mod unix;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::auth::Auther;
use crate::bypass::Bypass;
use crate::common::{Result, Stream};
use crate::limiter::{RateLimiter, TrafficLimiter};
use crate::recorder::{Recorder, RecorderObject};
use crate::router::Router;
use crate::stats::HandlerStats;

/// Per-connection context assembled by the service loop.
#[derive(Clone)]
pub struct ConnContext {
    pub sid: String,
    pub remote_addr: String,
    pub local_addr: String,
    /// Original client address when a proxy-protocol header was decoded
    pub client_addr: Option<String>,
    /// Service shutdown signal; long-running relays subscribe to it
    pub shutdown: broadcast::Sender<()>,
}

impl ConnContext {
    /// Client IP used for rate limiting and the request fingerprint.
    pub fn src_ip(&self) -> Option<SocketAddr> {
        let addr = self.client_addr.as_deref().unwrap_or(&self.remote_addr);
        addr.parse().ok()
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &ConnContext, stream: Stream) -> Result<()>;
}

/// Options shared by every handler.
pub struct HandlerOptions {
    pub service: String,
    pub router: Arc<Router>,
    pub auther: Option<Arc<dyn Auther>>,
    pub bypass: Option<Arc<Bypass>>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub limiter: Option<Arc<TrafficLimiter>>,
    pub recorder: Arc<dyn Recorder>,
    pub stats: Option<Arc<HandlerStats>>,
    pub read_timeout: Option<Duration>,
}

impl HandlerOptions {
    pub fn new(service: impl Into<String>, router: Arc<Router>) -> Self {
        Self {
            service: service.into(),
            router,
            auther: None,
            bypass: None,
            rate_limiter: None,
            limiter: None,
            recorder: Arc::new(crate::recorder::NopRecorder),
            stats: None,
            read_timeout: Some(Duration::from_secs(15)),
        }
    }

    pub fn check_rate_limit(&self, ctx: &ConnContext) -> bool {
        let Some(limiter) = &self.rate_limiter else {
            return true;
        };
        let host = ctx
            .src_ip()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| ctx.remote_addr.clone());
        limiter.allow(&host)
    }

    pub fn recorder_object(&self, ctx: &ConnContext, network: &str) -> RecorderObject {
        let mut ro = RecorderObject::new(&self.service, network);
        ro.remote_addr = ctx.remote_addr.clone();
        ro.local_addr = ctx.local_addr.clone();
        ro.client_addr = ctx.client_addr.clone().unwrap_or_default();
        ro.sid = ctx.sid.clone();
        ro
    }

    /// Apply a read timeout around the initial protocol parse.
    pub async fn with_read_timeout<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match self.read_timeout {
            Some(t) if !t.is_zero() => tokio::time::timeout(t, fut)
                .await
                .map_err(|_| crate::error::Error::Timeout)?,
            _ => fut.await,
        }
    }

    /// Per-connection wrap applied after authentication: client-scoped
    /// traffic limit, conn-scoped traffic limit, and per-client stats.
    pub fn wrap_client_stream(
        &self,
        stream: Stream,
        client_id: &str,
        remote: &str,
    ) -> (Stream, ClientGuard) {
        let mut stream = stream;
        if let Some(limiter) = &self.limiter {
            stream = Box::new(crate::wrapper::TrafficStream::new(
                stream,
                limiter,
                crate::limiter::Scope::Conn,
                remote,
            ));
            if !client_id.is_empty() {
                stream = Box::new(crate::wrapper::TrafficStream::new(
                    stream,
                    limiter,
                    crate::limiter::Scope::Client,
                    client_id,
                ));
            }
        }

        let guard = match &self.stats {
            Some(handler_stats) => {
                let stats = handler_stats.stats(client_id);
                stats.add(crate::stats::Kind::TotalConns, 1);
                stats.add(crate::stats::Kind::CurrentConns, 1);
                stream = Box::new(crate::wrapper::StatsStream::new(stream, stats.clone()));
                ClientGuard { stats: Some(stats) }
            }
            None => ClientGuard { stats: None },
        };

        (stream, guard)
    }
}

/// Decrements CurrentConns when the connection ends, on every exit path.
pub struct ClientGuard {
    stats: Option<Arc<crate::stats::Stats>>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        if let Some(stats) = &self.stats {
            stats.add(crate::stats::Kind::CurrentConns, -1);
        }
    }
}
