//! Shadowsocks AEAD UDP service.
//!
//! One bound socket serves every client; sources are demultiplexed through
//! a NAT table so each client peer gets its own routed upstream
//! association. Undecryptable packets are dropped silently.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::bypass::Bypass;
use crate::common::{Network, RequestMeta, Result};
use crate::crypto::{self, CipherKind};
use crate::limiter::RateLimiter;
use crate::recorder::{Recorder, RecorderObject};
use crate::router::Router;
use crate::udprelay::{open_ss_packet, seal_ss_packet, PacketEndpoint};

/// Associations idle longer than this are dropped.
const NAT_TTL: Duration = Duration::from_secs(120);

pub struct SsUdpHandler {
    service: String,
    kind: CipherKind,
    master_key: Vec<u8>,
    router: Arc<Router>,
    bypass: Option<Arc<Bypass>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    recorder: Arc<dyn Recorder>,
    buffer_size: usize,
}

struct Association {
    upstream: Arc<dyn PacketEndpoint>,
    reply_task: tokio::task::JoinHandle<()>,
    last_seen: Instant,
    started: Instant,
    ro: RecorderObject,
}

impl SsUdpHandler {
    pub fn new(
        service: impl Into<String>,
        cipher: &str,
        password: &str,
        router: Arc<Router>,
    ) -> Result<Self> {
        let kind = CipherKind::from_name(cipher)?;
        let master_key = crypto::derive_key(password, kind.key_size());
        Ok(Self {
            service: service.into(),
            kind,
            master_key,
            router,
            bypass: None,
            rate_limiter: None,
            recorder: Arc::new(crate::recorder::NopRecorder),
            buffer_size: crate::udprelay::DEFAULT_BUFFER_SIZE,
        })
    }

    pub fn with_bypass(mut self, bypass: Option<Arc<Bypass>>) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Option<Arc<RateLimiter>>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn Recorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Serve the bound socket until shutdown.
    pub async fn serve(&self, socket: UdpSocket, shutdown: broadcast::Sender<()>) -> Result<()> {
        let socket = Arc::new(socket);
        info!("[{}] ssu listening on {}", self.service, socket.local_addr()?);

        let nat: Arc<Mutex<HashMap<SocketAddr, Association>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut rx = shutdown.subscribe();
        let mut buf = vec![0u8; 65535];

        loop {
            let (n, from) = tokio::select! {
                r = socket.recv_from(&mut buf) => r?,
                _ = rx.recv() => break,
            };

            let (target, payload) = match open_ss_packet(self.kind, &self.master_key, &buf[..n]) {
                Ok(v) => v,
                Err(_) => {
                    trace!("[{}] undecryptable packet from {}", self.service, from);
                    continue;
                }
            };

            if let Some(bypass) = &self.bypass {
                if bypass.contains(Network::Udp, &target.canonical()) {
                    trace!("[{}] bypass {}", self.service, target);
                    continue;
                }
            }

            let upstream = match self.association(&nat, &socket, from).await {
                Ok(Some(up)) => up,
                Ok(None) => continue, // rate limited
                Err(e) => {
                    warn!("[{}] association for {}: {}", self.service, from, e);
                    continue;
                }
            };

            if let Err(e) = upstream.send_to(&payload, &target).await {
                debug!("[{}] forward to {}: {}", self.service, target, e);
            }
        }

        // drain the NAT table, recording each association once
        let mut nat = nat.lock();
        for (_, assoc) in nat.drain() {
            assoc.reply_task.abort();
            let mut ro = assoc.ro;
            ro.set_duration(assoc.started.elapsed());
            let recorder = self.recorder.clone();
            tokio::spawn(async move { recorder.record(&ro).await });
        }
        Ok(())
    }

    /// Find or create the routed upstream for one client source.
    async fn association(
        &self,
        nat: &Arc<Mutex<HashMap<SocketAddr, Association>>>,
        socket: &Arc<UdpSocket>,
        from: SocketAddr,
    ) -> Result<Option<Arc<dyn PacketEndpoint>>> {
        {
            let mut table = nat.lock();
            if let Some(assoc) = table.get_mut(&from) {
                assoc.last_seen = Instant::now();
                return Ok(Some(assoc.upstream.clone()));
            }

            // opportunistic pruning on the insert path
            let deadline = Instant::now() - NAT_TTL;
            table.retain(|_, a| {
                let live = a.last_seen > deadline;
                if !live {
                    a.reply_task.abort();
                }
                live
            });
        }

        if let Some(limiter) = &self.rate_limiter {
            if !limiter.allow(&from.ip().to_string()) {
                debug!("[{}] rate limited {}", self.service, from);
                return Ok(None);
            }
        }

        let mut req = RequestMeta::new(Network::Udp);
        req.src_addr = Some(from);
        let upstream: Arc<dyn PacketEndpoint> = Arc::from(self.router.dial_udp(&req).await?);

        let mut ro = RecorderObject::new(&self.service, "udp");
        ro.remote_addr = from.to_string();
        ro.sid = uuid::Uuid::new_v4().to_string();
        if let Ok(local) = socket.local_addr() {
            ro.local_addr = local.to_string();
        }

        // reply pump: upstream datagrams are sealed back to this client
        let reply_task = {
            let upstream = upstream.clone();
            let socket = socket.clone();
            let kind = self.kind;
            let master = self.master_key.clone();
            let buffer_size = self.buffer_size;
            tokio::spawn(async move {
                let mut buf = vec![0u8; buffer_size.max(2048)];
                loop {
                    let (n, addr) = match upstream.recv_from(&mut buf).await {
                        Ok(v) => v,
                        Err(_) => return,
                    };
                    let packet = match seal_ss_packet(kind, &master, &addr, &buf[..n]) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    if socket.send_to(&packet, from).await.is_err() {
                        return;
                    }
                }
            })
        };

        debug!("[{}] new association {}", self.service, from);
        let upstream_ret = upstream.clone();
        nat.lock().insert(
            from,
            Association {
                upstream,
                reply_task,
                last_seen: Instant::now(),
                started: Instant::now(),
                ro,
            },
        );
        Ok(Some(upstream_ret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::common::Address;
    use crate::registry::Registry;

    #[tokio::test]
    async fn test_ssu_end_to_end_echo() {
        // udp echo upstream
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let chains = Arc::new(Registry::<Chain>::new("chain"));
        let router = Arc::new(Router::new("test", chains));
        let handler =
            SsUdpHandler::new("ssu-test", "chacha20-ietf-poly1305", "pw", router).unwrap();
        let kind = handler.kind;
        let key = handler.master_key.clone();

        let server_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_sock.local_addr().unwrap();
        let (shutdown, _) = broadcast::channel(1);
        tokio::spawn(async move { handler.serve(server_sock, shutdown).await });

        // encrypted client datagram
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let packet = seal_ss_packet(
            kind,
            &key,
            &Address::Socket(echo_addr),
            b"ss-ping",
        )
        .unwrap();
        client.send_to(&packet, server_addr).await.unwrap();

        // encrypted reply
        let mut buf = [0u8; 2048];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let (from, payload) = open_ss_packet(kind, &key, &buf[..n]).unwrap();
        assert_eq!(from, Address::Socket(echo_addr));
        assert_eq!(payload, b"ss-ping");
    }

    #[tokio::test]
    async fn test_garbage_ignored() {
        let chains = Arc::new(Registry::<Chain>::new("chain"));
        let router = Arc::new(Router::new("test", chains));
        let handler = SsUdpHandler::new("ssu-test", "aes-128-gcm", "pw", router).unwrap();

        let server_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_sock.local_addr().unwrap();
        let (shutdown, _) = broadcast::channel(1);
        let serve = tokio::spawn(async move { handler.serve(server_sock, shutdown).await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[0u8; 32], server_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!serve.is_finished(), "garbage must not kill the service");
        serve.abort();
    }
}
