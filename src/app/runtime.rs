//! Runtime - builds live components from the configuration document and
//! manages their lifecycle, including hot reload.
//!
//! Reload builds every component fresh from the new document, stops the
//! old services, swaps the registries, and starts the new services. A
//! build error leaves the previous configuration fully active. In-flight
//! connections keep the objects they captured at accept time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::admission::Admission;
use crate::auth::{Auther, StaticAuther};
use crate::bypass::Bypass;
use crate::chain::{Chain, Hop, Node, NodeFilter, Selector, Strategy};
use crate::common::Address;
use crate::config::{Config, HandlerConfig, HandlerMetadata, ServiceConfig};
use crate::error::{Error, Result};
use crate::handler::{
    http::{HttpHandler, HttpMetadata},
    http3::Http3Service,
    relay::{RelayHandler, RelayMetadata},
    socks5::{Socks5Handler, Socks5Metadata},
    ss_udp::SsUdpHandler,
    unix::UnixHandler,
    Handler, HandlerOptions,
};
use crate::ingress::{Ingress, Rule};
use crate::limiter::{ConnLimiter, RateLimiter, Scope, TrafficLimiter};
use crate::observer::{observe_loop, LogObserver, DEFAULT_OBSERVER_PERIOD};
use crate::recorder::{LogRecorder, Recorder};
use crate::registry::Registries;
use crate::resolver::{CachedResolver, DnsResolver, Resolver};
use crate::router::Router;
use crate::service::{ListenerKind, Service, ServiceKind};
use crate::sniff::{CertPool, Sniffer};
use crate::stats::HandlerStats;
use crate::transport::{factories, ConnectorOptions, DialerOptions, TlsClientConfig, Transport};

/// Everything one config document builds, pre-swap.
struct Built {
    authers: HashMap<String, Arc<dyn Auther>>,
    admissions: HashMap<String, Arc<Admission>>,
    bypasses: HashMap<String, Arc<Bypass>>,
    limiters: HashMap<String, Arc<TrafficLimiter>>,
    rate_limiters: HashMap<String, Arc<RateLimiter>>,
    conn_limiters: HashMap<String, Arc<ConnLimiter>>,
    ingresses: HashMap<String, Arc<Ingress>>,
    resolvers: HashMap<String, Arc<dyn Resolver>>,
    hops: HashMap<String, Arc<Hop>>,
    chains: HashMap<String, Arc<Chain>>,
    routers: HashMap<String, Arc<Router>>,
}

pub struct Runtime {
    registries: Arc<Registries>,
    config: RwLock<Config>,
    services: Mutex<HashMap<String, Arc<Service>>>,
    recorder: Arc<dyn Recorder>,
    /// Background loops (ingress reload, observers) of the current epoch;
    /// replaced on every apply so stale loops wind down.
    epoch: Mutex<broadcast::Sender<()>>,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        crate::metrics::init_metrics();

        let (epoch, _) = broadcast::channel(1);
        let runtime = Arc::new(Self {
            registries: Arc::new(Registries::new()),
            config: RwLock::new(Config::default()),
            services: Mutex::new(HashMap::new()),
            recorder: Arc::new(LogRecorder),
            epoch: Mutex::new(epoch),
        });
        runtime.apply(config)?;
        Ok(runtime)
    }

    pub fn registries(&self) -> Arc<Registries> {
        self.registries.clone()
    }

    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    pub fn set_config<F: FnOnce(&mut Config)>(&self, mutate: F) {
        mutate(&mut self.config.write());
    }

    /// Apply a configuration document: build, stop old services, swap,
    /// start new services.
    pub fn apply(self: &Arc<Self>, config: Config) -> Result<()> {
        let built = self.build(&config)?;
        let services = self.build_services(&config, &built)?;

        // stop the old accept loops and background loops; in-flight
        // connections finish with the objects they captured
        {
            let mut running = self.services.lock();
            for (_, service) in running.drain() {
                service.stop();
            }
        }
        let epoch = {
            let (next, _) = broadcast::channel(1);
            let mut epoch = self.epoch.lock();
            let _ = epoch.send(());
            *epoch = next.clone();
            next
        };

        self.registries.authers.swap(built.authers);
        self.registries.admissions.swap(built.admissions);
        self.registries.bypasses.swap(built.bypasses);
        self.registries.limiters.swap(built.limiters);
        self.registries.rate_limiters.swap(built.rate_limiters);
        self.registries.conn_limiters.swap(built.conn_limiters);
        self.registries.ingresses.swap(built.ingresses);
        self.registries.resolvers.swap(built.resolvers);
        self.registries.hops.swap(built.hops);
        self.registries.chains.swap(built.chains);
        self.registries.routers.swap(built.routers);

        let mut recorders: HashMap<String, Arc<dyn Recorder>> = HashMap::new();
        recorders.insert("default".to_string(), self.recorder.clone());
        self.registries.recorders.swap(recorders);

        // periodic ingress reloads for this epoch
        for cfg in &config.ingresses {
            if cfg.reload_period == 0 {
                continue;
            }
            if let Some(ingress) = self.registries.ingresses.get(&cfg.name) {
                tokio::spawn(ingress.reload_loop(
                    Duration::from_secs(cfg.reload_period),
                    epoch.subscribe(),
                ));
            }
        }

        let mut running = self.services.lock();
        for (name, service, stats_loop) in services {
            let serving = service.clone();
            let service_name = name.clone();
            tokio::spawn(async move {
                if let Err(e) = serving.serve().await {
                    error!("[{}] service failed: {}", service_name, e);
                }
            });
            if let Some((stats, period)) = stats_loop {
                let shutdown = service.shutdown_sender().subscribe();
                tokio::spawn(observe_loop(
                    stats,
                    Arc::new(LogObserver),
                    period,
                    shutdown,
                ));
            }
            running.insert(name, service);
        }
        drop(running);

        *self.config.write() = config;
        info!("configuration applied");
        Ok(())
    }

    /// Reload with the stored document (the control API mutates the stored
    /// document first).
    pub fn reload(self: &Arc<Self>) -> Result<()> {
        let config = self.config();
        self.apply(config)
    }

    /// Serve until interrupted.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let api = self.config.read().api.clone();
        if let Some(api_config) = api {
            let runtime = self.clone();
            tokio::spawn(async move {
                if let Err(e) = super::api::serve_api(runtime, api_config).await {
                    error!("api server: {}", e);
                }
            });
        }

        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        let running = self.services.lock();
        for service in running.values() {
            service.stop();
        }
        Ok(())
    }

    fn build(&self, config: &Config) -> Result<Built> {
        let mut authers: HashMap<String, Arc<dyn Auther>> = HashMap::new();
        for cfg in &config.authers {
            let users = cfg
                .users
                .iter()
                .map(|u| (u.username.clone(), u.password.clone()));
            authers.insert(cfg.name.clone(), Arc::new(StaticAuther::new(users)));
        }

        let mut admissions = HashMap::new();
        for cfg in &config.admissions {
            admissions.insert(
                cfg.name.clone(),
                Arc::new(Admission::new(&cfg.patterns, cfg.whitelist)),
            );
        }

        let mut bypasses = HashMap::new();
        for cfg in &config.bypasses {
            bypasses.insert(
                cfg.name.clone(),
                Arc::new(Bypass::new(&cfg.patterns, cfg.whitelist)),
            );
        }

        let mut limiters = HashMap::new();
        let mut rate_limiters = HashMap::new();
        let mut conn_limiters = HashMap::new();
        for cfg in &config.limiters {
            let mut limits = HashMap::new();
            if cfg.service_in > 0 || cfg.service_out > 0 {
                limits.insert(Scope::Service, (cfg.service_in, cfg.service_out));
            }
            if cfg.client_in > 0 || cfg.client_out > 0 {
                limits.insert(Scope::Client, (cfg.client_in, cfg.client_out));
            }
            if cfg.conn_in > 0 || cfg.conn_out > 0 {
                limits.insert(Scope::Conn, (cfg.conn_in, cfg.conn_out));
            }
            limiters.insert(cfg.name.clone(), Arc::new(TrafficLimiter::new(limits)));
            if cfg.rate > 0 {
                rate_limiters.insert(cfg.name.clone(), Arc::new(RateLimiter::new(cfg.rate)));
            }
            if cfg.max_conns > 0 {
                conn_limiters.insert(cfg.name.clone(), Arc::new(ConnLimiter::new(cfg.max_conns)));
            }
        }

        let mut ingresses = HashMap::new();
        for cfg in &config.ingresses {
            let rules = cfg
                .rules
                .iter()
                .map(|r| Rule {
                    hostname: r.hostname.clone(),
                    endpoint: r.endpoint.clone(),
                })
                .collect();
            ingresses.insert(cfg.name.clone(), Arc::new(Ingress::new(rules)));
        }

        let mut resolvers: HashMap<String, Arc<dyn Resolver>> = HashMap::new();
        for cfg in &config.resolvers {
            resolvers.insert(
                cfg.name.clone(),
                Arc::new(CachedResolver::new(
                    Box::new(DnsResolver),
                    cfg.cache_capacity,
                    Duration::from_secs(cfg.cache_expiration),
                )),
            );
        }

        let mut hops = HashMap::new();
        for cfg in &config.hops {
            let mut nodes = Vec::with_capacity(cfg.nodes.len());
            for node_cfg in &cfg.nodes {
                let addr = Address::parse(&node_cfg.addr)?;

                let dialer_kind = if node_cfg.dialer.is_empty() {
                    "tcp"
                } else {
                    node_cfg.dialer.as_str()
                };
                let dialer_opts = DialerOptions {
                    tls: node_cfg.tls.as_ref().map(|t| TlsClientConfig {
                        server_name: t.server_name.clone(),
                        allow_insecure: t.allow_insecure,
                        ca_file: t.ca_file.clone(),
                        alpn: Vec::new(),
                    }),
                };
                let dialer = factories().dialer(dialer_kind, &dialer_opts)?;

                let connector_kind = if node_cfg.connector.is_empty() {
                    "direct"
                } else {
                    node_cfg.connector.as_str()
                };
                let connector_opts = ConnectorOptions {
                    auth: node_cfg
                        .auth
                        .as_ref()
                        .map(|a| (a.username.clone(), a.password.clone())),
                    cipher: node_cfg.cipher.clone(),
                    password: node_cfg.password.clone(),
                };
                let connector = factories().connector(connector_kind, &connector_opts)?;

                let transport = Arc::new(Transport {
                    dialer,
                    connector,
                    connect_timeout: (node_cfg.connect_timeout > 0)
                        .then(|| Duration::from_secs(node_cfg.connect_timeout)),
                });

                let mut node = Node::new(node_cfg.name.clone(), addr, transport);
                if let Some(filter) = &node_cfg.filter {
                    node = node.with_filter(NodeFilter {
                        host: filter.host.clone(),
                        protocol: filter.protocol.clone(),
                        path: filter.path.clone(),
                    });
                }
                nodes.push(Arc::new(node));
            }

            let selector = Selector::new(
                Strategy::from_name(&cfg.selector.strategy),
                cfg.selector.max_fails,
                Duration::from_secs(cfg.selector.fail_timeout),
            );
            let mut hop = Hop::new(cfg.name.clone(), nodes, selector)
                .with_ignore_filter(cfg.ignore_filter);
            if let Some(bypass_name) = &cfg.bypass {
                let bypass = bypasses
                    .get(bypass_name)
                    .ok_or_else(|| Error::Config(format!("unknown bypass: {}", bypass_name)))?;
                hop = hop.with_bypass(bypass.clone());
            }
            hops.insert(cfg.name.clone(), Arc::new(hop));
        }

        let mut chains = HashMap::new();
        for cfg in &config.chains {
            let mut chain_hops = Vec::with_capacity(cfg.hops.len());
            for hop_name in &cfg.hops {
                let hop = hops
                    .get(hop_name)
                    .ok_or_else(|| Error::Config(format!("unknown hop: {}", hop_name)))?;
                chain_hops.push(hop.clone());
            }
            chains.insert(cfg.name.clone(), Arc::new(Chain::new(cfg.name.clone(), chain_hops)));
        }

        let mut routers = HashMap::new();
        for cfg in &config.routers {
            if let Some(chain_name) = &cfg.chain {
                if !chains.contains_key(chain_name) {
                    return Err(Error::Config(format!("unknown chain: {}", chain_name)));
                }
            }
            let mut router = Router::new(cfg.name.clone(), self.registries.chains.clone())
                .with_chain(cfg.chain.clone());
            if let Some(ingress_name) = &cfg.ingress {
                let ingress = ingresses
                    .get(ingress_name)
                    .ok_or_else(|| Error::Config(format!("unknown ingress: {}", ingress_name)))?;
                router = router.with_ingress(Some(ingress.clone()));
            }
            if let Some(resolver_name) = &cfg.resolver {
                let resolver = resolvers
                    .get(resolver_name)
                    .ok_or_else(|| Error::Config(format!("unknown resolver: {}", resolver_name)))?;
                router = router.with_resolver(Some(resolver.clone()));
            }
            if cfg.cache_capacity > 0 {
                router = router.with_cache(
                    cfg.cache_capacity,
                    Duration::from_secs(cfg.cache_expiration.max(1)),
                );
            }
            routers.insert(cfg.name.clone(), Arc::new(router));
        }

        Ok(Built {
            authers,
            admissions,
            bypasses,
            limiters,
            rate_limiters,
            conn_limiters,
            ingresses,
            resolvers,
            hops,
            chains,
            routers,
        })
    }

    #[allow(clippy::type_complexity)]
    fn build_services(
        &self,
        config: &Config,
        built: &Built,
    ) -> Result<Vec<(String, Arc<Service>, Option<(Arc<HandlerStats>, Duration)>)>> {
        let mut services = Vec::with_capacity(config.services.len());
        for cfg in &config.services {
            let (service, stats_loop) = self.build_service(cfg, built)?;
            services.push((cfg.name.clone(), Arc::new(service), stats_loop));
        }
        Ok(services)
    }

    fn build_service(
        &self,
        cfg: &ServiceConfig,
        built: &Built,
    ) -> Result<(Service, Option<(Arc<HandlerStats>, Duration)>)> {
        let router = match &cfg.handler.router {
            Some(name) => built
                .routers
                .get(name)
                .cloned()
                .ok_or_else(|| Error::Config(format!("unknown router: {}", name)))?,
            None => Arc::new(Router::new(
                format!("{}.router", cfg.name),
                self.registries.chains.clone(),
            )),
        };

        let md = &cfg.handler.metadata;
        let mut options = HandlerOptions::new(cfg.name.clone(), router.clone());
        options.recorder = self.recorder.clone();
        if let Some(name) = &cfg.handler.auther {
            options.auther = Some(
                built
                    .authers
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::Config(format!("unknown auther: {}", name)))?,
            );
        }
        if let Some(name) = &cfg.bypass {
            options.bypass = Some(
                built
                    .bypasses
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::Config(format!("unknown bypass: {}", name)))?,
            );
        }
        if let Some(name) = &cfg.limiter {
            options.limiter = built.limiters.get(name).cloned();
            options.rate_limiter = built.rate_limiters.get(name).cloned();
        }
        if md.read_timeout > 0 {
            options.read_timeout = Some(Duration::from_secs(md.read_timeout));
        }

        // observer stats are attached when a period is configured
        let stats_loop = if md.observer_period > 0 {
            let stats = Arc::new(HandlerStats::new(
                cfg.name.clone(),
                md.observer_reset_traffic,
            ));
            options.stats = Some(stats.clone());
            let period = Duration::from_secs(md.observer_period).max(Duration::from_secs(1));
            Some((stats, period))
        } else if md.observer_reset_traffic {
            let stats = Arc::new(HandlerStats::new(cfg.name.clone(), true));
            options.stats = Some(stats.clone());
            Some((stats, DEFAULT_OBSERVER_PERIOD))
        } else {
            None
        };

        let sniffer = self.build_sniffer(&cfg.handler, built)?;
        let forward_hop = match &cfg.handler.forward {
            Some(name) => Some(
                built
                    .hops
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::Config(format!("unknown hop: {}", name)))?,
            ),
            None => None,
        };

        let kind = match cfg.handler.kind.as_str() {
            "socks5" | "socks" => {
                let mut handler = Socks5Handler::new(options, socks5_metadata(md)?)
                    .with_sniffer(sniffer);
                if let Some(hop) = forward_hop {
                    handler = handler.forward(hop);
                }
                ServiceKind::Stream {
                    listener: self.build_listener(cfg)?,
                    handler: Arc::new(handler),
                }
            }
            "relay" => {
                let mut handler =
                    RelayHandler::new(options, relay_metadata(md)).with_sniffer(sniffer);
                if let Some(hop) = forward_hop {
                    handler = handler.forward(hop);
                }
                ServiceKind::Stream {
                    listener: self.build_listener(cfg)?,
                    handler: Arc::new(handler),
                }
            }
            "http" => {
                let mut handler =
                    HttpHandler::new(options, http_metadata(md)).with_sniffer(sniffer);
                if let Some(hop) = forward_hop {
                    handler = handler.forward(hop);
                }
                ServiceKind::Stream {
                    listener: self.build_listener(cfg)?,
                    handler: Arc::new(handler),
                }
            }
            "http3" => {
                let handler = HttpHandler::new(options, http_metadata(md)).with_sniffer(sniffer);
                let cert_file = cfg.listener.cert_file.clone().ok_or_else(|| {
                    Error::Config("http3 service needs listener.cert_file".into())
                })?;
                let key_file = cfg
                    .listener
                    .key_file
                    .clone()
                    .ok_or_else(|| Error::Config("http3 service needs listener.key_file".into()))?;
                ServiceKind::Quic {
                    service: Arc::new(Http3Service::new(cfg.name.clone(), Arc::new(handler))),
                    cert_file,
                    key_file,
                }
            }
            "ssu" => {
                let cipher = md.cipher.as_deref().unwrap_or("chacha20-ietf-poly1305");
                let password = md.password.as_deref().unwrap_or_default();
                let mut handler = SsUdpHandler::new(cfg.name.clone(), cipher, password, router)?
                    .with_recorder(self.recorder.clone());
                handler = handler.with_bypass(options.bypass.clone());
                handler = handler.with_rate_limiter(options.rate_limiter.clone());
                ServiceKind::SsUdp(Arc::new(handler))
            }
            "unix" => {
                let target = md
                    .target
                    .as_deref()
                    .map(Address::parse)
                    .transpose()?;
                let mut handler = UnixHandler::new(options, target);
                if let Some(hop) = forward_hop {
                    handler = handler.forward(hop);
                }
                ServiceKind::Stream {
                    listener: ListenerKind::Unix,
                    handler: Arc::new(handler),
                }
            }
            other => return Err(Error::Config(format!("unknown handler: {}", other))),
        };

        let mut service = Service::new(cfg.name.clone(), cfg.addr.clone(), kind)
            .with_proxy_protocol(cfg.proxy_protocol);
        if let Some(name) = &cfg.admission {
            let admission = built
                .admissions
                .get(name)
                .cloned()
                .ok_or_else(|| Error::Config(format!("unknown admission: {}", name)))?;
            service = service.with_admission(Some(admission));
        }
        if let Some(name) = &cfg.limiter {
            service = service
                .with_limiter(built.limiters.get(name).cloned())
                .with_conn_limiter(built.conn_limiters.get(name).cloned());
        }

        Ok((service, stats_loop))
    }

    fn build_listener(&self, cfg: &ServiceConfig) -> Result<ListenerKind> {
        match cfg.listener.kind.as_str() {
            "" | "tcp" => Ok(ListenerKind::Tcp),
            "tls" => {
                let cert_file = cfg
                    .listener
                    .cert_file
                    .as_deref()
                    .ok_or_else(|| Error::Config("tls listener needs cert_file".into()))?;
                let key_file = cfg
                    .listener
                    .key_file
                    .as_deref()
                    .ok_or_else(|| Error::Config("tls listener needs key_file".into()))?;
                Ok(ListenerKind::Tls(load_tls_acceptor(cert_file, key_file)?))
            }
            "ws" => Ok(ListenerKind::Ws {
                path: cfg.listener.ws_path.clone().unwrap_or_else(|| "/".into()),
            }),
            "unix" => Ok(ListenerKind::Unix),
            other => Err(Error::Config(format!("unknown listener: {}", other))),
        }
    }

    fn build_sniffer(&self, handler: &HandlerConfig, built: &Built) -> Result<Sniffer> {
        let md = &handler.metadata;
        let mut sniffer = Sniffer::new();

        if let (Some(cert_file), Some(key_file)) = (&md.mitm_cert_file, &md.mitm_key_file) {
            let cert_pem = std::fs::read_to_string(cert_file)
                .map_err(|e| Error::Config(format!("mitm cert: {}", e)))?;
            let key_pem = std::fs::read_to_string(key_file)
                .map_err(|e| Error::Config(format!("mitm key: {}", e)))?;
            sniffer = sniffer.with_cert_pool(Some(Arc::new(CertPool::new(
                &cert_pem, &key_pem, 128,
            )?)));
        }
        if let Some(bypass_name) = &md.mitm_bypass {
            let bypass = built
                .bypasses
                .get(bypass_name)
                .cloned()
                .ok_or_else(|| Error::Config(format!("unknown bypass: {}", bypass_name)))?;
            sniffer = sniffer.with_mitm_bypass(Some(bypass));
        }
        Ok(sniffer)
    }
}

fn sniff_timeout(md: &HandlerMetadata) -> Option<Duration> {
    (md.sniffing_timeout > 0).then(|| Duration::from_secs(md.sniffing_timeout))
}

fn socks5_metadata(md: &HandlerMetadata) -> Result<Socks5Metadata> {
    let public_addr = md
        .public_addr
        .as_deref()
        .map(|s| {
            s.parse()
                .map_err(|_| Error::Config(format!("bad public_addr: {}", s)))
        })
        .transpose()?;
    Ok(Socks5Metadata {
        enable_udp: md.enable_udp,
        udp_buffer_size: md.udp_buffer_size,
        public_addr,
        sniffing: md.sniffing,
        sniffing_timeout: sniff_timeout(md),
        hash: md.hash.clone(),
    })
}

fn relay_metadata(md: &HandlerMetadata) -> RelayMetadata {
    RelayMetadata {
        no_delay: md.no_delay,
        sniffing: md.sniffing,
        sniffing_timeout: sniff_timeout(md),
        udp_buffer_size: md.udp_buffer_size,
        hash: md.hash.clone(),
    }
}

fn http_metadata(md: &HandlerMetadata) -> HttpMetadata {
    HttpMetadata {
        enable_udp: md.enable_udp,
        udp_buffer_size: md.udp_buffer_size,
        sniffing: md.sniffing,
        sniffing_timeout: sniff_timeout(md),
        hash: md.hash.clone(),
    }
}

fn load_tls_acceptor(cert_file: &str, key_file: &str) -> Result<tokio_rustls::TlsAcceptor> {
    use rustls::pki_types::PrivateKeyDer;

    crate::transport::ensure_crypto_provider();

    let certs = {
        let pem = std::fs::read(cert_file)?;
        rustls_pemfile::certs(&mut pem.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Config(format!("tls cert: {}", e)))?
    };
    let key: PrivateKeyDer<'static> = {
        let pem = std::fs::read(key_file)?;
        rustls_pemfile::private_key(&mut pem.as_slice())
            .map_err(|e| Error::Config(format!("tls key: {}", e)))?
            .ok_or_else(|| Error::Config("tls key file has no key".into()))?
    };

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("tls config: {}", e)))?;
    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(config)))
}
