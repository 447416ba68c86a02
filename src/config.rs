//! Configuration document.
//!
//! One JSON document enumerates every named component. On reload the new
//! document replaces the old wholesale; components no longer referenced
//! are unregistered and stopped.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiConfig>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub hops: Vec<HopConfig>,
    #[serde(default)]
    pub authers: Vec<AutherConfig>,
    #[serde(default)]
    pub limiters: Vec<LimiterConfig>,
    #[serde(default)]
    pub ingresses: Vec<IngressConfig>,
    #[serde(default)]
    pub resolvers: Vec<ResolverConfig>,
    #[serde(default)]
    pub routers: Vec<RouterConfig>,
    #[serde(default)]
    pub admissions: Vec<AdmissionConfig>,
    #[serde(default)]
    pub bypasses: Vec<BypassConfig>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read config: {}", e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("parse config: {}", e)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub listen: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<UserConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub listener: ListenerConfig,
    pub handler: HandlerConfig,
    /// Names of attached components
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limiter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass: Option<String>,
    #[serde(default)]
    pub proxy_protocol: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// tcp | tls | ws | unix | udp | quic
    #[serde(default = "default_listener_type", rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_path: Option<String>,
}

fn default_listener_type() -> String {
    "tcp".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// socks5 | relay | http | http3 | ssu | unix
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auther: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router: Option<String>,
    /// Forward-mode hop name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<String>,
    #[serde(default)]
    pub metadata: HandlerMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerMetadata {
    #[serde(default)]
    pub enable_udp: bool,
    #[serde(default)]
    pub no_delay: bool,
    #[serde(default)]
    pub sniffing: bool,
    /// seconds; 0 means no deadline on the sniff window
    #[serde(default)]
    pub sniffing_timeout: u64,
    #[serde(default)]
    pub read_timeout: u64,
    #[serde(default)]
    pub udp_buffer_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// ssu cipher + password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// unix forward target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// MITM CA (PEM files); presence enables TLS termination on sniff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mitm_cert_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mitm_key_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mitm_bypass: Option<String>,
    #[serde(default)]
    pub observer_reset_traffic: bool,
    /// seconds; clamped to >= 1, default 5
    #[serde(default)]
    pub observer_period: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    /// Hop names, in dialing order
    #[serde(default)]
    pub hops: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HopConfig {
    pub name: String,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass: Option<String>,
    #[serde(default)]
    pub ignore_filter: bool,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// round-robin | random | hash | fifo
    #[serde(default)]
    pub strategy: String,
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,
    /// seconds
    #[serde(default = "default_fail_timeout")]
    pub fail_timeout: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            strategy: String::new(),
            max_fails: default_max_fails(),
            fail_timeout: default_fail_timeout(),
        }
    }
}

fn default_max_fails() -> u32 {
    1
}

fn default_fail_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub addr: String,
    /// tcp | udp | tls
    #[serde(default)]
    pub dialer: String,
    /// direct | http | socks5 | relay | ss
    #[serde(default)]
    pub connector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<UserConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// seconds
    #[serde(default)]
    pub connect_timeout: u64,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub filter: Option<FilterConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default)]
    pub allow_insecure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutherConfig {
    pub name: String,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    pub name: String,
    /// bytes/sec, zero disables; `input`/`output` per scope
    #[serde(default)]
    pub service_in: u64,
    #[serde(default)]
    pub service_out: u64,
    #[serde(default)]
    pub client_in: u64,
    #[serde(default)]
    pub client_out: u64,
    #[serde(default)]
    pub conn_in: u64,
    #[serde(default)]
    pub conn_out: u64,
    /// new connections per second per host, zero disables
    #[serde(default)]
    pub rate: u32,
    /// concurrently active connections per host, zero disables
    #[serde(default)]
    pub max_conns: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngressConfig {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<IngressRuleConfig>,
    /// seconds between reloads; zero disables the loop
    #[serde(default)]
    pub reload_period: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngressRuleConfig {
    pub hostname: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub name: String,
    /// seconds
    #[serde(default = "default_resolver_ttl")]
    pub cache_expiration: u64,
    #[serde(default = "default_resolver_capacity")]
    pub cache_capacity: usize,
}

fn default_resolver_ttl() -> u64 {
    30
}

fn default_resolver_capacity() -> usize {
    128
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<String>,
    #[serde(default)]
    pub cache_capacity: usize,
    /// seconds
    #[serde(default)]
    pub cache_expiration: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub name: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub whitelist: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BypassConfig {
    pub name: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub whitelist: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses() {
        let cfg = Config::from_json(
            r#"{
                "services": [{
                    "name": "socks",
                    "addr": "127.0.0.1:1080",
                    "handler": {"type": "socks5"}
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.services.len(), 1);
        assert_eq!(cfg.services[0].listener.kind, "tcp");
        assert_eq!(cfg.services[0].handler.kind, "socks5");
    }

    #[test]
    fn test_full_document_round_trip() {
        let cfg = Config::from_json(
            r#"{
                "api": {"listen": "127.0.0.1:9090", "auth": {"username": "admin", "password": "pw"}},
                "services": [{
                    "name": "relay",
                    "addr": ":8421",
                    "listener": {"type": "tls", "cert_file": "c.pem", "key_file": "k.pem"},
                    "handler": {"type": "relay", "auther": "users", "router": "main",
                                "metadata": {"no_delay": true, "sniffing": true}}
                }],
                "chains": [{"name": "c0", "hops": ["h0"]}],
                "hops": [{"name": "h0",
                          "selector": {"strategy": "round-robin", "max_fails": 3, "fail_timeout": 60},
                          "nodes": [{"name": "n0", "addr": "proxy.example:1080",
                                     "dialer": "tcp", "connector": "socks5"}]}],
                "authers": [{"name": "users", "users": [{"username": "u", "password": "p"}]}],
                "limiters": [{"name": "lim", "client_in": 1048576, "rate": 10}],
                "ingresses": [{"name": "ing", "rules": [{"hostname": "a.example", "endpoint": "10.0.0.1:80"}]}],
                "resolvers": [{"name": "dns"}],
                "routers": [{"name": "main", "chain": "c0", "ingress": "ing"}],
                "admissions": [{"name": "adm", "patterns": ["10.0.0.0/8"], "whitelist": false}],
                "bypasses": [{"name": "byp", "patterns": ["*.internal"]}]
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.hops[0].selector.max_fails, 3);
        assert_eq!(cfg.resolvers[0].cache_expiration, 30);

        // survives a serialize/deserialize cycle
        let json = serde_json::to_string(&cfg).unwrap();
        let again = Config::from_json(&json).unwrap();
        assert_eq!(again.chains[0].hops, vec!["h0".to_string()]);
    }
}
