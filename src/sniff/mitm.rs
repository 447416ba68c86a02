//! TLS man-in-the-middle termination.
//!
//! When a sniffed connection turns out to be TLS and a CA is configured,
//! the client side is terminated with a leaf certificate minted for the
//! SNI (memoized per server name), the upstream side is re-encrypted over
//! the already-dialed conn, and the cleartext HTTP exchange in between is
//! observed into the recorder object.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};
use tracing::debug;

use crate::bypass::Bypass;
use crate::common::{pipe, StreamConn, Result, Stream};
use crate::error::Error;
use crate::recorder::{HttpRecord, RecorderObject};
use crate::transport::tls_insecure_verifier;

/// Leaf certificates memoized by SNI.
pub struct CertPool {
    ca_cert_pem: String,
    ca_key: KeyPair,
    ca_der: CertificateDer<'static>,
    alpn: Vec<Vec<u8>>,
    cache: Mutex<LruCache<String, Arc<ServerConfig>>>,
}

impl CertPool {
    pub fn new(ca_cert_pem: &str, ca_key_pem: &str, capacity: usize) -> Result<Self> {
        crate::transport::ensure_crypto_provider();

        let ca_key = KeyPair::from_pem(ca_key_pem)
            .map_err(|e| Error::Config(format!("mitm ca key: {}", e)))?;

        // re-assemble the CA certificate so it can act as an issuer
        let ca_params = CertificateParams::from_ca_cert_pem(ca_cert_pem)
            .map_err(|e| Error::Config(format!("mitm ca cert: {}", e)))?;
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .map_err(|e| Error::Config(format!("mitm ca cert: {}", e)))?;
        let ca_der = ca_cert.der().clone();

        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            ca_cert_pem: ca_cert_pem.to_string(),
            ca_key,
            ca_der,
            alpn: vec![b"http/1.1".to_vec()],
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Server config carrying a leaf for `server_name`, minted on first use.
    pub fn server_config(&self, server_name: &str) -> Result<Arc<ServerConfig>> {
        if let Some(found) = self.cache.lock().get(server_name) {
            return Ok(found.clone());
        }

        let config = Arc::new(self.mint(server_name)?);
        self.cache
            .lock()
            .put(server_name.to_string(), config.clone());
        Ok(config)
    }

    fn mint(&self, server_name: &str) -> Result<ServerConfig> {
        debug!("mitm: minting leaf for {}", server_name);

        let issuer_params = CertificateParams::from_ca_cert_pem(&self.ca_cert_pem)
            .map_err(|e| Error::Crypto(format!("issuer params: {}", e)))?;
        let issuer = issuer_params
            .self_signed(&self.ca_key)
            .map_err(|e| Error::Crypto(format!("issuer cert: {}", e)))?;

        let leaf_key =
            KeyPair::generate().map_err(|e| Error::Crypto(format!("leaf key: {}", e)))?;
        let params = CertificateParams::new(vec![server_name.to_string()])
            .map_err(|e| Error::Crypto(format!("leaf params: {}", e)))?;
        let leaf = params
            .signed_by(&leaf_key, &issuer, &self.ca_key)
            .map_err(|e| Error::Crypto(format!("leaf sign: {}", e)))?;

        let chain = vec![leaf.der().clone(), self.ca_der.clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| Error::Crypto(format!("server config: {}", e)))?;
        config.alpn_protocols = self.alpn.clone();
        Ok(config)
    }
}

/// Sniffer post-classification handling.
pub struct Sniffer {
    cert_pool: Option<Arc<CertPool>>,
    mitm_bypass: Option<Arc<Bypass>>,
    inject_headers: Vec<(String, String)>,
}

impl Sniffer {
    pub fn new() -> Self {
        Self {
            cert_pool: None,
            mitm_bypass: None,
            inject_headers: Vec::new(),
        }
    }

    pub fn with_cert_pool(mut self, pool: Option<Arc<CertPool>>) -> Self {
        self.cert_pool = pool;
        self
    }

    pub fn with_mitm_bypass(mut self, bypass: Option<Arc<Bypass>>) -> Self {
        self.mitm_bypass = bypass;
        self
    }

    pub fn with_inject_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.inject_headers = headers;
        self
    }

    /// Sniffed HTTP on the cleartext: observe the first exchange, then go
    /// transparent.
    pub async fn handle_http(
        &self,
        client: Stream,
        upstream: Stream,
        ro: &mut RecorderObject,
    ) -> Result<()> {
        self.observe_exchange(client, upstream, ro).await
    }

    /// Sniffed TLS: terminate when MITM applies, else proxy the records
    /// untouched.
    pub async fn handle_tls(
        &self,
        client: Stream,
        upstream: Stream,
        host: &str,
        ro: &mut RecorderObject,
    ) -> Result<()> {
        let pool = match &self.cert_pool {
            Some(pool) => pool.clone(),
            None => {
                let (up, down) = pipe(client, upstream).await;
                ro.input_bytes += up;
                ro.output_bytes += down;
                return Ok(());
            }
        };
        if let Some(bypass) = &self.mitm_bypass {
            if bypass.contains(crate::common::Network::Tcp, host) {
                debug!("mitm: bypass {}", host);
                let (up, down) = pipe(client, upstream).await;
                ro.input_bytes += up;
                ro.output_bytes += down;
                return Ok(());
            }
        }

        // client side: accept with a leaf minted for the presented SNI
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), client);
        let start = acceptor.await?;
        let sni = start
            .client_hello()
            .server_name()
            .map(|s| s.to_string())
            .unwrap_or_else(|| {
                host.rsplit_once(':')
                    .map(|(h, _)| h.to_string())
                    .unwrap_or_else(|| host.to_string())
            });
        let config = pool.server_config(&sni)?;
        let client_tls = start.into_stream(config).await?;

        // upstream side: re-encrypt over the conn that is already dialed
        let mut upstream_config = ClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        upstream_config
            .dangerous()
            .set_certificate_verifier(tls_insecure_verifier());
        let connector = TlsConnector::from(Arc::new(upstream_config));
        let server_name = ServerName::try_from(sni.clone())
            .map_err(|_| Error::InvalidAddress(sni.clone()))?;
        let upstream_tls = connector.connect(server_name, upstream).await?;

        ro.proto = "tls".into();
        self.observe_exchange(
            client_tls.boxed(),
            upstream_tls.boxed(),
            ro,
        )
        .await
    }

    /// Read one request head and one response head, recording and
    /// rewriting them, then pipe the rest of the session transparently.
    async fn observe_exchange(
        &self,
        mut client: Stream,
        mut upstream: Stream,
        ro: &mut RecorderObject,
    ) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let request_head = read_head(&mut client).await?;
        let (method, uri, req_headers) = parse_request_head(&request_head)?;
        let host = header_value(&req_headers, "host").unwrap_or_default();

        let mut record = HttpRecord {
            method,
            uri,
            host: host.clone(),
            request_headers: req_headers,
            ..Default::default()
        };
        if !host.is_empty() && ro.host.is_empty() {
            ro.host = host;
        }

        upstream
            .write_all(&inject(&request_head, &self.inject_headers))
            .await?;
        upstream.flush().await?;

        let response_head = read_head(&mut upstream).await?;
        let (status, resp_headers) = parse_response_head(&response_head)?;
        record.status = status;
        record.response_headers = resp_headers;

        client.write_all(&response_head).await?;
        client.flush().await?;

        // bodies and any further requests flow untouched
        let (up, down) = pipe(client, upstream).await;
        record.request_len = up;
        record.response_len = down;
        ro.http = Some(record);
        Ok(())
    }
}

impl Default for Sniffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Read an HTTP head (through the blank line), bounded at 16KB.
async fn read_head(stream: &mut Stream) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;

    let mut head = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
        if head.len() > 16 * 1024 {
            return Err(Error::Protocol("oversized http head".into()));
        }
    }
    Ok(head)
}

fn parse_headers(lines: std::str::Lines<'_>) -> Vec<(String, String)> {
    lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn parse_request_head(head: &[u8]) -> Result<(String, String, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head)
        .map_err(|_| Error::Protocol("request head not utf-8".into()))?;
    let mut lines = text.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| Error::Protocol("empty request head".into()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Error::Protocol("missing method".into()))?
        .to_string();
    let uri = parts
        .next()
        .ok_or_else(|| Error::Protocol("missing uri".into()))?
        .to_string();
    Ok((method, uri, parse_headers(lines)))
}

fn parse_response_head(head: &[u8]) -> Result<(u16, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head)
        .map_err(|_| Error::Protocol("response head not utf-8".into()))?;
    let mut lines = text.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| Error::Protocol("empty response head".into()))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Protocol("malformed status line".into()))?;
    Ok((status, parse_headers(lines)))
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

/// Splice extra headers in before the final CRLF.
fn inject(head: &[u8], extra: &[(String, String)]) -> Vec<u8> {
    if extra.is_empty() {
        return head.to_vec();
    }
    let mut out = head[..head.len() - 2].to_vec();
    for (name, value) in extra {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ca() -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "viaduct test ca");
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn test_cert_pool_memoizes_by_sni() {
        let (cert_pem, key_pem) = test_ca();
        let pool = CertPool::new(&cert_pem, &key_pem, 8).unwrap();

        let a1 = pool.server_config("a.example").unwrap();
        let a2 = pool.server_config("a.example").unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));

        let b = pool.server_config("b.example").unwrap();
        assert!(!Arc::ptr_eq(&a1, &b));
    }

    #[test]
    fn test_cert_pool_lru_eviction() {
        let (cert_pem, key_pem) = test_ca();
        let pool = CertPool::new(&cert_pem, &key_pem, 1).unwrap();

        let a1 = pool.server_config("a.example").unwrap();
        let _b = pool.server_config("b.example").unwrap(); // evicts a
        let a2 = pool.server_config("a.example").unwrap();
        assert!(!Arc::ptr_eq(&a1, &a2), "evicted entry re-minted");
    }

    #[tokio::test]
    async fn test_minted_leaf_chains_to_ca() {
        use tokio::io::AsyncWriteExt;
        use tokio_rustls::TlsAcceptor;

        let (cert_pem, key_pem) = test_ca();
        let pool = CertPool::new(&cert_pem, &key_pem, 8).unwrap();
        let server_config = pool.server_config("secure.example").unwrap();

        // client trusts only the CA
        let mut roots = RootCertStore::empty();
        roots.add(pool.ca_der.clone()).unwrap();
        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let (client_side, server_side) = tokio::io::duplex(16 * 1024);

        let server = tokio::spawn(async move {
            let acceptor = TlsAcceptor::from(server_config);
            let mut tls = acceptor.accept(server_side).await.unwrap();
            tls.write_all(b"ok").await.unwrap();
            tls.shutdown().await.unwrap();
        });

        let connector = TlsConnector::from(Arc::new(client_config));
        let name = ServerName::try_from("secure.example").unwrap();
        let mut tls = connector.connect(name, client_side).await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut out = Vec::new();
        tls.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"ok");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_mitm_terminates_and_records_http() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio_rustls::TlsAcceptor;

        let (ca_pem, ca_key_pem) = test_ca();
        let pool = Arc::new(CertPool::new(&ca_pem, &ca_key_pem, 8).unwrap());
        let ca_der = pool.ca_der.clone();

        // upstream: a TLS server with its own self-signed cert, answering
        // one HTTP request
        let upstream_key = KeyPair::generate().unwrap();
        let upstream_cert = CertificateParams::new(vec!["secure.example".to_string()])
            .unwrap()
            .self_signed(&upstream_key)
            .unwrap();
        let upstream_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![upstream_cert.der().clone()],
                rustls::pki_types::PrivateKeyDer::Pkcs8(
                    rustls::pki_types::PrivatePkcs8KeyDer::from(upstream_key.serialize_der()),
                ),
            )
            .unwrap();

        let (upstream_near, upstream_far) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let acceptor = TlsAcceptor::from(Arc::new(upstream_config));
            let mut tls = acceptor.accept(upstream_far).await.unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                tls.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }
            tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody")
                .await
                .unwrap();
            let _ = tls.shutdown().await;
        });

        // the sniffer terminates the client side and re-encrypts upstream
        let (client_near, client_far) = tokio::io::duplex(16 * 1024);
        let sniffer = Sniffer::new().with_cert_pool(Some(pool));
        let mitm = tokio::spawn(async move {
            let mut ro = RecorderObject::new("svc", "tcp");
            sniffer
                .handle_tls(
                    Box::new(client_far) as Stream,
                    Box::new(upstream_near) as Stream,
                    "secure.example:443",
                    &mut ro,
                )
                .await
                .unwrap();
            ro
        });

        // the client trusts only the MITM CA
        let mut roots = RootCertStore::empty();
        roots.add(ca_der).unwrap();
        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));
        let name = ServerName::try_from("secure.example").unwrap();
        let mut tls = connector.connect(name, client_near).await.unwrap();

        tls.write_all(b"GET / HTTP/1.1\r\nHost: secure.example\r\n\r\n")
            .await
            .unwrap();
        tls.flush().await.unwrap();

        let mut response = vec![0u8; 256];
        let n = tls.read(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response[..n]);
        assert!(text.starts_with("HTTP/1.1 200"));

        let mut body = Vec::new();
        let _ = tls.read_to_end(&mut body).await;
        drop(tls);

        let ro = mitm.await.unwrap();
        let http = ro.http.expect("http sub-record present");
        assert_eq!(http.method, "GET");
        assert_eq!(http.status, 200);
        assert_eq!(http.host, "secure.example");
    }

    #[test]
    fn test_inject_headers() {
        let head = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let out = inject(head, &[("X-Via".to_string(), "viaduct".to_string())]);
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("X-Via: viaduct\r\n\r\n"));
        assert!(text.starts_with("GET / HTTP/1.1\r\nHost: a\r\n"));
    }

    #[test]
    fn test_parse_heads() {
        let (method, uri, headers) =
            parse_request_head(b"GET /index HTTP/1.1\r\nHost: x.example\r\n\r\n").unwrap();
        assert_eq!(method, "GET");
        assert_eq!(uri, "/index");
        assert_eq!(header_value(&headers, "Host").as_deref(), Some("x.example"));

        let (status, _) = parse_response_head(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
        assert_eq!(status, 200);
    }
}
