//! TLS dialer: wraps an inner dialer and drives the client handshake.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::common::{Address, StreamConn, Result, Stream};
use crate::error::Error;

use super::Dialer;

#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// SNI override; defaults to the dialed host
    pub server_name: Option<String>,
    /// Skip upstream certificate verification
    pub allow_insecure: bool,
    /// Extra trust anchors (PEM file)
    pub ca_file: Option<String>,
    pub alpn: Vec<String>,
}

pub struct TlsDialer {
    inner: Arc<dyn Dialer>,
    connector: TlsConnector,
    server_name: Option<String>,
}

impl TlsDialer {
    pub fn new(inner: Arc<dyn Dialer>, cfg: TlsClientConfig) -> Result<Self> {
        ensure_crypto_provider();

        let mut roots = RootCertStore::empty();
        if let Some(path) = &cfg.ca_file {
            let pem = std::fs::read(path)?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                let cert = cert.map_err(|e| Error::Config(format!("bad ca file: {}", e)))?;
                roots
                    .add(cert)
                    .map_err(|e| Error::Config(format!("bad ca cert: {}", e)))?;
            }
        }

        let mut client_config = if cfg.allow_insecure {
            let mut c = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            c.dangerous()
                .set_certificate_verifier(Arc::new(SkipServerVerification::default()));
            c
        } else {
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        if !cfg.alpn.is_empty() {
            client_config.alpn_protocols =
                cfg.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        }

        Ok(Self {
            inner,
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name: cfg.server_name,
        })
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, addr: &Address) -> Result<Stream> {
        let stream = self.inner.dial(addr).await?;

        let sni = self
            .server_name
            .clone()
            .unwrap_or_else(|| addr.host());
        let server_name = ServerName::try_from(sni)
            .map_err(|_| Error::InvalidAddress(addr.to_string()))?;

        let tls = self.connector.connect(server_name, stream).await?;
        Ok(tls.boxed())
    }
}

/// Shared verifier handle for the MITM upstream leg and insecure dialers.
pub fn insecure_verifier() -> Arc<dyn ServerCertVerifier> {
    Arc::new(SkipServerVerification::default())
}

/// Pin the process-wide rustls provider so config builders behave the same
/// no matter which crypto features the dependency graph pulls in.
pub fn ensure_crypto_provider() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// Certificate verifier that accepts anything (allow_insecure).
#[derive(Debug)]
pub struct SkipServerVerification {
    schemes: Vec<SignatureScheme>,
}

impl Default for SkipServerVerification {
    fn default() -> Self {
        Self {
            schemes: vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ],
        }
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
