//! AEAD seal/open for the Shadowsocks packet format.

use aes_gcm::{
    aead::{Aead as AeadTrait, KeyInit},
    Aes128Gcm, Aes256Gcm, Nonce,
};
use chacha20poly1305::ChaCha20Poly1305;

use super::NONCE_SIZE;
use crate::error::{Error, Result};

/// Cipher types supported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    Chacha20Poly1305,
}

impl CipherKind {
    /// Key length, which is also the salt length on the wire.
    pub fn key_size(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm => 32,
            CipherKind::Chacha20Poly1305 => 32,
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(CipherKind::Chacha20Poly1305),
            other => Err(Error::Config(format!("unknown cipher: {}", other))),
        }
    }
}

/// AEAD cipher trait
pub trait Aead: Send + Sync {
    fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;
    fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;
    fn kind(&self) -> CipherKind;
}

/// AEAD cipher implementation
pub struct AeadCipher {
    kind: CipherKind,
    inner: CipherInner,
}

enum CipherInner {
    Aes128Gcm(Aes128Gcm),
    Aes256Gcm(Aes256Gcm),
    Chacha20Poly1305(ChaCha20Poly1305),
}

impl AeadCipher {
    pub fn new(kind: CipherKind, key: &[u8]) -> Result<Self> {
        if key.len() != kind.key_size() {
            return Err(Error::Crypto(format!(
                "invalid key size: expected {}, got {}",
                kind.key_size(),
                key.len()
            )));
        }

        let inner = match kind {
            CipherKind::Aes128Gcm => CipherInner::Aes128Gcm(
                Aes128Gcm::new_from_slice(key)
                    .map_err(|e| Error::Crypto(format!("cipher init: {}", e)))?,
            ),
            CipherKind::Aes256Gcm => CipherInner::Aes256Gcm(
                Aes256Gcm::new_from_slice(key)
                    .map_err(|e| Error::Crypto(format!("cipher init: {}", e)))?,
            ),
            CipherKind::Chacha20Poly1305 => CipherInner::Chacha20Poly1305(
                ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|e| Error::Crypto(format!("cipher init: {}", e)))?,
            ),
        };

        Ok(Self { kind, inner })
    }
}

impl Aead for AeadCipher {
    fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_SIZE {
            return Err(Error::Crypto("invalid nonce size".into()));
        }
        let nonce = Nonce::from_slice(nonce);
        let out = match &self.inner {
            CipherInner::Aes128Gcm(c) => c.encrypt(nonce, plaintext),
            CipherInner::Aes256Gcm(c) => c.encrypt(nonce, plaintext),
            CipherInner::Chacha20Poly1305(c) => c.encrypt(nonce, plaintext),
        };
        out.map_err(|_| Error::Crypto("seal failed".into()))
    }

    fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_SIZE {
            return Err(Error::Crypto("invalid nonce size".into()));
        }
        let nonce = Nonce::from_slice(nonce);
        let out = match &self.inner {
            CipherInner::Aes128Gcm(c) => c.decrypt(nonce, ciphertext),
            CipherInner::Aes256Gcm(c) => c.decrypt(nonce, ciphertext),
            CipherInner::Chacha20Poly1305(c) => c.decrypt(nonce, ciphertext),
        };
        out.map_err(|_| Error::Crypto("open failed: bad tag".into()))
    }

    fn kind(&self) -> CipherKind {
        self.kind
    }
}
