//! Cryptography for the Shadowsocks paths.
//!
//! Master key derivation (EVP_BytesToKey over MD5) and per-salt session
//! subkeys (HKDF-SHA1, "ss-subkey"), plus the AEAD seal/open primitives.

mod aead;

pub use aead::{Aead, AeadCipher, CipherKind};

use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;

use crate::error::{Error, Result};

/// Nonce size shared by the supported AEADs
pub const NONCE_SIZE: usize = 12;
/// Tag size shared by the supported AEADs
pub const TAG_SIZE: usize = 16;
/// Salt length equals the cipher key length
pub const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Derive the master key from a password (OpenSSL EVP_BytesToKey, MD5).
pub fn derive_key(password: &str, key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut last: Vec<u8> = Vec::new();

    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&last);
        hasher.update(password.as_bytes());
        last = hasher.finalize().to_vec();
        key.extend_from_slice(&last);
    }

    key.truncate(key_len);
    key
}

/// Derive the per-session subkey from the master key and a salt.
pub fn session_subkey(master: &[u8], salt: &[u8]) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master);
    let mut okm = vec![0u8; master.len()];
    hk.expand(SUBKEY_INFO, &mut okm)
        .map_err(|_| Error::Crypto("subkey expansion failed".into()))?;
    Ok(okm)
}

/// Build a session cipher for one salt.
pub fn session_cipher(kind: CipherKind, master: &[u8], salt: &[u8]) -> Result<AeadCipher> {
    let subkey = session_subkey(master, salt)?;
    AeadCipher::new(kind, &subkey)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_stable() {
        let k1 = derive_key("barfoo!", 32);
        let k2 = derive_key("barfoo!", 32);
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 32);
        assert_ne!(k1, derive_key("other", 32));
    }

    #[test]
    fn test_derive_key_known_vector() {
        // EVP_BytesToKey("foobar", md5) first 16 bytes
        let key = derive_key("foobar", 16);
        let mut h = Md5::new();
        h.update(b"foobar");
        assert_eq!(key, h.finalize().to_vec());
    }

    #[test]
    fn test_session_roundtrip() {
        let master = derive_key("test-password", 32);
        let salt = [7u8; 32];
        let c = session_cipher(CipherKind::Chacha20Poly1305, &master, &salt).unwrap();
        let nonce = [0u8; NONCE_SIZE];
        let sealed = c.seal(&nonce, b"datagram").unwrap();
        assert_eq!(c.open(&nonce, &sealed).unwrap(), b"datagram");
    }
}
