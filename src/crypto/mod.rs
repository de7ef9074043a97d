//! Cryptographic helpers
//!
//! This module provides:
//! - Optional whole-body encryption for tunnel requests (ChaCha20-Poly1305 or AES-256-GCM)
//! - HKDF-SHA256 key derivation from the configured password
//! - Secure random number generation

mod aead;
mod kdf;

pub use aead::{Cipher, EncryptMethod};
pub use kdf::{derive_block_key, Hkdf};

use rand::Rng;
use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Unsupported encrypt method: {0}")]
    UnsupportedMethod(String),

    #[error("Random source failure")]
    Random,
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| CryptoError::Random)
}

/// Generate a random nonce
pub fn generate_nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    random_bytes(&mut nonce)?;
    Ok(nonce)
}

/// Random lowercase ASCII string (session ids, padding headers)
pub fn random_lowercase(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from(b'a' + rng.random_range(0..26u8)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1).unwrap();
        random_bytes(&mut buf2).unwrap();
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_random_lowercase() {
        let s = random_lowercase(8);
        assert_eq!(s.len(), 8);
        assert!(s.bytes().all(|b| b.is_ascii_lowercase()));
    }
}
