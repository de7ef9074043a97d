//! AEAD encryption for tunnel request and response bodies
//!
//! Sealed layout: `nonce (12) || ciphertext || tag (16)`. Every message
//! carries a fresh random nonce, so one key serves both directions.

use super::{generate_nonce, CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, CHACHA20_POLY1305};
use std::fmt;
use std::str::FromStr;

/// Supported body ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptMethod {
    #[default]
    ChaCha20Poly1305,
    Aes256Gcm,
}

impl FromStr for EncryptMethod {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chacha20-poly1305" | "chacha20" => Ok(Self::ChaCha20Poly1305),
            "aes-256-gcm" | "aes256gcm" => Ok(Self::Aes256Gcm),
            other => Err(CryptoError::UnsupportedMethod(other.to_string())),
        }
    }
}

impl fmt::Display for EncryptMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChaCha20Poly1305 => f.write_str("chacha20-poly1305"),
            Self::Aes256Gcm => f.write_str("aes-256-gcm"),
        }
    }
}

/// AEAD cipher for sealing/opening whole bodies
pub struct Cipher {
    key: LessSafeKey,
    method: EncryptMethod,
}

impl Cipher {
    /// Create a new cipher from a 32-byte key
    pub fn new(method: EncryptMethod, key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let algorithm = match method {
            EncryptMethod::ChaCha20Poly1305 => &CHACHA20_POLY1305,
            EncryptMethod::Aes256Gcm => &AES_256_GCM,
        };
        let unbound_key =
            UnboundKey::new(algorithm, key).map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
            method,
        })
    }

    pub fn method(&self) -> EncryptMethod {
        self.method
    }

    /// Encrypt `plaintext`, returning nonce-prefixed ciphertext with tag
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = generate_nonce()?;

        let mut buffer = Vec::with_capacity(NONCE_LEN + plaintext.len() + TAG_LEN);
        buffer.extend_from_slice(&nonce);
        buffer.extend_from_slice(plaintext);

        let tag = self
            .key
            .seal_in_place_separate_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                &mut buffer[NONCE_LEN..],
            )
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;
        buffer.extend_from_slice(tag.as_ref());

        Ok(buffer)
    }

    /// Verify and decrypt a buffer produced by [`Cipher::seal`]
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Decryption("message too short".to_string()));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&sealed[..NONCE_LEN]);
        let mut buffer = sealed[NONCE_LEN..].to_vec();

        let plaintext_len = self
            .key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut buffer)
            .map_err(|_| CryptoError::Decryption("open failed".to_string()))?
            .len();
        buffer.truncate(plaintext_len);

        Ok(buffer)
    }
}
