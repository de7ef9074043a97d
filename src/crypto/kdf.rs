//! Key Derivation Functions
//!
//! Provides HKDF-SHA256 for turning the configured password into a body key

use super::{CryptoError, KEY_LEN};
use ring::hkdf::{self, Salt, HKDF_SHA256};

const BLOCK_KEY_SALT: &[u8] = b"xtunnel block key v1";
const BLOCK_KEY_INFO: &[u8] = b"xtunnel request body";

/// HKDF-SHA256 key derivation
pub struct Hkdf {
    prk: hkdf::Prk,
}

impl Hkdf {
    /// Create HKDF from input keying material
    ///
    /// # Arguments
    /// * `salt` - Optional salt (if None, uses zeros)
    /// * `ikm` - Input keying material
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = match salt {
            Some(s) => Salt::new(HKDF_SHA256, s),
            None => Salt::new(HKDF_SHA256, &[0u8; 32]),
        };

        Self {
            prk: salt.extract(ikm),
        }
    }

    /// Fill `output` with key material bound to `info`
    pub fn expand(&self, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        let info_refs = [info];
        let okm = self
            .prk
            .expand(&info_refs, HkdfLen(output.len()))
            .map_err(|_| CryptoError::KeyDerivation("HKDF expand failed".to_string()))?;

        okm.fill(output)
            .map_err(|_| CryptoError::KeyDerivation("HKDF fill failed".to_string()))
    }

    /// Derive a 32-byte key
    pub fn expand_key(&self, info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let mut key = [0u8; KEY_LEN];
        self.expand(info, &mut key)?;
        Ok(key)
    }
}

/// Helper struct for HKDF output length
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Derive the body encryption key from `encrypt_password`
pub fn derive_block_key(password: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    if password.is_empty() {
        return Err(CryptoError::KeyDerivation("empty password".to_string()));
    }
    Hkdf::new(Some(BLOCK_KEY_SALT), password.as_bytes()).expand_key(BLOCK_KEY_INFO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_labels() {
        let hkdf = Hkdf::new(Some(b"salt"), b"input keying material");

        let key1 = hkdf.expand_key(b"label1").unwrap();
        let key2 = hkdf.expand_key(b"label2").unwrap();
        assert_ne!(key1, key2);
        assert_eq!(key1, hkdf.expand_key(b"label1").unwrap());
    }

    #[test]
    fn test_block_key_is_deterministic() {
        let a = derive_block_key("secret").unwrap();
        let b = derive_block_key("secret").unwrap();
        let c = derive_block_key("other").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(derive_block_key("").is_err());
    }
}
