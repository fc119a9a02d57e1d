// src/security/cipher.rs — API key encryption at rest
//
// AES-256-GCM with a key derived as SHA-256(deployment secret). Each value
// gets a fresh 96-bit nonce; the stored form is base64(nonce || ciphertext).

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::infra::errors::ChatHubError;

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct KeyCipher {
    key: [u8; 32],
}

impl KeyCipher {
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, ChatHubError> {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.key));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce_bytes)
            .map_err(|e| ChatHubError::Crypto(format!("nonce generation failed: {}", e)))?;
        let nonce = GenericArray::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| ChatHubError::Crypto(format!("encryption failed: {}", e)))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(blob))
    }

    /// Fails on malformed input or when the value was sealed under another
    /// secret. Callers treat failure as "no key".
    pub fn decrypt(&self, encoded: &str) -> Result<String, ChatHubError> {
        let blob = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ChatHubError::Crypto(format!("invalid encoding: {}", e)))?;

        if blob.len() < NONCE_LEN {
            return Err(ChatHubError::Crypto("ciphertext too short".into()));
        }

        let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.key));
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);

        let plaintext = cipher
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|e| ChatHubError::Crypto(format!("decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| ChatHubError::Crypto(format!("decrypted key is not UTF-8: {}", e)))
    }
}

impl std::fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyCipher(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let c = KeyCipher::from_secret("s3cret");
        let sealed = c.encrypt("sk-abc123").unwrap();
        assert_ne!(sealed, "sk-abc123");
        assert_eq!(c.decrypt(&sealed).unwrap(), "sk-abc123");
    }

    #[test]
    fn test_fresh_nonce_per_value() {
        let c = KeyCipher::from_secret("s3cret");
        let a = c.encrypt("same").unwrap();
        let b = c.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_secret_fails() {
        let sealed = KeyCipher::from_secret("one").encrypt("sk-x").unwrap();
        let err = KeyCipher::from_secret("two").decrypt(&sealed).unwrap_err();
        assert!(matches!(err, ChatHubError::Crypto(_)));
    }

    #[test]
    fn test_garbage_input_fails() {
        let c = KeyCipher::from_secret("s");
        assert!(c.decrypt("not base64 !!").is_err());
        assert!(c.decrypt("AAAA").is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let c = KeyCipher::from_secret("s");
        assert_eq!(format!("{:?}", c), "KeyCipher(..)");
    }
}
