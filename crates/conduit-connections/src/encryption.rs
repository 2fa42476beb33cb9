// Deprecation warnings from generic-array 0.14.x come from aes-gcm 0.10
#![allow(deprecated)]

use aes_gcm::{
    aead::{Aead, KeyInit},
    AeadCore, Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use conduit_query::{DataError, Result};
use rand::{rngs::OsRng, RngCore};
use std::sync::Arc;

const NONCE_LENGTH: usize = 12;

fn secret_error(msg: impl Into<String>) -> DataError {
    DataError::SecretStore(msg.into())
}

/// AES-256-GCM sealing for vault entries
#[derive(Debug, Clone)]
pub struct EncryptionService {
    master_key: Arc<[u8; 32]>,
}

impl EncryptionService {
    /// Accepts a raw 32-byte key or a 64-character hex key
    pub fn new(master_key: &str) -> Result<Self> {
        let key_bytes = match master_key.len() {
            32 => master_key.as_bytes().to_vec(),
            64 => hex::decode(master_key)
                .map_err(|e| secret_error(format!("invalid hex key: {}", e)))?,
            _ => {
                return Err(secret_error(
                    "master key must be exactly 32 bytes or 64 hex characters",
                ))
            }
        };

        let mut key = [0u8; 32];
        key.copy_from_slice(&key_bytes);

        Ok(Self {
            master_key: Arc::new(key),
        })
    }

    /// Returns base64 of `nonce || ciphertext`
    pub fn encrypt(&self, data: &[u8]) -> Result<String> {
        let cipher = Aes256Gcm::new(self.master_key.as_slice().into());
        let nonce = Aes256Gcm::generate_nonce(&mut aes_gcm::aead::OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, data)
            .map_err(|e| secret_error(format!("encryption failed: {}", e)))?;

        let mut combined = nonce.to_vec();
        combined.extend(ciphertext);
        Ok(BASE64.encode(combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>> {
        let data = BASE64
            .decode(encoded)
            .map_err(|e| secret_error(format!("base64 decode failed: {}", e)))?;

        if data.len() < NONCE_LENGTH {
            return Err(secret_error("encrypted value is truncated"));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LENGTH);
        let cipher = Aes256Gcm::new(self.master_key.as_slice().into());

        // The aead error carries no detail; a wrong key is the usual cause
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| secret_error("decryption failed (wrong key or corrupted value)"))
    }

    pub fn encrypt_string(&self, data: &str) -> Result<String> {
        self.encrypt(data.as_bytes())
    }

    pub fn decrypt_string(&self, encoded: &str) -> Result<String> {
        let decrypted = self.decrypt(encoded)?;
        String::from_utf8(decrypted).map_err(|e| secret_error(format!("UTF-8 decode failed: {}", e)))
    }

    /// Random 32-byte key as 64 hex characters, suitable for [`EncryptionService::new`]
    pub fn generate_key() -> String {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        hex::encode(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> EncryptionService {
        EncryptionService::new(&EncryptionService::generate_key()).unwrap()
    }

    #[test]
    fn test_new_accepts_raw_and_hex_keys() {
        assert!(EncryptionService::new("12345678901234567890123456789012").is_ok());
        assert!(EncryptionService::new(&EncryptionService::generate_key()).is_ok());
    }

    #[test]
    fn test_new_rejects_bad_keys() {
        let err = EncryptionService::new("short").unwrap_err();
        assert_eq!(err.code(), "SECRET_STORE_ERROR");

        let not_hex = "z".repeat(64);
        assert!(EncryptionService::new(&not_hex).is_err());
    }

    #[test]
    fn test_encrypt_decrypt_string() {
        let service = EncryptionService::new(&EncryptionService::generate_key()).unwrap();
        let sealed = service.encrypt_string(r#"{"password":"s3cret"}"#).unwrap();
        assert!(!sealed.contains("s3cret"));
        assert_eq!(
            service.decrypt_string(&sealed).unwrap(),
            r#"{"password":"s3cret"}"#
        );
    }

    #[test]
    fn test_nonce_is_random() {
        let service = service();
        let a = service.encrypt_string("same").unwrap();
        let b = service.encrypt_string("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = service().encrypt_string("value").unwrap();
        let err = service()
            .decrypt_string(&sealed)
            .unwrap_err();
        assert!(err.to_string().contains("decryption failed"));
    }

    #[test]
    fn test_truncated_input_rejected() {
        let service = service();
        assert!(service.decrypt(&BASE64.encode([0u8; 4])).is_err());
        assert!(service.decrypt("not base64!").is_err());
    }
}
