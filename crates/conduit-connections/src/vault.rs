//! Secret vault: opaque string values addressed by key.

use crate::encryption::EncryptionService;
use crate::files;
use async_trait::async_trait;
use conduit_query::{DataError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Vault key holding the secrets of one connection
pub fn secret_key(connection_id: &str) -> String {
    format!("password.{}", connection_id)
}

#[async_trait]
pub trait SecretVault: Send + Sync {
    async fn store(&self, key: &str, value: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Deleting a missing key succeeds
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Process-local vault, used in tests and for throwaway sessions
#[derive(Default)]
pub struct MemoryVault {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretVault for MemoryVault {
    async fn store(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// JSON file of `key -> AES-GCM sealed value`.
///
/// The whole document is rewritten on every mutation; vaults hold a handful
/// of entries per connection.
pub struct EncryptedFileVault {
    path: PathBuf,
    encryption: EncryptionService,
    entries: Mutex<HashMap<String, String>>,
}

impl EncryptedFileVault {
    pub async fn open(path: impl AsRef<Path>, encryption: EncryptionService) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries: HashMap<String, String> = files::read_json(&path)
            .await
            .map_err(|e| {
                DataError::SecretStore(format!(
                    "failed to read vault {}: {}",
                    path.display(),
                    e
                ))
            })?
            .unwrap_or_default();

        debug!("Opened secret vault {} ({} entries)", path.display(), entries.len());
        Ok(Self {
            path,
            encryption,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, entries: &HashMap<String, String>) -> Result<()> {
        files::write_json(&self.path, entries).await.map_err(|e| {
            DataError::SecretStore(format!(
                "failed to write vault {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

#[async_trait]
impl SecretVault for EncryptedFileVault {
    async fn store(&self, key: &str, value: &str) -> Result<()> {
        let sealed = self.encryption.encrypt_string(value)?;
        let mut entries = self.entries.lock().await;
        let previous = entries.insert(key.to_string(), sealed);

        if let Err(e) = self.flush(&entries).await {
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let sealed = self.entries.lock().await.get(key).cloned();
        sealed
            .map(|value| {
                self.encryption.decrypt_string(&value).map_err(|e| {
                    DataError::SecretStore(format!("failed to unseal '{}': {}", key, e))
                })
            })
            .transpose()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(old) = entries.remove(key) {
            if let Err(e) = self.flush(&entries).await {
                entries.insert(key.to_string(), old);
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> EncryptionService {
        EncryptionService::new(&EncryptionService::generate_key()).unwrap()
    }

    #[test]
    fn test_secret_key_format() {
        assert_eq!(secret_key("abc"), "password.abc");
    }

    #[tokio::test]
    async fn test_memory_vault() {
        let vault = MemoryVault::new();
        vault.store("k", "v").await.unwrap();
        assert_eq!(vault.get("k").await.unwrap().as_deref(), Some("v"));
        vault.delete("k").await.unwrap();
        vault.delete("k").await.unwrap();
        assert!(vault.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_vault_seals_values_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        let encryption = service();

        let vault = EncryptedFileVault::open(&path, encryption.clone()).await.unwrap();
        vault.store("password.c1", "hunter2").await.unwrap();

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(on_disk.contains("password.c1"));
        assert!(!on_disk.contains("hunter2"));

        let reopened = EncryptedFileVault::open(&path, encryption).await.unwrap();
        assert_eq!(
            reopened.get("password.c1").await.unwrap().as_deref(),
            Some("hunter2")
        );

        reopened.delete("password.c1").await.unwrap();
        assert!(reopened.get("password.c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_vault_with_wrong_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");

        let vault = EncryptedFileVault::open(&path, service()).await.unwrap();
        vault.store("k", "v").await.unwrap();

        let other = EncryptedFileVault::open(&path, service()).await.unwrap();
        let err = other.get("k").await.unwrap_err();
        assert_eq!(err.code(), "SECRET_STORE_ERROR");
    }

    #[tokio::test]
    async fn test_file_vault_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        std::fs::write(&path, "not json").unwrap();

        let result = EncryptedFileVault::open(&path, service()).await;
        assert!(matches!(result, Err(DataError::SecretStore(_))));
    }
}
