//! Durable storage for connection configs (secrets already stripped).

use crate::files;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_query::{ConnectionConfig, DataError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

/// Store key under which the connection list lives
pub const CONNECTIONS_KEY: &str = "connections";

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Value stored under `key`, or `default` when nothing was stored yet
    async fn get(&self, key: &str, default: Vec<ConnectionConfig>) -> Result<Vec<ConnectionConfig>>;

    async fn update(&self, key: &str, value: Vec<ConnectionConfig>) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<ConnectionConfig>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get(&self, key: &str, default: Vec<ConnectionConfig>) -> Result<Vec<ConnectionConfig>> {
        Ok(self.entries.read().await.get(key).cloned().unwrap_or(default))
    }

    async fn update(&self, key: &str, value: Vec<ConnectionConfig>) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEntry {
    updated_at: DateTime<Utc>,
    value: Vec<ConnectionConfig>,
}

/// `connections.json` in the data directory
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<HashMap<String, StoredEntry>> {
        files::read_json(&self.path)
            .await
            .map(Option::unwrap_or_default)
            .map_err(|e| {
                DataError::Storage(format!("failed to read {}: {}", self.path.display(), e))
            })
    }
}

#[async_trait]
impl ConfigStore for JsonFileStore {
    async fn get(&self, key: &str, default: Vec<ConnectionConfig>) -> Result<Vec<ConnectionConfig>> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load()
            .await?
            .remove(key)
            .map(|entry| entry.value)
            .unwrap_or(default))
    }

    async fn update(&self, key: &str, value: Vec<ConnectionConfig>) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut document = self.load().await?;
        document.insert(
            key.to_string(),
            StoredEntry {
                updated_at: Utc::now(),
                value,
            },
        );

        files::write_json(&self.path, &document).await.map_err(|e| {
            DataError::Storage(format!("failed to write {}: {}", self.path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_query::DatabaseType;

    fn sample() -> ConnectionConfig {
        ConnectionConfig::new("local", DatabaseType::Sqlite)
            .with_id("c1")
            .with_filename("/tmp/app.db")
    }

    #[tokio::test]
    async fn test_memory_store_default() {
        let store = MemoryStore::new();
        assert!(store.get(CONNECTIONS_KEY, vec![]).await.unwrap().is_empty());
        store.update(CONNECTIONS_KEY, vec![sample()]).await.unwrap();
        assert_eq!(store.get(CONNECTIONS_KEY, vec![]).await.unwrap(), vec![sample()]);
    }

    #[tokio::test]
    async fn test_json_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("connections.json");

        let store = JsonFileStore::new(&path);
        assert!(store.get(CONNECTIONS_KEY, vec![]).await.unwrap().is_empty());
        store.update(CONNECTIONS_KEY, vec![sample()]).await.unwrap();
        store.update("other", vec![]).await.unwrap();

        let reopened = JsonFileStore::new(&path);
        assert_eq!(
            reopened.get(CONNECTIONS_KEY, vec![]).await.unwrap(),
            vec![sample()]
        );

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["connections"]["updatedAt"].is_string());
        assert_eq!(raw["connections"]["value"][0]["type"], "sqlite");
    }

    #[tokio::test]
    async fn test_json_store_reports_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.json");
        std::fs::write(&path, "{ broken").unwrap();

        let err = JsonFileStore::new(&path)
            .get(CONNECTIONS_KEY, vec![])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STORAGE_ERROR");
    }
}
