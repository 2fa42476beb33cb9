use crate::config::{ConnectionConfig, DatabaseType};
use crate::error::{DataError, Result};
use crate::traits::DatabaseAdapter;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Builds adapters for one backend type.
///
/// Building must not touch the network; sessions are opened by
/// [`DatabaseAdapter::connect`].
pub trait AdapterBuilder: Send + Sync {
    /// Backend type this builder handles
    fn database_type(&self) -> DatabaseType;

    /// Construct an unconnected adapter for `config`
    fn build(&self, config: ConnectionConfig) -> Result<Arc<dyn DatabaseAdapter>>;
}

/// Registry mapping each connection id to at most one adapter instance
pub struct AdapterFactory {
    builders: Arc<RwLock<HashMap<DatabaseType, Arc<dyn AdapterBuilder>>>>,
    adapters: Arc<RwLock<HashMap<String, Arc<dyn DatabaseAdapter>>>>,
}

impl AdapterFactory {
    pub fn new() -> Self {
        Self {
            builders: Arc::new(RwLock::new(HashMap::new())),
            adapters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a builder for a backend type
    pub async fn register_builder(&self, builder: Arc<dyn AdapterBuilder>) {
        let db_type = builder.database_type();
        let mut builders = self.builders.write().await;

        if builders.contains_key(&db_type) {
            warn!("Overwriting existing adapter builder for backend: {}", db_type);
        }

        builders.insert(db_type, builder);
        debug!("Registered adapter builder for backend: {}", db_type);
    }

    /// Check if a backend is registered
    pub async fn supports(&self, db_type: DatabaseType) -> bool {
        self.builders.read().await.contains_key(&db_type)
    }

    /// List registered backend types
    pub async fn backends(&self) -> Vec<DatabaseType> {
        self.builders.read().await.keys().copied().collect()
    }

    /// Return the adapter for `config.id`, building it if absent.
    ///
    /// Lookup and insertion happen under one write lock so concurrent callers
    /// for the same id always receive the same instance.
    pub async fn create(&self, config: ConnectionConfig) -> Result<Arc<dyn DatabaseAdapter>> {
        if config.id.is_empty() {
            return Err(DataError::invalid_configuration(
                "cannot create an adapter for a connection without an id",
            ));
        }

        if let Some(existing) = self.adapters.read().await.get(&config.id) {
            return Ok(existing.clone());
        }

        let builder = self
            .builders
            .read()
            .await
            .get(&config.db_type)
            .cloned()
            .ok_or_else(|| {
                DataError::invalid_configuration(format!(
                    "no adapter registered for backend: {}",
                    config.db_type
                ))
            })?;

        let mut adapters = self.adapters.write().await;
        if let Some(existing) = adapters.get(&config.id) {
            return Ok(existing.clone());
        }

        debug!(
            "Creating {} adapter for connection {}",
            config.db_type, config.id
        );
        let id = config.id.clone();
        let adapter = builder.build(config)?;
        adapters.insert(id, adapter.clone());

        Ok(adapter)
    }

    /// Pure lookup, never creates
    pub async fn get(&self, id: &str) -> Option<Arc<dyn DatabaseAdapter>> {
        self.adapters.read().await.get(id).cloned()
    }

    /// Drop the mapping. Callers disconnect first.
    pub async fn remove(&self, id: &str) -> Option<Arc<dyn DatabaseAdapter>> {
        let removed = self.adapters.write().await.remove(id);
        if removed.is_some() {
            debug!("Removed adapter for connection {}", id);
        }
        removed
    }

    /// Ids with a live adapter instance
    pub async fn ids(&self) -> Vec<String> {
        self.adapters.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.adapters.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.adapters.read().await.is_empty()
    }

    /// Disconnect every instance; individual failures are logged and skipped
    pub async fn disconnect_all(&self) {
        let adapters: Vec<Arc<dyn DatabaseAdapter>> =
            self.adapters.read().await.values().cloned().collect();

        let results = futures::future::join_all(adapters.iter().map(|adapter| async move {
            if adapter.is_connected() {
                adapter.disconnect().await.map_err(|e| (adapter.connection_id().to_string(), e))
            } else {
                Ok(())
            }
        }))
        .await;

        for result in results {
            if let Err((id, e)) = result {
                warn!("Failed to disconnect connection {}: {}", id, e);
            }
        }
    }
}

impl Default for AdapterFactory {
    fn default() -> Self {
        Self::new()
    }
}
