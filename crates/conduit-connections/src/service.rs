use crate::cache::SchemaCache;
use crate::events::ConnectionEvent;
use crate::store::{ConfigStore, CONNECTIONS_KEY};
use crate::vault::{secret_key, SecretVault};
use conduit_query::{
    AdapterFactory, ConnectionConfig, ConnectionSecrets, DataError, DatabaseAdapter,
    DatabaseCapabilities, Result, TableInfo,
};
use conduit_tunnel::{TunnelConfig, TunnelManager};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;
const TUNNEL_HOST: &str = "127.0.0.1";

/// Owns the durable connection list, its secrets and the live set, and
/// orchestrates tunnels and adapters on connect
pub struct ConnectionService {
    store: Arc<dyn ConfigStore>,
    vault: Arc<dyn SecretVault>,
    factory: Arc<AdapterFactory>,
    tunnels: TunnelManager,
    cache: SchemaCache,
    /// Redacted configs, in insertion order
    connections: RwLock<Vec<ConnectionConfig>>,
    live: RwLock<HashSet<String>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionService {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        vault: Arc<dyn SecretVault>,
        factory: Arc<AdapterFactory>,
        tunnels: TunnelManager,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            vault,
            factory,
            tunnels,
            cache: SchemaCache::default(),
            connections: RwLock::new(Vec::new()),
            live: RwLock::new(HashSet::new()),
            events,
        }
    }

    pub fn with_schema_ttl(mut self, ttl: Duration) -> Self {
        self.cache = SchemaCache::new(ttl);
        self
    }

    pub fn factory(&self) -> &Arc<AdapterFactory> {
        &self.factory
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: ConnectionEvent) {
        debug!("Connection event: {:?}", event);
        // Having no subscribers is not an error
        let _ = self.events.send(event);
    }

    /// Read the persisted connection list into memory
    pub async fn load(&self) -> Result<usize> {
        let stored = self.store.get(CONNECTIONS_KEY, Vec::new()).await?;
        let mut connections = Vec::with_capacity(stored.len());
        for config in stored {
            if !config.secrets().is_empty() {
                warn!(
                    "Stored config for connection {} carried secret fields; ignoring them",
                    config.id
                );
            }
            connections.push(config.redacted());
        }

        let count = connections.len();
        *self.connections.write().await = connections;
        self.cache.clear().await;
        info!("Loaded {} saved connection(s)", count);
        Ok(count)
    }

    /// Saved connections without their secrets
    pub async fn list_connections(&self) -> Vec<ConnectionConfig> {
        self.connections.read().await.clone()
    }

    pub async fn get_connection(&self, id: &str) -> Result<ConnectionConfig> {
        self.connections
            .read()
            .await
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| DataError::not_found(format!("connection {} does not exist", id)))
    }

    pub async fn add_connection(&self, mut config: ConnectionConfig) -> Result<ConnectionConfig> {
        config.validate()?;

        let mut connections = self.connections.write().await;
        if config.id.is_empty() {
            config.id = Uuid::new_v4().to_string();
        } else if connections.iter().any(|c| c.id == config.id) {
            return Err(DataError::invalid_configuration(format!(
                "connection id {} is already in use",
                config.id
            )));
        }

        self.store_secrets(&config.id, config.secrets()).await?;

        let redacted = config.redacted();
        let mut next = connections.clone();
        next.push(redacted.clone());
        if let Err(e) = self.store.update(CONNECTIONS_KEY, next.clone()).await {
            error!("Failed to persist new connection {}: {}", config.id, e);
            if let Err(cleanup) = self.vault.delete(&secret_key(&config.id)).await {
                warn!("Failed to drop secrets for {}: {}", config.id, cleanup);
            }
            return Err(e);
        }
        *connections = next;
        drop(connections);

        info!("Added connection {} ({})", redacted.id, redacted.display_string());
        self.cache.clear().await;
        self.notify(ConnectionEvent::Added(redacted.id.clone()));
        Ok(redacted)
    }

    /// Replace a saved connection. Secret fields left empty keep their stored
    /// values. A live connection is disconnected so the next connect picks up
    /// the new settings.
    pub async fn update_connection(&self, config: ConnectionConfig) -> Result<ConnectionConfig> {
        config.validate()?;

        let mut connections = self.connections.write().await;
        let position = connections
            .iter()
            .position(|c| c.id == config.id)
            .ok_or_else(|| {
                DataError::not_found(format!("connection {} does not exist", config.id))
            })?;

        let previous = self.load_secrets(&config.id).await?;
        self.store_secrets(&config.id, previous.clone().merge(config.secrets()))
            .await?;

        let redacted = config.redacted();
        let mut next = connections.clone();
        next[position] = redacted.clone();
        if let Err(e) = self.store.update(CONNECTIONS_KEY, next.clone()).await {
            error!("Failed to persist connection {}: {}", config.id, e);
            if let Err(cleanup) = self.store_secrets(&config.id, previous).await {
                warn!("Failed to restore secrets for {}: {}", config.id, cleanup);
            }
            return Err(e);
        }
        *connections = next;
        drop(connections);

        if self.factory.get(&config.id).await.is_some() {
            if let Err(e) = self.disconnect(&config.id).await {
                warn!(
                    "Failed to disconnect connection {} after update: {}",
                    config.id, e
                );
            }
        }

        info!("Updated connection {}", redacted.id);
        self.cache.clear().await;
        self.notify(ConnectionEvent::Updated(redacted.id.clone()));
        Ok(redacted)
    }

    pub async fn remove_connection(&self, id: &str) -> Result<()> {
        self.get_connection(id).await?;

        if let Err(e) = self.disconnect(id).await {
            warn!("Failed to disconnect connection {} before removal: {}", id, e);
        }
        self.vault.delete(&secret_key(id)).await?;

        let mut connections = self.connections.write().await;
        let next: Vec<ConnectionConfig> =
            connections.iter().filter(|c| c.id != id).cloned().collect();
        self.store.update(CONNECTIONS_KEY, next.clone()).await?;
        *connections = next;
        drop(connections);

        info!("Removed connection {}", id);
        self.cache.clear().await;
        self.notify(ConnectionEvent::Removed(id.to_string()));
        Ok(())
    }

    /// Bring a saved connection online. Calling it on a live connection is a
    /// no-op; on failure the tunnel and adapter created here are torn down.
    pub async fn connect(&self, id: &str) -> Result<()> {
        let config = self.resolve(id).await?;

        let existing = self.factory.get(id).await;
        if existing.as_ref().map_or(false, |adapter| adapter.is_connected()) {
            self.live.write().await.insert(id.to_string());
            debug!("Connection {} is already connected", id);
            return Ok(());
        }
        let had_tunnel = self.tunnels.get(id).await.is_some();

        let result = self.open(&config).await;
        if let Err(e) = result {
            error!("Failed to connect {} ({}): {}", id, config.name, e);
            if existing.is_none() {
                self.factory.remove(id).await;
            }
            if config.ssh_enabled() && !had_tunnel {
                self.tunnels.close_tunnel(id).await;
            }
            return Err(e);
        }

        self.live.write().await.insert(id.to_string());
        self.cache.invalidate(id).await;
        info!("Connected {} ({})", id, config.display_string());
        self.notify(ConnectionEvent::Connected(id.to_string()));
        Ok(())
    }

    async fn open(&self, config: &ConnectionConfig) -> Result<Arc<dyn DatabaseAdapter>> {
        let effective = self.route_through_tunnel(config).await?;
        let adapter = self.factory.create(effective).await?;
        if !adapter.is_connected() {
            adapter.connect().await?;
        }
        Ok(adapter)
    }

    /// Establish the tunnel when SSH is enabled and point the config at it
    async fn route_through_tunnel(&self, config: &ConnectionConfig) -> Result<ConnectionConfig> {
        if !config.ssh_enabled() {
            return Ok(config.clone());
        }

        let tunnel = TunnelConfig::from_connection(config)?;
        let local_port = self.tunnels.create_tunnel(tunnel).await?;

        let mut effective = config.clone();
        effective.host = Some(TUNNEL_HOST.to_string());
        effective.port = Some(local_port);
        Ok(effective)
    }

    /// Disconnect the adapter, drop it from the factory and close the tunnel.
    ///
    /// Cleanup always runs; the adapter's disconnect error, if any, is
    /// returned afterwards.
    pub async fn disconnect(&self, id: &str) -> Result<()> {
        let mut outcome = Ok(());
        if let Some(adapter) = self.factory.get(id).await {
            if adapter.is_connected() {
                outcome = adapter.disconnect().await;
                if let Err(e) = &outcome {
                    error!("Failed to disconnect {}: {}", id, e);
                }
            }
            self.factory.remove(id).await;
        }
        self.tunnels.close_tunnel(id).await;
        self.cache.invalidate(id).await;

        if self.live.write().await.remove(id) {
            info!("Disconnected {}", id);
            self.notify(ConnectionEvent::Disconnected(id.to_string()));
        }
        outcome
    }

    /// Probe a possibly unsaved config under a throwaway id.
    ///
    /// Secrets missing from `config` are filled from the vault when it names
    /// a saved connection. The adapter and tunnel are always removed again.
    pub async fn test_connection(&self, config: &ConnectionConfig) -> Result<bool> {
        config.validate()?;

        let stored = if config.id.is_empty() {
            ConnectionSecrets::default()
        } else {
            self.load_secrets(&config.id).await?
        };
        let mut probe = config.with_secrets(stored.merge(config.secrets()));
        probe.id = format!("test-{}", Uuid::new_v4());

        debug!("Testing {} as {}", config.display_string(), probe.id);
        let outcome = self.probe(&probe).await;

        self.factory.remove(&probe.id).await;
        self.tunnels.close_tunnel(&probe.id).await;
        outcome
    }

    async fn probe(&self, config: &ConnectionConfig) -> Result<bool> {
        let effective = self.route_through_tunnel(config).await?;
        let adapter = self.factory.create(effective).await?;
        Ok(adapter.test_connection().await)
    }

    /// Connected adapter for `id`
    pub async fn adapter(&self, id: &str) -> Result<Arc<dyn DatabaseAdapter>> {
        if let Some(adapter) = self.factory.get(id).await {
            if adapter.is_connected() {
                return Ok(adapter);
            }
        }
        let config = self.get_connection(id).await?;
        Err(DataError::not_connected(format!(
            "connection {} ({}) is not connected",
            id, config.name
        )))
    }

    pub async fn is_connected(&self, id: &str) -> bool {
        self.live.read().await.contains(id)
            && self
                .factory
                .get(id)
                .await
                .map_or(false, |adapter| adapter.is_connected())
    }

    pub async fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.live.read().await.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Table listing, served from the schema cache while fresh
    pub async fn tables(&self, id: &str) -> Result<Vec<TableInfo>> {
        if let Some(tables) = self.cache.get(id).await {
            debug!("Schema cache hit for {}", id);
            return Ok(tables);
        }

        let generation = self.cache.generation().await;
        let tables = self.adapter(id).await?.get_tables().await?;
        if !self.cache.put(id, tables.clone(), generation).await {
            debug!("Schema for {} changed while listing; not caching", id);
        }
        Ok(tables)
    }

    pub async fn invalidate_schema(&self, id: &str) {
        self.cache.invalidate(id).await;
    }

    pub async fn capabilities(&self, id: &str) -> Result<DatabaseCapabilities> {
        let adapter = self.adapter(id).await?;
        Ok(DatabaseCapabilities::negotiate(adapter.as_ref()))
    }

    /// Disconnect every adapter and close every tunnel
    pub async fn shutdown(&self) {
        info!("Shutting down connections");
        self.factory.disconnect_all().await;
        for id in self.factory.ids().await {
            self.factory.remove(&id).await;
        }
        self.tunnels.close_all().await;

        let ids: Vec<String> = self.live.write().await.drain().collect();
        for id in ids {
            self.notify(ConnectionEvent::Disconnected(id));
        }
    }

    async fn resolve(&self, id: &str) -> Result<ConnectionConfig> {
        let config = self.get_connection(id).await?;
        let secrets = self.load_secrets(id).await?;
        Ok(config.with_secrets(secrets))
    }

    async fn load_secrets(&self, id: &str) -> Result<ConnectionSecrets> {
        match self.vault.get(&secret_key(id)).await? {
            None => Ok(ConnectionSecrets::default()),
            Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                DataError::SecretStore(format!(
                    "connection {}: stored secrets are unreadable: {}",
                    id, e
                ))
            }),
        }
    }

    async fn store_secrets(&self, id: &str, secrets: ConnectionSecrets) -> Result<()> {
        let key = secret_key(id);
        if secrets.is_empty() {
            return self.vault.delete(&key).await;
        }
        let raw = serde_json::to_string(&secrets)?;
        self.vault.store(&key, &raw).await
    }
}
