use conduit_connections::*;
use conduit_query::{AdapterFactory, ConnectionConfig, DatabaseType};
use conduit_query_sqlite::SqliteBuilder;
use conduit_tunnel::TunnelManager;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    service: Arc<ConnectionService>,
    vault: Arc<MemoryVault>,
    dir: TempDir,
}

async fn harness() -> Harness {
    let factory = Arc::new(AdapterFactory::new());
    factory.register_builder(Arc::new(SqliteBuilder)).await;
    let vault = Arc::new(MemoryVault::new());
    let service = ConnectionService::new(
        Arc::new(MemoryStore::new()),
        vault.clone(),
        factory,
        TunnelManager::new(),
    );
    Harness {
        service: Arc::new(service),
        vault,
        dir: tempfile::tempdir().unwrap(),
    }
}

fn sqlite_config(dir: &TempDir, name: &str) -> ConnectionConfig {
    let path = dir.path().join(format!("{}.db", name));
    ConnectionConfig::new(name, DatabaseType::Sqlite).with_filename(path.to_string_lossy())
}

/// Postgres behind an SSH gateway that refuses connections
fn tunneled_config() -> ConnectionConfig {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut config = ConnectionConfig::new("prod", DatabaseType::Postgres)
        .with_host("db.internal")
        .with_username("app")
        .with_password("db-secret")
        .with_database("app")
        .with_ssh("127.0.0.1", port, "deploy");
    config.ssh_password = Some("ssh-secret".to_string());
    config
}

#[tokio::test]
async fn test_add_returns_config_without_secrets() {
    let h = harness().await;
    let added = h
        .service
        .add_connection(tunneled_config())
        .await
        .unwrap();

    assert!(!added.id.is_empty());
    assert!(added.password.is_none());
    assert!(added.ssh_password.is_none());

    let listed = h.service.list_connections().await;
    assert_eq!(listed, vec![added.clone()]);
    assert_eq!(h.service.get_connection(&added.id).await.unwrap(), added);

    let stored = h.vault.get(&secret_key(&added.id)).await.unwrap().unwrap();
    assert!(stored.contains("db-secret"));
    assert!(stored.contains("ssh-secret"));
}

#[tokio::test]
async fn test_add_rejects_invalid_and_duplicate_configs() {
    let h = harness().await;

    let err = h
        .service
        .add_connection(ConnectionConfig::new("no-file", DatabaseType::Sqlite))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFIG_ERROR");

    let config = sqlite_config(&h.dir, "dup").with_id("fixed");
    h.service.add_connection(config.clone()).await.unwrap();
    let err = h.service.add_connection(config).await.unwrap_err();
    assert_eq!(err.code(), "CONFIG_ERROR");
    assert_eq!(h.service.list_connections().await.len(), 1);
}

#[tokio::test]
async fn test_connect_is_idempotent_and_disconnect_cascades() {
    let h = harness().await;
    let mut events = h.service.subscribe();
    let id = h
        .service
        .add_connection(sqlite_config(&h.dir, "local"))
        .await
        .unwrap()
        .id;

    h.service.connect(&id).await.unwrap();
    h.service.connect(&id).await.unwrap();
    assert_eq!(h.service.factory().len().await, 1);
    assert!(h.service.is_connected(&id).await);
    assert_eq!(h.service.connected_ids().await, vec![id.clone()]);

    h.service.disconnect(&id).await.unwrap();
    h.service.disconnect(&id).await.unwrap();
    assert!(h.service.factory().is_empty().await);
    assert!(!h.service.is_connected(&id).await);

    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Added(id.clone()));
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected(id.clone()));
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Disconnected(id));
}

#[tokio::test]
async fn test_concurrent_connects_share_one_adapter() {
    let h = harness().await;
    let id = h
        .service
        .add_connection(sqlite_config(&h.dir, "shared"))
        .await
        .unwrap()
        .id;

    let (a, b) = tokio::join!(h.service.connect(&id), h.service.connect(&id));
    a.unwrap();
    b.unwrap();
    assert_eq!(h.service.factory().len().await, 1);
}

#[tokio::test]
async fn test_failed_tunnel_unwinds_connect() {
    let h = harness().await;
    let id = h
        .service
        .add_connection(tunneled_config())
        .await
        .unwrap()
        .id;

    let err = h.service.connect(&id).await.unwrap_err();
    assert_eq!(err.code(), "TUNNEL_ERROR");
    assert!(h.service.factory().is_empty().await);
    assert!(h.service.tunnels().is_empty().await);
    assert!(!h.service.is_connected(&id).await);
}

#[tokio::test]
async fn test_test_connection_leaves_no_residue() {
    let h = harness().await;

    let ok = h
        .service
        .test_connection(&sqlite_config(&h.dir, "probe"))
        .await
        .unwrap();
    assert!(ok);
    assert!(h.service.factory().is_empty().await);

    let err = h
        .service
        .test_connection(&tunneled_config())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TUNNEL_ERROR");
    assert!(h.service.factory().is_empty().await);
    assert!(h.service.tunnels().is_empty().await);
    assert!(h.service.list_connections().await.is_empty());
}

#[tokio::test]
async fn test_update_keeps_omitted_secrets_and_disconnects() {
    let h = harness().await;
    let added = h
        .service
        .add_connection(sqlite_config(&h.dir, "local").with_password("keep-me"))
        .await
        .unwrap();
    h.service.connect(&added.id).await.unwrap();

    let mut changed = added.clone();
    changed.name = "renamed".to_string();
    let updated = h.service.update_connection(changed).await.unwrap();
    assert_eq!(updated.name, "renamed");
    assert!(h.service.factory().is_empty().await);

    let stored = h.vault.get(&secret_key(&added.id)).await.unwrap().unwrap();
    assert!(stored.contains("keep-me"));

    let missing = sqlite_config(&h.dir, "ghost").with_id("nope");
    let err = h.service.update_connection(missing).await.unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn test_remove_cascades() {
    let h = harness().await;
    let id = h
        .service
        .add_connection(sqlite_config(&h.dir, "gone").with_password("pw"))
        .await
        .unwrap()
        .id;
    h.service.connect(&id).await.unwrap();

    h.service.remove_connection(&id).await.unwrap();
    assert!(h.service.list_connections().await.is_empty());
    assert!(h.service.factory().is_empty().await);
    assert!(h.vault.get(&secret_key(&id)).await.unwrap().is_none());

    let err = h.service.remove_connection(&id).await.unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn test_adapter_lookup_errors() {
    let h = harness().await;
    let id = h
        .service
        .add_connection(sqlite_config(&h.dir, "idle"))
        .await
        .unwrap()
        .id;

    let err = h.service.adapter(&id).await.err().unwrap();
    assert_eq!(err.code(), "NOT_CONNECTED");
    let err = h.service.adapter("unknown").await.err().unwrap();
    assert_eq!(err.code(), "NOT_FOUND");

    h.service.connect(&id).await.unwrap();
    let capabilities = h.service.capabilities(&id).await.unwrap();
    assert!(capabilities.supports_transactions);
    assert!(!capabilities.supports_stored_procedures);
}

#[tokio::test]
async fn test_schema_cache_until_invalidated() {
    let h = harness().await;
    let id = h
        .service
        .add_connection(sqlite_config(&h.dir, "schema"))
        .await
        .unwrap()
        .id;
    h.service.connect(&id).await.unwrap();
    let adapter = h.service.adapter(&id).await.unwrap();

    adapter
        .execute_query("CREATE TABLE a (id INTEGER PRIMARY KEY)", None)
        .await
        .unwrap();
    assert_eq!(h.service.tables(&id).await.unwrap().len(), 1);

    adapter
        .execute_query("CREATE TABLE b (id INTEGER PRIMARY KEY)", None)
        .await
        .unwrap();
    assert_eq!(h.service.tables(&id).await.unwrap().len(), 1);

    h.service.invalidate_schema(&id).await;
    assert_eq!(h.service.tables(&id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_connection_set_changes_refresh_cached_listings() {
    let h = harness().await;
    let id = h
        .service
        .add_connection(sqlite_config(&h.dir, "main"))
        .await
        .unwrap()
        .id;
    h.service.connect(&id).await.unwrap();
    let adapter = h.service.adapter(&id).await.unwrap();

    let create = |table: &str| format!("CREATE TABLE {} (id INTEGER PRIMARY KEY)", table);
    adapter.execute_query(&create("a"), None).await.unwrap();
    assert_eq!(h.service.tables(&id).await.unwrap().len(), 1);

    // Served from cache until the connection set changes
    adapter.execute_query(&create("b"), None).await.unwrap();
    assert_eq!(h.service.tables(&id).await.unwrap().len(), 1);

    let other = h
        .service
        .add_connection(sqlite_config(&h.dir, "other"))
        .await
        .unwrap();
    assert_eq!(h.service.tables(&id).await.unwrap().len(), 2);

    adapter.execute_query(&create("c"), None).await.unwrap();
    h.service.update_connection(other.clone()).await.unwrap();
    assert_eq!(h.service.tables(&id).await.unwrap().len(), 3);

    adapter.execute_query(&create("d"), None).await.unwrap();
    h.service.remove_connection(&other.id).await.unwrap();
    let names: Vec<String> = h
        .service
        .tables(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn test_schema_cache_expires() {
    let factory = Arc::new(AdapterFactory::new());
    factory.register_builder(Arc::new(SqliteBuilder)).await;
    let service = ConnectionService::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryVault::new()),
        factory,
        TunnelManager::new(),
    )
    .with_schema_ttl(Duration::from_millis(50));
    let dir = tempfile::tempdir().unwrap();

    let id = service
        .add_connection(sqlite_config(&dir, "ttl"))
        .await
        .unwrap()
        .id;
    service.connect(&id).await.unwrap();
    assert!(service.tables(&id).await.unwrap().is_empty());

    service
        .adapter(&id)
        .await
        .unwrap()
        .execute_query("CREATE TABLE t (x)", None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(service.tables(&id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_persisted_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let key = EncryptionService::generate_key();
    let store_path = dir.path().join("connections.json");
    let vault_path = dir.path().join("secrets.json");

    let build = |vault: EncryptedFileVault| {
        ConnectionService::new(
            Arc::new(JsonFileStore::new(&store_path)),
            Arc::new(vault),
            Arc::new(AdapterFactory::new()),
            TunnelManager::new(),
        )
    };

    let first = build(
        EncryptedFileVault::open(&vault_path, EncryptionService::new(&key).unwrap())
            .await
            .unwrap(),
    );
    let added = first.add_connection(tunneled_config()).await.unwrap();

    let on_disk = std::fs::read_to_string(&store_path).unwrap();
    assert!(!on_disk.contains("db-secret"));
    assert!(!std::fs::read_to_string(&vault_path).unwrap().contains("db-secret"));

    let second = build(
        EncryptedFileVault::open(&vault_path, EncryptionService::new(&key).unwrap())
            .await
            .unwrap(),
    );
    assert_eq!(second.load().await.unwrap(), 1);
    assert_eq!(second.list_connections().await, vec![added]);
}

#[tokio::test]
async fn test_shutdown_disconnects_everything() {
    let h = harness().await;
    for name in ["one", "two"] {
        let id = h
            .service
            .add_connection(sqlite_config(&h.dir, name))
            .await
            .unwrap()
            .id;
        h.service.connect(&id).await.unwrap();
    }
    assert_eq!(h.service.factory().len().await, 2);

    h.service.shutdown().await;
    assert!(h.service.factory().is_empty().await);
    assert!(h.service.connected_ids().await.is_empty());
}
