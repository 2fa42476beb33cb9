use conduit_query::{
    AdapterFactory, ConnectionConfig, DataRow, DatabaseAdapter, DatabaseCapabilities,
    DatabaseType,
};
use conduit_query_sqlite::{SqliteAdapter, SqliteBuilder};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn adapter_at(id: &str, path: &Path) -> SqliteAdapter {
    let config = ConnectionConfig::new("local", DatabaseType::Sqlite)
        .with_id(id)
        .with_filename(path.to_string_lossy());
    SqliteAdapter::new(&config).unwrap()
}

async fn seeded(dir: &TempDir) -> SqliteAdapter {
    let adapter = adapter_at("c1", &dir.path().join("app.db"));
    adapter.connect().await.unwrap();
    adapter
        .execute_query("CREATE TABLE t (id INTEGER PRIMARY KEY, a INTEGER, label TEXT)", None)
        .await
        .unwrap();
    adapter
}

#[tokio::test]
async fn test_connect_to_missing_file_starts_empty() {
    let dir = TempDir::new().unwrap();
    let adapter = adapter_at("c1", &dir.path().join("fresh.db"));

    assert!(adapter.test_connection().await);
    assert!(!dir.path().join("fresh.db").exists());

    adapter.connect().await.unwrap();
    assert!(adapter.is_connected());
    assert!(adapter.get_tables().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_insert_then_select() {
    let dir = TempDir::new().unwrap();
    let adapter = seeded(&dir).await;

    let inserted = adapter
        .execute_query("INSERT INTO t (a) VALUES (?)", Some(vec![json!(1)]))
        .await
        .unwrap();
    assert_eq!(inserted.affected_rows, Some(1));

    let selected = adapter.execute_query("SELECT a FROM t", None).await.unwrap();
    assert!(selected.error.is_none());
    assert_eq!(selected.row_count, 1);
    assert_eq!(selected.rows[0]["a"], json!(1));
}

#[tokio::test]
async fn test_explain_full_scan() {
    let dir = TempDir::new().unwrap();
    let adapter = seeded(&dir).await;

    let explain = adapter.explain_query("SELECT * FROM t").await.unwrap();
    assert_eq!(explain.plan.len(), 1);
    assert_eq!(explain.plan[0].node_type, "Seq Scan");
    assert_eq!(explain.plan[0].relation_name.as_deref(), Some("t"));
    assert!(explain.raw.contains("SCAN"));
}

#[tokio::test]
async fn test_writes_survive_reconnect() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("app.db");
    let adapter = seeded(&dir).await;
    adapter
        .execute_query("INSERT INTO t (a, label) VALUES (7, 'seven')", None)
        .await
        .unwrap();

    // Flushed on write, before any disconnect
    let reader = adapter_at("c2", &path);
    reader.connect().await.unwrap();
    let rows = reader.execute_query("SELECT label FROM t", None).await.unwrap();
    assert_eq!(rows.rows[0]["label"], json!("seven"));

    adapter.disconnect().await.unwrap();
    adapter.disconnect().await.unwrap();
    assert!(!adapter.is_connected());

    adapter.connect().await.unwrap();
    let count = adapter.execute_query("SELECT COUNT(*) AS n FROM t", None).await.unwrap();
    assert_eq!(count.rows[0]["n"], json!(1));
}

#[tokio::test]
async fn test_transaction_defers_persistence_until_commit() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("app.db");
    let adapter = seeded(&dir).await;

    adapter.begin_transaction().await.unwrap();
    adapter
        .execute_query("INSERT INTO t (a) VALUES (1)", None)
        .await
        .unwrap();

    let before = adapter_at("before", &path);
    before.connect().await.unwrap();
    let rows = before.execute_query("SELECT * FROM t", None).await.unwrap();
    assert_eq!(rows.row_count, 0);

    adapter.commit().await.unwrap();

    let after = adapter_at("after", &path);
    after.connect().await.unwrap();
    let rows = after.execute_query("SELECT * FROM t", None).await.unwrap();
    assert_eq!(rows.row_count, 1);
}

#[tokio::test]
async fn test_rollback_discards_changes() {
    let dir = TempDir::new().unwrap();
    let adapter = seeded(&dir).await;

    adapter.begin_transaction().await.unwrap();
    adapter
        .execute_query("INSERT INTO t (a) VALUES (1)", None)
        .await
        .unwrap();
    adapter.rollback().await.unwrap();

    let rows = adapter.execute_query("SELECT * FROM t", None).await.unwrap();
    assert_eq!(rows.row_count, 0);
}

#[tokio::test]
async fn test_statement_errors_are_results_not_failures() {
    let dir = TempDir::new().unwrap();
    let adapter = seeded(&dir).await;

    let result = adapter
        .execute_query("INSERT INTO nope VALUES (1)", None)
        .await
        .unwrap();
    let error = result.error.expect("error expected");
    assert!(error.message.contains("nope"));
    assert_eq!(result.row_count, 0);
    assert!(result.rows.is_empty());
}

#[tokio::test]
async fn test_operations_require_connection() {
    let dir = TempDir::new().unwrap();
    let adapter = adapter_at("c1", &dir.path().join("app.db"));

    let err = adapter.execute_query("SELECT 1", None).await.unwrap_err();
    assert_eq!(err.code(), "NOT_CONNECTED");
    assert_eq!(adapter.get_tables().await.unwrap_err().code(), "NOT_CONNECTED");
    adapter.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_table_data_and_row_mutations() {
    let dir = TempDir::new().unwrap();
    let adapter = seeded(&dir).await;

    for (a, label) in [(1, "one"), (2, "two"), (3, "three")] {
        let mut values = DataRow::new();
        values.insert("a".to_string(), json!(a));
        values.insert("label".to_string(), json!(label));
        let result = adapter.insert_row("t", values).await.unwrap();
        assert_eq!(result.affected_rows, Some(1));
    }

    let page = adapter.get_table_data("t", 2, 1).await.unwrap();
    assert_eq!(page.rows.len(), 2);
    assert_eq!(page.total_rows, Some(3));
    assert_eq!(page.columns.len(), 3);

    let mut key = DataRow::new();
    key.insert("id".to_string(), json!(1));
    let mut values = DataRow::new();
    values.insert("label".to_string(), json!("uno"));
    let updated = adapter.update_row("t", key.clone(), values).await.unwrap();
    assert_eq!(updated.affected_rows, Some(1));

    let deleted = adapter.delete_row("t", key).await.unwrap();
    assert_eq!(deleted.affected_rows, Some(1));

    let rest = adapter.execute_query("SELECT label FROM t ORDER BY id", None).await.unwrap();
    assert_eq!(rest.rows[0]["label"], json!("two"));
}

#[tokio::test]
async fn test_introspection_and_capabilities() {
    let dir = TempDir::new().unwrap();
    let adapter = seeded(&dir).await;
    adapter
        .execute_query("CREATE VIEW labels AS SELECT label FROM t", None)
        .await
        .unwrap();

    let tables = adapter.get_tables().await.unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].row_count, Some(0));
    assert_eq!(adapter.get_primary_key("t").await.unwrap(), vec!["id"]);
    assert_eq!(adapter.get_views().await.unwrap()[0].name, "labels");
    assert!(adapter
        .get_view_definition("labels")
        .await
        .unwrap()
        .contains("SELECT label"));
    assert_eq!(adapter.get_columns("missing").await.unwrap_err().code(), "NOT_FOUND");
    assert!(adapter.get_version().await.unwrap().starts_with("SQLite 3."));

    let schema = adapter.get_schema().await.unwrap();
    assert_eq!(schema.databases[0].views.len(), 1);

    let caps = DatabaseCapabilities::negotiate(&adapter);
    assert!(caps.supports_explain);
    assert!(caps.supports_transactions);
    assert!(caps.supports_views);
    assert!(caps.supports_triggers);
    assert!(!caps.supports_stored_procedures);
    assert_eq!(adapter.get_users().await.unwrap_err().code(), "NOT_SUPPORTED");
}

#[tokio::test]
async fn test_factory_builds_sqlite_adapters() {
    let dir = TempDir::new().unwrap();
    let factory = AdapterFactory::new();
    factory.register_builder(Arc::new(SqliteBuilder)).await;

    let config = ConnectionConfig::new("local", DatabaseType::Sqlite)
        .with_id("c1")
        .with_filename(dir.path().join("f.db").to_string_lossy());
    let adapter = factory.create(config.clone()).await.unwrap();
    adapter.connect().await.unwrap();

    let again = factory.create(config).await.unwrap();
    assert!(again.is_connected());
    factory.disconnect_all().await;
    assert!(!adapter.is_connected());
}
