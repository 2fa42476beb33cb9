//! # conduit-query-sqlite
//!
//! File-backed SQLite adapter.
//!
//! The whole database is loaded into an in-memory SQLite instance on
//! `connect` and written back to the file with the online backup API. Every
//! write outside an explicit transaction is flushed to the file immediately;
//! inside a transaction the flush is deferred to `commit`.
//!
//! rusqlite is synchronous, so every call runs on the blocking pool while
//! holding the single connection.

mod introspect;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use conduit_query::{
    classify_statement, AdapterBuilder, AdapterCapabilities, ColumnInfo, ConnectionConfig,
    DataError, DatabaseAdapter, DatabaseSchema, DatabaseType, ExplainResult, IndexInfo,
    QueryError, QueryResult, ResultColumn, Result, SchemaInfo, SqlDialect, StatementKind,
    TableInfo, TriggerInfo, ViewInfo,
};
use rusqlite::backup::Progress;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, DatabaseName, OpenFlags};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, error, warn};

/// Statement prefixes that take the read path
const READ_KEYWORDS: &[&str] = &["SELECT", "PRAGMA", "WITH", "EXPLAIN"];

type Slot = Arc<Mutex<Option<Connection>>>;

/// SQLite adapter backed by a single file
pub struct SqliteAdapter {
    id: String,
    path: PathBuf,
    slot: Slot,
    connected: AtomicBool,
}

impl SqliteAdapter {
    pub fn new(config: &ConnectionConfig) -> Result<Self> {
        let filename = config
            .filename
            .as_deref()
            .filter(|f| !f.trim().is_empty())
            .ok_or_else(|| DataError::invalid_configuration("SQLite connections require a filename"))?;

        Ok(Self {
            id: config.id.clone(),
            path: PathBuf::from(filename),
            slot: Arc::new(Mutex::new(None)),
            connected: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the live connection on the blocking pool
    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &Path) -> Result<T> + Send + 'static,
    {
        self.ensure_connected()?;
        let slot = self.slot.clone();
        let path = self.path.clone();
        let id = self.id.clone();

        tokio::task::spawn_blocking(move || {
            let guard = lock(&slot)?;
            let conn = guard.as_ref().ok_or_else(|| {
                DataError::not_connected(format!("SQLite connection '{}' is not connected", id))
            })?;
            f(conn, &path)
        })
        .await
        .map_err(|e| DataError::Internal(format!("SQLite worker failed: {}", e)))?
    }
}

fn lock(slot: &Slot) -> Result<MutexGuard<'_, Option<Connection>>> {
    slot.lock()
        .map_err(|_| DataError::Internal("SQLite connection lock poisoned".to_string()))
}

/// Copy the in-memory database to `path`
fn persist(conn: &Connection, path: &Path) -> rusqlite::Result<()> {
    conn.backup(DatabaseName::Main, path, None::<fn(Progress)>)
}

fn catalog_error(operation: &str, e: rusqlite::Error) -> DataError {
    error!("SQLite {} failed: {}", operation, e);
    DataError::QueryFailed(format!("{}: {}", operation, e))
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Map a SQLite cell to JSON; blobs become base64 strings
fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(BASE64.encode(b)),
    }
}

/// Outcome of running a single statement, before timing is attached
enum Outcome {
    Rows(Vec<ResultColumn>, Vec<conduit_query::DataRow>),
    Affected(u64),
}

fn run_statement(conn: &Connection, query: &str, params: &[SqlValue]) -> rusqlite::Result<Outcome> {
    let kind = classify_statement(query, READ_KEYWORDS);
    let mut stmt = conn.prepare(query)?;

    // RETURNING clauses produce rows from the write path too
    if kind == StatementKind::Write && stmt.column_count() == 0 {
        let affected = stmt.execute(params_from_iter(params.iter()))?;
        return Ok(Outcome::Affected(affected as u64));
    }

    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut cursor = stmt.query(params_from_iter(params.iter()))?;
    let mut rows = Vec::new();
    while let Some(row) = cursor.next()? {
        let mut data = conduit_query::DataRow::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            data.insert(name.clone(), to_json(row.get_ref(i)?));
        }
        rows.push(data);
    }

    Ok(Outcome::Rows(
        names.into_iter().map(ResultColumn::named).collect(),
        rows,
    ))
}

fn execute(conn: &Connection, path: &Path, query: &str, params: Vec<SqlValue>) -> QueryResult {
    let started = Instant::now();

    if query.trim().is_empty() {
        return QueryResult::failed(QueryError::new("QUERY_ERROR", "empty statement"), 0);
    }

    let outcome = match run_statement(conn, query, &params) {
        Ok(outcome) => outcome,
        Err(e) => {
            debug!("SQLite statement failed: {}", e);
            return QueryResult::failed(
                QueryError::new("QUERY_ERROR", e.to_string()),
                elapsed_ms(started),
            );
        }
    };

    let wrote = classify_statement(query, READ_KEYWORDS) == StatementKind::Write;
    if wrote && conn.is_autocommit() {
        if let Err(e) = persist(conn, path) {
            error!("Failed to persist {}: {}", path.display(), e);
            return QueryResult::failed(
                QueryError::new(
                    "STORAGE_ERROR",
                    format!("statement applied but not saved to {}: {}", path.display(), e),
                ),
                elapsed_ms(started),
            );
        }
    }

    match outcome {
        Outcome::Rows(columns, rows) => QueryResult::with_rows(columns, rows, elapsed_ms(started)),
        Outcome::Affected(affected) => QueryResult::with_affected(affected, elapsed_ms(started)),
    }
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }

    fn connection_id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            views: true,
            view_definitions: true,
            triggers: true,
            transactions: true,
            explain: true,
            ..Default::default()
        }
    }

    fn sql_dialect(&self) -> Option<SqlDialect> {
        Some(SqlDialect::SQLITE)
    }

    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let slot = self.slot.clone();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut guard = lock(&slot)?;
            if guard.is_some() {
                return Ok(());
            }

            let failed = |e: rusqlite::Error| {
                DataError::ConnectionFailed(format!("failed to open {}: {}", path.display(), e))
            };
            let mut conn = Connection::open_in_memory().map_err(failed)?;
            if path.exists() {
                conn.restore(DatabaseName::Main, &path, None::<fn(Progress)>)
                    .map_err(failed)?;
                debug!("Loaded SQLite database from {}", path.display());
            } else {
                persist(&conn, &path).map_err(failed)?;
                debug!("Created empty SQLite database at {}", path.display());
            }

            *guard = Some(conn);
            Ok(())
        })
        .await
        .map_err(|e| DataError::Internal(format!("SQLite worker failed: {}", e)))??;

        self.connected.store(true, Ordering::SeqCst);
        debug!("SQLite connection {} connected", self.id);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }

        let slot = self.slot.clone();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut guard = lock(&slot)?;
            if let Some(conn) = guard.as_ref() {
                if !conn.is_autocommit() {
                    warn!("Rolling back open transaction before closing {}", path.display());
                    conn.execute_batch("ROLLBACK")
                        .map_err(|e| catalog_error("rollback", e))?;
                }
                persist(conn, &path).map_err(|e| {
                    DataError::Storage(format!("failed to save {}: {}", path.display(), e))
                })?;
            }
            *guard = None;
            Ok(())
        })
        .await
        .map_err(|e| DataError::Internal(format!("SQLite worker failed: {}", e)))??;

        self.connected.store(false, Ordering::SeqCst);
        debug!("SQLite connection {} disconnected", self.id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn test_connection(&self) -> bool {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            if path.exists() {
                Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                    .and_then(|conn| {
                        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
                            row.get::<_, i64>(0)
                        })
                    })
                    .is_ok()
            } else {
                // A new file will be created on connect if its directory exists
                path.parent()
                    .map(|dir| dir.as_os_str().is_empty() || dir.is_dir())
                    .unwrap_or(false)
            }
        })
        .await
        .unwrap_or(false)
    }

    async fn execute_query(&self, query: &str, params: Option<Vec<Value>>) -> Result<QueryResult> {
        let query = query.to_string();
        let params: Vec<SqlValue> = params
            .unwrap_or_default()
            .iter()
            .map(to_sql_value)
            .collect();

        self.with_connection(move |conn, path| Ok(execute(conn, path, &query, params)))
            .await
    }

    async fn get_schema(&self) -> Result<SchemaInfo> {
        let (tables, views) = self
            .with_connection(|conn, _| {
                let mut tables = Vec::new();
                for name in introspect::table_names(conn).map_err(|e| catalog_error("getSchema", e))? {
                    tables.push(
                        introspect::table_info(conn, &name).map_err(|e| catalog_error("getSchema", e))?,
                    );
                }
                let views = introspect::views(conn).map_err(|e| catalog_error("getSchema", e))?;
                Ok((tables, views))
            })
            .await?;

        Ok(SchemaInfo {
            databases: vec![DatabaseSchema {
                name: "main".to_string(),
                tables,
                views,
            }],
        })
    }

    async fn get_tables(&self) -> Result<Vec<TableInfo>> {
        self.with_connection(|conn, _| {
            introspect::table_names(conn)
                .and_then(|names| {
                    names
                        .iter()
                        .map(|name| introspect::table_info(conn, name))
                        .collect()
                })
                .map_err(|e| catalog_error("getTables", e))
        })
        .await
    }

    async fn get_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let table = table.to_string();
        self.with_connection(move |conn, _| {
            let columns =
                introspect::columns(conn, &table).map_err(|e| catalog_error("getColumns", e))?;
            if columns.is_empty() {
                return Err(DataError::not_found(format!("table '{}' does not exist", table)));
            }
            Ok(columns)
        })
        .await
    }

    async fn get_indexes(&self, table: &str) -> Result<Vec<IndexInfo>> {
        let table = table.to_string();
        self.with_connection(move |conn, _| {
            introspect::indexes(conn, &table).map_err(|e| catalog_error("getIndexes", e))
        })
        .await
    }

    async fn get_primary_key(&self, table: &str) -> Result<Vec<String>> {
        let table = table.to_string();
        self.with_connection(move |conn, _| {
            introspect::primary_key(conn, &table).map_err(|e| catalog_error("getPrimaryKey", e))
        })
        .await
    }

    async fn get_version(&self) -> Result<String> {
        self.with_connection(|conn, _| {
            conn.query_row("SELECT sqlite_version()", [], |row| row.get::<_, String>(0))
                .map(|version| format!("SQLite {}", version))
                .map_err(|e| catalog_error("getVersion", e))
        })
        .await
    }

    async fn get_views(&self) -> Result<Vec<ViewInfo>> {
        self.with_connection(|conn, _| {
            introspect::views(conn).map_err(|e| catalog_error("getViews", e))
        })
        .await
    }

    async fn get_view_definition(&self, view: &str) -> Result<String> {
        let view = view.to_string();
        self.with_connection(move |conn, _| {
            introspect::view_definition(conn, &view)
                .map_err(|e| catalog_error("getViewDefinition", e))?
                .ok_or_else(|| DataError::not_found(format!("view '{}' does not exist", view)))
        })
        .await
    }

    async fn get_triggers(&self, table: Option<&str>) -> Result<Vec<TriggerInfo>> {
        let table = table.map(String::from);
        self.with_connection(move |conn, _| {
            introspect::triggers(conn, table.as_deref()).map_err(|e| catalog_error("getTriggers", e))
        })
        .await
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.with_connection(|conn, _| {
            conn.execute_batch("BEGIN")
                .map_err(|e| catalog_error("beginTransaction", e))
        })
        .await
    }

    async fn commit(&self) -> Result<()> {
        self.with_connection(|conn, path| {
            conn.execute_batch("COMMIT")
                .map_err(|e| catalog_error("commit", e))?;
            persist(conn, path).map_err(|e| {
                DataError::Storage(format!("failed to save {}: {}", path.display(), e))
            })
        })
        .await
    }

    async fn rollback(&self) -> Result<()> {
        self.with_connection(|conn, _| {
            conn.execute_batch("ROLLBACK")
                .map_err(|e| catalog_error("rollback", e))
        })
        .await
    }

    async fn explain_query(&self, query: &str) -> Result<ExplainResult> {
        let query = query.to_string();
        self.with_connection(move |conn, _| {
            introspect::explain(conn, &query).map_err(|e| catalog_error("explainQuery", e))
        })
        .await
    }
}

/// Builds [`SqliteAdapter`]s for the factory
pub struct SqliteBuilder;

impl AdapterBuilder for SqliteBuilder {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }

    fn build(&self, config: ConnectionConfig) -> Result<Arc<dyn DatabaseAdapter>> {
        Ok(Arc::new(SqliteAdapter::new(&config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_requires_filename() {
        let config = ConnectionConfig::new("x", DatabaseType::Sqlite).with_id("x");
        let err = SqliteAdapter::new(&config).err().unwrap();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_value_conversion() {
        assert_eq!(to_sql_value(&json!(true)), SqlValue::Integer(1));
        assert_eq!(to_sql_value(&json!(2.5)), SqlValue::Real(2.5));
        assert_eq!(to_sql_value(&json!({"a": 1})), SqlValue::Text("{\"a\":1}".into()));

        assert_eq!(to_json(ValueRef::Integer(7)), json!(7));
        assert_eq!(to_json(ValueRef::Blob(b"hi")), json!("aGk="));
        assert_eq!(to_json(ValueRef::Real(f64::NAN)), Value::Null);
    }

    #[test]
    fn test_execute_read_and_write_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let conn = Connection::open_in_memory().unwrap();

        let created = execute(&conn, &path, "CREATE TABLE t (a INTEGER)", vec![]);
        assert!(!created.is_error());
        assert!(path.exists());

        let inserted = execute(&conn, &path, "INSERT INTO t VALUES (?)", vec![SqlValue::Integer(4)]);
        assert_eq!(inserted.affected_rows, Some(1));

        let selected = execute(&conn, &path, "  -- lead\nselect a from t", vec![]);
        assert_eq!(selected.row_count, 1);
        assert_eq!(selected.columns[0].name, "a");
        assert_eq!(selected.rows[0]["a"], json!(4));
        assert!(selected.affected_rows.is_none());
    }

    #[test]
    fn test_execute_errors_are_reported_in_result() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open_in_memory().unwrap();

        let result = execute(&conn, &dir.path().join("t.db"), "SELECT * FROM missing", vec![]);
        let error = result.error.unwrap();
        assert_eq!(error.code, "QUERY_ERROR");
        assert!(error.message.contains("missing"));
        assert!(result.rows.is_empty());
        assert_eq!(result.row_count, 0);
    }
}
