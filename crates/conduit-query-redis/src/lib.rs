//! # conduit-query-redis
//!
//! Redis adapter for conduit-query.
//!
//! Redis has no tables, so keys stand in for them: `getTables` lists keys
//! (bounded by [`MAX_LISTED_KEYS`]), each key's columns follow its data type,
//! and row operations map to the native commands for that type. Queries are
//! plain command lines such as `HGETALL user:1`.
//!
//! No optional operations (views, transactions, explain, ...) are declared.

mod command;

use async_trait::async_trait;
use command::{param_arg, reply_rows, split_command, to_json};
use conduit_query::{
    AdapterBuilder, AdapterCapabilities, ColumnInfo, ConnectionConfig, DataError, DataRow,
    DatabaseAdapter, DatabaseSchema, DatabaseType, IndexInfo, QueryError, QueryResult, Result,
    SchemaInfo, TableData, TableInfo,
};
use redis::aio::ConnectionManager;
use redis::RedisError;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Upper bound on keys returned by `getTables`
pub const MAX_LISTED_KEYS: usize = 1000;
const SCAN_BATCH: usize = 200;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Redis data type of a key, from `TYPE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
    String,
    Hash,
    List,
    Set,
    SortedSet,
    Stream,
    Missing,
}

impl KeyKind {
    fn parse(type_name: &str) -> Self {
        match type_name {
            "string" => KeyKind::String,
            "hash" => KeyKind::Hash,
            "list" => KeyKind::List,
            "set" => KeyKind::Set,
            "zset" => KeyKind::SortedSet,
            "stream" => KeyKind::Stream,
            _ => KeyKind::Missing,
        }
    }

    fn column_names(&self) -> &'static [&'static str] {
        match self {
            KeyKind::String => &["value"],
            KeyKind::Hash => &["field", "value"],
            KeyKind::List => &["index", "value"],
            KeyKind::Set => &["member"],
            KeyKind::SortedSet => &["member", "score"],
            KeyKind::Stream => &["id", "fields"],
            KeyKind::Missing => &[],
        }
    }

    fn columns(&self) -> Vec<ColumnInfo> {
        self.column_names()
            .iter()
            .enumerate()
            .map(|(i, name)| ColumnInfo {
                name: name.to_string(),
                data_type: if *name == "score" || *name == "index" {
                    "number".to_string()
                } else {
                    "string".to_string()
                },
                nullable: false,
                default_value: None,
                is_primary_key: i == 0 && *self != KeyKind::String,
                is_auto_increment: false,
            })
            .collect()
    }

    /// Command returning the element count of a key of this kind
    fn length_command(&self, key: &str) -> redis::Cmd {
        let name = match self {
            KeyKind::Hash => "HLEN",
            KeyKind::List => "LLEN",
            KeyKind::Set => "SCARD",
            KeyKind::SortedSet => "ZCARD",
            KeyKind::Stream => "XLEN",
            KeyKind::String | KeyKind::Missing => "EXISTS",
        };
        let mut cmd = redis::cmd(name);
        cmd.arg(key);
        cmd
    }
}

fn query_error(operation: &str, e: RedisError) -> DataError {
    error!("Redis {} failed: {}", operation, e);
    DataError::QueryFailed(format!("{}: {}", operation, e))
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Key/value pairs from a RESP3 map or a flat RESP2 array
fn pairs(value: redis::Value) -> Vec<(Value, Value)> {
    match value {
        redis::Value::Map(pairs) => pairs.iter().map(|(k, v)| (to_json(k), to_json(v))).collect(),
        redis::Value::Array(items) => {
            // ZRANGE WITHSCORES replies with nested [member, score] pairs under RESP3
            let nested = !items.is_empty()
                && items
                    .iter()
                    .all(|item| matches!(item, redis::Value::Array(pair) if pair.len() == 2));
            if nested {
                items
                    .iter()
                    .filter_map(|item| match item {
                        redis::Value::Array(pair) => Some((to_json(&pair[0]), to_json(&pair[1]))),
                        _ => None,
                    })
                    .collect()
            } else {
                items
                    .chunks(2)
                    .filter(|chunk| chunk.len() == 2)
                    .map(|chunk| (to_json(&chunk[0]), to_json(&chunk[1])))
                    .collect()
            }
        }
        _ => Vec::new(),
    }
}

fn sort_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn data_row(pairs: Vec<(&str, Value)>) -> DataRow {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

/// Redis adapter backed by a reconnecting connection manager
pub struct RedisAdapter {
    id: String,
    config: ConnectionConfig,
    db: i64,
    connection: RwLock<Option<ConnectionManager>>,
    connected: AtomicBool,
}

impl RedisAdapter {
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        let db = if config.database.trim().is_empty() {
            0
        } else {
            config.database.trim().parse::<i64>().map_err(|_| {
                DataError::invalid_configuration(format!(
                    "Redis database must be a number, got '{}'",
                    config.database
                ))
            })?
        };

        Ok(Self {
            id: config.id.clone(),
            config,
            db,
            connection: RwLock::new(None),
            connected: AtomicBool::new(false),
        })
    }

    fn connection_info(&self) -> Result<redis::ConnectionInfo> {
        let host = self
            .config
            .host
            .clone()
            .ok_or_else(|| DataError::invalid_configuration("Redis connections require a host"))?;

        Ok(redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host, self.config.effective_port().unwrap_or(6379)),
            redis: redis::RedisConnectionInfo {
                db: self.db,
                username: self.config.username.clone(),
                password: self.config.password.clone(),
                ..Default::default()
            },
        })
    }

    fn client(&self) -> Result<redis::Client> {
        redis::Client::open(self.connection_info()?).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            DataError::ConnectionFailed(format!("Failed to create Redis client: {}", e))
        })
    }

    async fn manager(&self) -> Result<ConnectionManager> {
        self.ensure_connected()?;
        self.connection.read().await.clone().ok_or_else(|| {
            DataError::not_connected(format!("Redis connection '{}' is not connected", self.id))
        })
    }

    async fn key_kind(&self, conn: &mut ConnectionManager, key: &str) -> Result<KeyKind> {
        let type_name: String = redis::cmd("TYPE")
            .arg(key)
            .query_async(conn)
            .await
            .map_err(|e| query_error("TYPE", e))?;
        Ok(KeyKind::parse(&type_name))
    }

    /// Up to [`MAX_LISTED_KEYS`] keys via incremental `SCAN`, sorted
    async fn scan_keys(&self, conn: &mut ConnectionManager) -> Result<Vec<String>> {
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(conn)
                .await
                .map_err(|e| query_error("SCAN", e))?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 || keys.len() >= MAX_LISTED_KEYS {
                break;
            }
        }

        keys.sort();
        keys.dedup();
        keys.truncate(MAX_LISTED_KEYS);
        Ok(keys)
    }

    /// Run a write command, reporting server errors inside the result
    async fn write(&self, cmd: redis::Cmd) -> Result<QueryResult> {
        let mut conn = self.manager().await?;
        let started = Instant::now();

        let reply: redis::RedisResult<redis::Value> = cmd.query_async(&mut conn).await;
        match reply {
            Ok(redis::Value::Int(n)) => Ok(QueryResult::with_affected(n.max(0) as u64, elapsed_ms(started))),
            Ok(_) => Ok(QueryResult::with_affected(1, elapsed_ms(started))),
            Err(e) => Ok(QueryResult::failed(
                QueryError::new(e.code().unwrap_or("QUERY_ERROR"), e.to_string()),
                elapsed_ms(started),
            )),
        }
    }
}

#[async_trait]
impl DatabaseAdapter for RedisAdapter {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Redis
    }

    fn connection_id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
    }

    async fn connect(&self) -> Result<()> {
        let mut slot = self.connection.write().await;
        if slot.is_some() {
            return Ok(());
        }

        debug!("Connecting to Redis: {}", self.config.display_string());
        let client = self.client()?;
        let manager = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| DataError::ConnectionFailed("Timed out connecting to Redis".to_string()))?
            .map_err(|e| {
                error!("Failed to connect to Redis: {}", e);
                DataError::ConnectionFailed(format!("Failed to connect to Redis: {}", e))
            })?;

        *slot = Some(manager);
        self.connected.store(true, Ordering::SeqCst);
        debug!("Redis connection {} connected", self.id);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // The manager closes its socket once the last clone is dropped
        if self.connection.write().await.take().is_some() {
            debug!("Redis connection {} disconnected", self.id);
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn test_connection(&self) -> bool {
        let probe = async {
            let client = self.client()?;
            let mut conn = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| DataError::ConnectionFailed(e.to_string()))?;
            let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
            pong.map_err(|e| DataError::ConnectionFailed(e.to_string()))
        };

        match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Redis probe for {} failed: {}", self.id, e);
                false
            }
            Err(_) => false,
        }
    }

    async fn execute_query(&self, query: &str, params: Option<Vec<Value>>) -> Result<QueryResult> {
        let mut conn = self.manager().await?;
        let started = Instant::now();

        let mut args = match split_command(query) {
            Ok(args) => args,
            Err(message) => {
                return Ok(QueryResult::failed(
                    QueryError::new("QUERY_ERROR", message),
                    elapsed_ms(started),
                ))
            }
        };
        if args.is_empty() {
            return Ok(QueryResult::failed(
                QueryError::new("QUERY_ERROR", "empty command"),
                elapsed_ms(started),
            ));
        }
        args.extend(params.unwrap_or_default().iter().map(param_arg));

        let mut cmd = redis::cmd(&args[0].to_ascii_uppercase());
        for arg in &args[1..] {
            cmd.arg(arg);
        }
        debug!("Executing Redis command on {}: {}", self.id, args[0]);

        let reply: redis::RedisResult<redis::Value> = cmd.query_async(&mut conn).await;
        match reply {
            Ok(reply) => {
                let (columns, rows) = reply_rows(&reply);
                Ok(QueryResult::with_rows(columns, rows, elapsed_ms(started)))
            }
            Err(e) => Ok(QueryResult::failed(
                QueryError::new(e.code().unwrap_or("QUERY_ERROR"), e.to_string()),
                elapsed_ms(started),
            )),
        }
    }

    async fn get_schema(&self) -> Result<SchemaInfo> {
        Ok(SchemaInfo {
            databases: vec![DatabaseSchema {
                name: format!("db{}", self.db),
                tables: self.get_tables().await?,
                views: Vec::new(),
            }],
        })
    }

    async fn get_tables(&self) -> Result<Vec<TableInfo>> {
        let mut conn = self.manager().await?;
        let keys = self.scan_keys(&mut conn).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut types = redis::pipe();
        for key in &keys {
            types.cmd("TYPE").arg(key);
        }
        let type_names: Vec<String> = types
            .query_async(&mut conn)
            .await
            .map_err(|e| query_error("getTables", e))?;
        let kinds: Vec<KeyKind> = type_names.iter().map(|t| KeyKind::parse(t)).collect();

        let mut lengths = redis::pipe();
        for (key, kind) in keys.iter().zip(&kinds) {
            lengths.add_command(kind.length_command(key));
        }
        let counts: Vec<i64> = lengths
            .query_async(&mut conn)
            .await
            .map_err(|e| query_error("getTables", e))?;

        Ok(keys
            .into_iter()
            .zip(kinds)
            .zip(counts)
            .filter(|((_, kind), _)| *kind != KeyKind::Missing)
            .map(|((key, kind), count)| TableInfo {
                name: key,
                schema: Some(format!("db{}", self.db)),
                columns: kind.columns(),
                indexes: Vec::new(),
                foreign_keys: Vec::new(),
                row_count: Some(count.max(0) as u64),
            })
            .collect())
    }

    async fn get_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut conn = self.manager().await?;
        match self.key_kind(&mut conn, table).await? {
            KeyKind::Missing => Err(DataError::not_found(format!("key '{}' does not exist", table))),
            kind => Ok(kind.columns()),
        }
    }

    async fn get_indexes(&self, _table: &str) -> Result<Vec<IndexInfo>> {
        self.ensure_connected()?;
        Ok(Vec::new())
    }

    async fn get_primary_key(&self, table: &str) -> Result<Vec<String>> {
        Ok(self
            .get_columns(table)
            .await?
            .into_iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name)
            .collect())
    }

    async fn get_version(&self) -> Result<String> {
        let mut conn = self.manager().await?;
        let info: String = redis::cmd("INFO")
            .arg("server")
            .query_async(&mut conn)
            .await
            .map_err(|e| query_error("getVersion", e))?;

        Ok(info
            .lines()
            .find_map(|line| line.strip_prefix("redis_version:"))
            .map(|v| format!("Redis {}", v.trim()))
            .unwrap_or_else(|| "Redis".to_string()))
    }

    async fn get_table_data(&self, table: &str, limit: usize, offset: usize) -> Result<TableData> {
        let mut conn = self.manager().await?;
        let kind = self.key_kind(&mut conn, table).await?;
        let last = (offset + limit).saturating_sub(1);

        let (rows, total): (Vec<DataRow>, u64) = match kind {
            KeyKind::Missing => {
                return Err(DataError::not_found(format!("key '{}' does not exist", table)))
            }
            KeyKind::Stream => {
                return Err(DataError::operation_not_supported(
                    "reading stream keys as table data is not supported",
                ))
            }
            KeyKind::String => {
                let value: Option<String> = redis::cmd("GET")
                    .arg(table)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| query_error("GET", e))?;
                let rows = if offset == 0 && limit > 0 {
                    vec![data_row(vec![("value", value.map(Value::String).unwrap_or(Value::Null))])]
                } else {
                    Vec::new()
                };
                (rows, 1)
            }
            KeyKind::Hash => {
                let reply: redis::Value = redis::cmd("HGETALL")
                    .arg(table)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| query_error("HGETALL", e))?;
                let mut fields = pairs(reply);
                fields.sort_by_key(|(field, _)| sort_key(field));
                let total = fields.len() as u64;
                let rows = fields
                    .into_iter()
                    .skip(offset)
                    .take(limit)
                    .map(|(field, value)| data_row(vec![("field", field), ("value", value)]))
                    .collect();
                (rows, total)
            }
            KeyKind::List => {
                if limit == 0 {
                    (Vec::new(), 0)
                } else {
                    let items: Vec<String> = redis::cmd("LRANGE")
                        .arg(table)
                        .arg(offset)
                        .arg(last)
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| query_error("LRANGE", e))?;
                    let total: u64 = redis::cmd("LLEN")
                        .arg(table)
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| query_error("LLEN", e))?;
                    let rows = items
                        .into_iter()
                        .enumerate()
                        .map(|(i, item)| {
                            data_row(vec![("index", Value::from(offset + i)), ("value", Value::String(item))])
                        })
                        .collect();
                    (rows, total)
                }
            }
            KeyKind::Set => {
                let mut members: Vec<String> = redis::cmd("SMEMBERS")
                    .arg(table)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| query_error("SMEMBERS", e))?;
                members.sort();
                let total = members.len() as u64;
                let rows = members
                    .into_iter()
                    .skip(offset)
                    .take(limit)
                    .map(|member| data_row(vec![("member", Value::String(member))]))
                    .collect();
                (rows, total)
            }
            KeyKind::SortedSet => {
                if limit == 0 {
                    (Vec::new(), 0)
                } else {
                    let reply: redis::Value = redis::cmd("ZRANGE")
                        .arg(table)
                        .arg(offset)
                        .arg(last)
                        .arg("WITHSCORES")
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| query_error("ZRANGE", e))?;
                    let total: u64 = redis::cmd("ZCARD")
                        .arg(table)
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| query_error("ZCARD", e))?;
                    let rows = pairs(reply)
                        .into_iter()
                        .map(|(member, score)| data_row(vec![("member", member), ("score", score)]))
                        .collect();
                    (rows, total)
                }
            }
        };

        Ok(TableData {
            columns: kind.columns(),
            rows,
            total_rows: Some(total),
            limit,
            offset,
        })
    }

    /// `{value}` sets a string key; anything else is written as hash fields
    async fn insert_row(&self, table: &str, values: DataRow) -> Result<QueryResult> {
        if values.is_empty() {
            return Err(DataError::QueryFailed("no values to write".to_string()));
        }

        if values.len() == 1 {
            if let Some(value) = values.get("value") {
                let mut cmd = redis::cmd("SET");
                cmd.arg(table).arg(param_arg(value));
                return self.write(cmd).await;
            }
        }

        let mut cmd = redis::cmd("HSET");
        cmd.arg(table);
        match (values.get("field"), values.get("value"), values.len()) {
            (Some(field), Some(value), 2) => {
                cmd.arg(param_arg(field)).arg(param_arg(value));
            }
            _ => {
                let mut fields: Vec<_> = values.iter().collect();
                fields.sort_by(|a, b| a.0.cmp(b.0));
                for (field, value) in fields {
                    cmd.arg(field).arg(param_arg(value));
                }
            }
        }
        self.write(cmd).await
    }

    async fn update_row(&self, table: &str, primary_key: DataRow, values: DataRow) -> Result<QueryResult> {
        match primary_key.get("field") {
            Some(field) => {
                let value = values.get("value").ok_or_else(|| {
                    DataError::QueryFailed("updating a hash field requires a 'value'".to_string())
                })?;
                let mut cmd = redis::cmd("HSET");
                cmd.arg(table).arg(param_arg(field)).arg(param_arg(value));
                self.write(cmd).await
            }
            None => self.insert_row(table, values).await,
        }
    }

    /// `{field}` removes a hash field, `{member}` a set member; otherwise the key is deleted
    async fn delete_row(&self, table: &str, primary_key: DataRow) -> Result<QueryResult> {
        let mut cmd;
        if let Some(field) = primary_key.get("field") {
            cmd = redis::cmd("HDEL");
            cmd.arg(table).arg(param_arg(field));
        } else if let Some(member) = primary_key.get("member") {
            let mut conn = self.manager().await?;
            cmd = match self.key_kind(&mut conn, table).await? {
                KeyKind::SortedSet => redis::cmd("ZREM"),
                _ => redis::cmd("SREM"),
            };
            cmd.arg(table).arg(param_arg(member));
        } else {
            cmd = redis::cmd("DEL");
            cmd.arg(table);
        }
        self.write(cmd).await
    }
}

/// Builds [`RedisAdapter`]s for the factory
pub struct RedisBuilder;

impl AdapterBuilder for RedisBuilder {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Redis
    }

    fn build(&self, config: ConnectionConfig) -> Result<Arc<dyn DatabaseAdapter>> {
        Ok(Arc::new(RedisAdapter::new(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("cache", DatabaseType::Redis)
            .with_id("r1")
            .with_host("localhost")
    }

    #[test]
    fn test_database_index_parsing() {
        assert_eq!(RedisAdapter::new(config()).unwrap().db, 0);
        assert_eq!(RedisAdapter::new(config().with_database("3")).unwrap().db, 3);
        let err = RedisAdapter::new(config().with_database("main")).err().unwrap();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_connection_info() {
        let adapter = RedisAdapter::new(config().with_port(6380).with_password("pw")).unwrap();
        let info = adapter.connection_info().unwrap();
        assert!(matches!(
            info.addr,
            redis::ConnectionAddr::Tcp(ref host, 6380) if host == "localhost"
        ));
        assert_eq!(info.redis.password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_key_kind_columns() {
        assert_eq!(KeyKind::parse("zset"), KeyKind::SortedSet);
        assert_eq!(KeyKind::parse("none"), KeyKind::Missing);

        let hash = KeyKind::Hash.columns();
        assert_eq!(hash[0].name, "field");
        assert!(hash[0].is_primary_key);
        assert!(!KeyKind::String.columns()[0].is_primary_key);
    }

    #[test]
    fn test_pairs_from_both_protocols() {
        let resp2 = redis::Value::Array(vec![
            redis::Value::BulkString(b"a".to_vec()),
            redis::Value::BulkString(b"1".to_vec()),
        ]);
        assert_eq!(pairs(resp2), vec![(Value::from("a"), Value::from("1"))]);

        let resp3 = redis::Value::Array(vec![redis::Value::Array(vec![
            redis::Value::BulkString(b"m".to_vec()),
            redis::Value::Double(1.5),
        ])]);
        assert_eq!(pairs(resp3), vec![(Value::from("m"), Value::from(1.5))]);
    }

    #[tokio::test]
    async fn test_declares_no_optional_operations() {
        let adapter = RedisAdapter::new(config()).unwrap();
        assert_eq!(adapter.capabilities(), AdapterCapabilities::default());
        assert_eq!(adapter.begin_transaction().await.unwrap_err().code(), "NOT_SUPPORTED");
        assert_eq!(
            adapter.execute_query("PING", None).await.unwrap_err().code(),
            "NOT_CONNECTED"
        );
    }
}
