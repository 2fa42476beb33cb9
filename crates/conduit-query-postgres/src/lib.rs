//! PostgreSQL adapter for conduit-query
//!
//! Implements every optional operation of [`DatabaseAdapter`]. Also serves
//! CockroachDB, which speaks the same wire protocol.

mod catalog;
mod value;

use async_trait::async_trait;
use conduit_query::{
    AdapterBuilder, AdapterCapabilities, ColumnInfo, ConnectionConfig, DataError, DataRow,
    DatabaseAdapter, DatabaseSchema, DatabaseType, ExplainResult, ForeignKeyInfo, IndexInfo,
    PlanNode, QueryError, QueryResult, Result, ResultColumn, RoleInfo, SchemaInfo, SqlDialect,
    StoredProcedureInfo, TableInfo, TriggerInfo, UserInfo, ViewInfo,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error};
use value::{extract_value, TextParam};

const DEFAULT_SCHEMA: &str = "public";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// PostgreSQL adapter holding one client session
pub struct PostgresAdapter {
    id: String,
    db_type: DatabaseType,
    config: ConnectionConfig,
    client: RwLock<Option<Arc<Client>>>,
    connected: AtomicBool,
}

impl PostgresAdapter {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            id: config.id.clone(),
            db_type: config.db_type,
            config,
            client: RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Driver configuration from the (possibly tunnel-rewritten) connection config
    fn pg_config(&self) -> Result<tokio_postgres::Config> {
        let config = &self.config;

        let mut pg = match (&config.host, &config.connection_string) {
            (None, Some(uri)) => uri.parse::<tokio_postgres::Config>().map_err(|e| {
                DataError::invalid_configuration(format!("invalid connection string: {}", e))
            })?,
            _ => {
                let host = config.host.as_deref().ok_or_else(|| {
                    DataError::invalid_configuration("PostgreSQL connections require a host")
                })?;
                let mut pg = tokio_postgres::Config::new();
                pg.host(host);
                pg.port(config.effective_port().unwrap_or(5432));
                if !config.database.is_empty() {
                    pg.dbname(&config.database);
                }
                pg
            }
        };

        if let Some(user) = &config.username {
            pg.user(user);
        }
        if let Some(password) = &config.password {
            pg.password(password);
        }
        pg.application_name(
            config
                .options
                .get("application_name")
                .map(String::as_str)
                .unwrap_or("conduit"),
        );
        let timeout = config
            .options
            .get("connect_timeout")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(CONNECT_TIMEOUT);
        pg.connect_timeout(timeout);
        // Only plaintext transport is compiled in; `ssl = true` makes the handshake fail loudly
        pg.ssl_mode(if config.ssl == Some(true) {
            SslMode::Require
        } else {
            SslMode::Prefer
        });

        Ok(pg)
    }

    async fn open_session(&self) -> Result<Client> {
        let pg = self.pg_config()?;
        debug!(
            "Connecting to {}: {}",
            self.db_type.label(),
            self.config.display_string()
        );

        let (client, connection) = pg.connect(NoTls).await.map_err(|e| {
            DataError::ConnectionFailed(format!("{} connection failed: {}", self.db_type.label(), e))
        })?;

        let id = self.id.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection {} error: {}", id, e);
            }
        });

        Ok(client)
    }

    async fn client(&self) -> Result<Arc<Client>> {
        self.ensure_connected()?;
        self.client.read().await.clone().ok_or_else(|| {
            DataError::not_connected(format!("PostgreSQL connection '{}' is not connected", self.id))
        })
    }

    async fn catalog(&self, operation: &str, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        let client = self.client().await?;
        client.query(sql, params).await.map_err(|e| {
            error!("PostgreSQL {} failed: {}", operation, e);
            DataError::QueryFailed(format!("{}: {}", operation, describe_error(&e).1))
        })
    }

    async fn columns_of(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows = self
            .catalog("getColumns", catalog::COLUMNS, &[&schema, &table])
            .await?;
        Ok(rows
            .iter()
            .map(|row| ColumnInfo {
                name: row.get(0),
                data_type: row.get(1),
                nullable: row.get(2),
                default_value: row.get(3),
                is_primary_key: row.get(4),
                is_auto_increment: row.get(5),
            })
            .collect())
    }

    async fn indexes_of(&self, relation: &str) -> Result<Vec<IndexInfo>> {
        let rows = self
            .catalog("getIndexes", catalog::INDEXES, &[&relation])
            .await?;
        Ok(rows
            .iter()
            .map(|row| IndexInfo {
                name: row.get(0),
                columns: row.get(1),
                unique: row.get(2),
                primary: row.get(3),
            })
            .collect())
    }

    async fn foreign_keys_of(&self, relation: &str) -> Result<Vec<ForeignKeyInfo>> {
        let rows = self
            .catalog("getForeignKeys", catalog::FOREIGN_KEYS, &[&relation])
            .await?;
        Ok(rows
            .iter()
            .map(|row| ForeignKeyInfo {
                name: row.get(0),
                columns: row.get(1),
                referenced_table: row.get(2),
                referenced_columns: row.get(3),
                on_update: catalog::referential_action(row.get(4)),
                on_delete: catalog::referential_action(row.get(5)),
            })
            .collect())
    }

    async fn table_info(&self, schema: &str, table: &str) -> Result<TableInfo> {
        let relation = qualified(schema, table);
        let estimate_params: [&(dyn ToSql + Sync); 1] = [&relation];
        let (columns, indexes, foreign_keys, estimate) = tokio::try_join!(
            self.columns_of(schema, table),
            self.indexes_of(&relation),
            self.foreign_keys_of(&relation),
            self.catalog("getRowCount", catalog::ROW_ESTIMATE, &estimate_params),
        )?;

        Ok(TableInfo {
            name: table.to_string(),
            schema: Some(schema.to_string()),
            columns,
            indexes,
            foreign_keys,
            row_count: estimate
                .first()
                .map(|row| row.get::<_, i64>(0).max(0) as u64),
        })
    }

    async fn control(&self, operation: &str, statement: &str) -> Result<()> {
        let client = self.client().await?;
        client.batch_execute(statement).await.map_err(|e| {
            error!("PostgreSQL {} failed: {}", operation, e);
            DataError::QueryFailed(format!("{}: {}", operation, describe_error(&e).1))
        })
    }
}

async fn run_statement(
    client: &Client,
    query: &str,
    params: &[Value],
) -> std::result::Result<QueryResult, tokio_postgres::Error> {
    let started = Instant::now();
    let statement = client.prepare(query).await?;
    let params: Vec<TextParam> = params.iter().map(TextParam::from_json).collect();
    let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

    if statement.columns().is_empty() {
        let affected = client.execute(&statement, &refs).await?;
        return Ok(QueryResult::with_affected(
            affected,
            started.elapsed().as_millis() as u64,
        ));
    }

    let rows = client.query(&statement, &refs).await?;
    let columns = statement
        .columns()
        .iter()
        .map(|col| ResultColumn::typed(col.name(), col.type_().name()))
        .collect();
    let data: Vec<DataRow> = rows.iter().map(row_to_datarow).collect();

    Ok(QueryResult::with_rows(
        columns,
        data,
        started.elapsed().as_millis() as u64,
    ))
}

fn row_to_datarow(row: &Row) -> DataRow {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| (column.name().to_string(), extract_value(row, idx)))
        .collect()
}

/// SQLSTATE code and a detailed message for a driver error
fn describe_error(e: &tokio_postgres::Error) -> (String, String) {
    match e.as_db_error() {
        Some(db_error) => {
            let mut msg = db_error.message().to_string();
            if let Some(detail) = db_error.detail() {
                msg.push_str(&format!("\nDetail: {}", detail));
            }
            if let Some(hint) = db_error.hint() {
                msg.push_str(&format!("\nHint: {}", hint));
            }
            if let Some(column) = db_error.column() {
                msg.push_str(&format!("\nColumn: {}", column));
            }
            (db_error.code().code().to_string(), msg)
        }
        None => ("QUERY_ERROR".to_string(), e.to_string()),
    }
}

/// Split `schema.table`; bare names resolve to `public`
fn split_table(name: &str) -> (&str, &str) {
    match name.split_once('.') {
        Some((schema, table)) if !schema.is_empty() && !table.is_empty() => (schema, table),
        _ => (DEFAULT_SCHEMA, name),
    }
}

fn qualified(schema: &str, table: &str) -> String {
    format!(
        "{}.{}",
        SqlDialect::POSTGRES.quote_identifier(schema),
        SqlDialect::POSTGRES.quote_identifier(table)
    )
}

/// Map one `EXPLAIN (FORMAT JSON)` plan object to a node
fn plan_node(plan: &Value) -> PlanNode {
    let text = |key: &str| plan.get(key).and_then(Value::as_str).map(String::from);
    let node_type = text("Node Type").unwrap_or_else(|| "Unknown".to_string());
    let relation_name = text("Relation Name");
    let index_name = text("Index Name");

    let mut detail = node_type.clone();
    if let Some(index) = &index_name {
        detail.push_str(&format!(" using {}", index));
    }
    if let Some(relation) = &relation_name {
        detail.push_str(&format!(" on {}", relation));
    }
    if let (Some(startup), Some(total), Some(rows)) = (
        plan.get("Startup Cost").and_then(Value::as_f64),
        plan.get("Total Cost").and_then(Value::as_f64),
        plan.get("Plan Rows").and_then(Value::as_f64),
    ) {
        detail.push_str(&format!("  (cost={:.2}..{:.2} rows={})", startup, total, rows));
    }

    PlanNode {
        node_type,
        relation_name,
        index_name,
        detail,
        children: plan
            .get("Plans")
            .and_then(Value::as_array)
            .map(|plans| plans.iter().map(plan_node).collect())
            .unwrap_or_default(),
    }
}

fn explain_from_json(document: &Value) -> ExplainResult {
    let plan = document
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get("Plan"))
                .map(plan_node)
                .collect()
        })
        .unwrap_or_default();

    ExplainResult {
        plan,
        raw: serde_json::to_string_pretty(document).unwrap_or_else(|_| document.to_string()),
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    fn connection_id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            views: true,
            view_definitions: true,
            stored_procedures: true,
            triggers: true,
            users: true,
            roles: true,
            transactions: true,
            explain: true,
            multi_statement: false,
        }
    }

    fn sql_dialect(&self) -> Option<SqlDialect> {
        Some(SqlDialect::POSTGRES)
    }

    async fn connect(&self) -> Result<()> {
        let mut slot = self.client.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let client = self.open_session().await?;
        *slot = Some(Arc::new(client));
        self.connected.store(true, Ordering::SeqCst);
        debug!("PostgreSQL connection {} connected", self.id);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // Dropping the last client handle closes the socket
        if self.client.write().await.take().is_some() {
            debug!("PostgreSQL connection {} disconnected", self.id);
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn test_connection(&self) -> bool {
        let probe = async {
            let client = self.open_session().await?;
            client
                .simple_query("SELECT 1")
                .await
                .map_err(|e| DataError::ConnectionFailed(e.to_string()))
        };

        match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("PostgreSQL probe for {} failed: {}", self.id, e);
                false
            }
            Err(_) => {
                debug!("PostgreSQL probe for {} timed out", self.id);
                false
            }
        }
    }

    async fn execute_query(&self, query: &str, params: Option<Vec<Value>>) -> Result<QueryResult> {
        let client = self.client().await?;
        let started = Instant::now();
        debug!("Executing SQL on {}: {}", self.id, query);

        match run_statement(&client, query, &params.unwrap_or_default()).await {
            Ok(result) => Ok(result),
            Err(e) => {
                let (code, message) = describe_error(&e);
                debug!("PostgreSQL statement failed ({}): {}", code, message);
                Ok(QueryResult::failed(
                    QueryError::new(code, message),
                    started.elapsed().as_millis() as u64,
                ))
            }
        }
    }

    async fn get_schema(&self) -> Result<SchemaInfo> {
        let (tables, views) = tokio::try_join!(self.get_tables(), self.get_views())?;

        let mut schemas: BTreeMap<String, DatabaseSchema> = BTreeMap::new();
        for table in tables {
            let name = table.schema.clone().unwrap_or_else(|| DEFAULT_SCHEMA.to_string());
            schemas
                .entry(name.clone())
                .or_insert_with(|| DatabaseSchema {
                    name,
                    tables: Vec::new(),
                    views: Vec::new(),
                })
                .tables
                .push(table);
        }
        for view in views {
            let name = view.schema.clone().unwrap_or_else(|| DEFAULT_SCHEMA.to_string());
            schemas
                .entry(name.clone())
                .or_insert_with(|| DatabaseSchema {
                    name,
                    tables: Vec::new(),
                    views: Vec::new(),
                })
                .views
                .push(view);
        }

        Ok(SchemaInfo {
            databases: schemas.into_values().collect(),
        })
    }

    async fn get_tables(&self) -> Result<Vec<TableInfo>> {
        let rows = self.catalog("getTables", catalog::USER_TABLES, &[]).await?;
        let names: Vec<(String, String)> = rows.iter().map(|row| (row.get(0), row.get(1))).collect();

        futures::future::try_join_all(
            names
                .iter()
                .map(|(schema, table)| self.table_info(schema, table)),
        )
        .await
    }

    async fn get_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let (schema, name) = split_table(table);
        let columns = self.columns_of(schema, name).await?;
        if columns.is_empty() {
            return Err(DataError::not_found(format!("table '{}' does not exist", table)));
        }
        Ok(columns)
    }

    async fn get_indexes(&self, table: &str) -> Result<Vec<IndexInfo>> {
        let (schema, name) = split_table(table);
        self.indexes_of(&qualified(schema, name)).await
    }

    async fn get_primary_key(&self, table: &str) -> Result<Vec<String>> {
        let (schema, name) = split_table(table);
        let relation = qualified(schema, name);
        let rows = self
            .catalog("getPrimaryKey", catalog::PRIMARY_KEY, &[&relation])
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn get_version(&self) -> Result<String> {
        let rows = self.catalog("getVersion", "SELECT version()", &[]).await?;
        rows.first()
            .map(|row| row.get::<_, String>(0))
            .ok_or_else(|| DataError::QueryFailed("version() returned no rows".to_string()))
    }

    async fn get_views(&self) -> Result<Vec<ViewInfo>> {
        let rows = self.catalog("getViews", catalog::VIEWS, &[]).await?;
        Ok(rows
            .iter()
            .map(|row| ViewInfo {
                schema: Some(row.get(0)),
                name: row.get(1),
                definition: row.get(2),
            })
            .collect())
    }

    async fn get_view_definition(&self, view: &str) -> Result<String> {
        let (schema, name) = split_table(view);
        let relation = qualified(schema, name);
        let rows = self
            .catalog("getViewDefinition", catalog::VIEW_DEFINITION, &[&relation])
            .await?;
        rows.first()
            .and_then(|row| row.get::<_, Option<String>>(0))
            .ok_or_else(|| DataError::not_found(format!("view '{}' does not exist", view)))
    }

    async fn get_stored_procedures(&self) -> Result<Vec<StoredProcedureInfo>> {
        let rows = self
            .catalog("getStoredProcedures", catalog::ROUTINES, &[])
            .await?;
        Ok(rows
            .iter()
            .map(|row| StoredProcedureInfo {
                schema: Some(row.get(0)),
                name: row.get(1),
                kind: row.get(2),
                return_type: row.get(3),
                arguments: row.get(4),
                definition: row.get(5),
            })
            .collect())
    }

    async fn get_triggers(&self, table: Option<&str>) -> Result<Vec<TriggerInfo>> {
        let table = table.map(|t| split_table(t).1.to_string());
        let rows = self
            .catalog("getTriggers", catalog::TRIGGERS, &[&table])
            .await?;
        Ok(rows
            .iter()
            .map(|row| TriggerInfo {
                name: row.get(0),
                table: row.get(1),
                timing: row.get(2),
                event: row.get(3),
                definition: row.get(4),
            })
            .collect())
    }

    async fn get_users(&self) -> Result<Vec<UserInfo>> {
        let rows = self.catalog("getUsers", catalog::USERS, &[]).await?;
        Ok(rows
            .iter()
            .map(|row| UserInfo {
                name: row.get(0),
                superuser: row.get(1),
                can_login: row.get(2),
                roles: row.get(3),
            })
            .collect())
    }

    async fn get_roles(&self) -> Result<Vec<RoleInfo>> {
        let rows = self.catalog("getRoles", catalog::ROLES, &[]).await?;
        Ok(rows
            .iter()
            .map(|row| RoleInfo {
                name: row.get(0),
                superuser: row.get(1),
                can_login: row.get(2),
                members: row.get(3),
            })
            .collect())
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.control("beginTransaction", "BEGIN").await
    }

    async fn commit(&self) -> Result<()> {
        self.control("commit", "COMMIT").await
    }

    async fn rollback(&self) -> Result<()> {
        self.control("rollback", "ROLLBACK").await
    }

    async fn explain_query(&self, query: &str) -> Result<ExplainResult> {
        let explain = format!("EXPLAIN (FORMAT JSON) {}", query);
        let rows = self.catalog("explainQuery", &explain, &[]).await?;
        let document: Value = rows
            .first()
            .map(|row| row.get(0))
            .ok_or_else(|| DataError::QueryFailed("EXPLAIN returned no plan".to_string()))?;
        Ok(explain_from_json(&document))
    }
}

/// Builds PostgreSQL-protocol adapters for one backend type
pub struct PostgresBuilder {
    db_type: DatabaseType,
}

impl PostgresBuilder {
    pub fn postgres() -> Self {
        Self {
            db_type: DatabaseType::Postgres,
        }
    }

    pub fn cockroachdb() -> Self {
        Self {
            db_type: DatabaseType::Cockroachdb,
        }
    }
}

impl AdapterBuilder for PostgresBuilder {
    fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    fn build(&self, config: ConnectionConfig) -> Result<Arc<dyn DatabaseAdapter>> {
        Ok(Arc::new(PostgresAdapter::new(config)))
    }
}
