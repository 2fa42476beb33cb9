use crate::config::DatabaseType;
use crate::error::{DataError, Result};
use crate::sql::SqlDialect;
use crate::types::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Optional operations an adapter implements.
///
/// Each adapter declares this once; a flag is set if and only if the adapter
/// overrides the matching optional method of [`DatabaseAdapter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterCapabilities {
    pub views: bool,
    pub view_definitions: bool,
    pub stored_procedures: bool,
    pub triggers: bool,
    pub users: bool,
    pub roles: bool,
    pub transactions: bool,
    pub explain: bool,
    pub multi_statement: bool,
}

fn not_supported(db_type: DatabaseType, operation: &str) -> DataError {
    DataError::operation_not_supported(format!(
        "{} is not supported by {}",
        operation,
        db_type.label()
    ))
}

/// Contract every backend adapter satisfies.
///
/// Adapters are shared behind `Arc` and use interior mutability for their
/// session handle. Backend-reported statement errors are returned inside
/// [`QueryResult::error`]; `Err` is reserved for lifecycle failures such as
/// [`DataError::NotConnected`].
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Backend type of this adapter
    fn database_type(&self) -> DatabaseType;

    /// Logical connection id this adapter serves
    fn connection_id(&self) -> &str;

    /// Declared optional operations
    fn capabilities(&self) -> AdapterCapabilities;

    /// Statement builder for row-level operations, `None` for non-SQL backends
    fn sql_dialect(&self) -> Option<SqlDialect> {
        None
    }

    /// Establish the session. Idempotent when already connected.
    async fn connect(&self) -> Result<()>;

    /// Release the session. Never fails when already disconnected.
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Throwaway connect + probe + disconnect; never touches the live session
    async fn test_connection(&self) -> bool;

    async fn execute_query(
        &self,
        query: &str,
        params: Option<Vec<serde_json::Value>>,
    ) -> Result<QueryResult>;

    async fn get_schema(&self) -> Result<SchemaInfo>;

    async fn get_tables(&self) -> Result<Vec<TableInfo>>;

    async fn get_columns(&self, table: &str) -> Result<Vec<ColumnInfo>>;

    async fn get_indexes(&self, table: &str) -> Result<Vec<IndexInfo>>;

    async fn get_primary_key(&self, table: &str) -> Result<Vec<String>>;

    async fn get_version(&self) -> Result<String>;

    /// Fails with `NotConnected` unless a session is live
    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DataError::not_connected(format!(
                "{} connection '{}' is not connected",
                self.database_type().label(),
                self.connection_id()
            )))
        }
    }

    async fn get_views(&self) -> Result<Vec<ViewInfo>> {
        Err(not_supported(self.database_type(), "getViews"))
    }

    async fn get_view_definition(&self, _view: &str) -> Result<String> {
        Err(not_supported(self.database_type(), "getViewDefinition"))
    }

    async fn get_stored_procedures(&self) -> Result<Vec<StoredProcedureInfo>> {
        Err(not_supported(self.database_type(), "getStoredProcedures"))
    }

    async fn get_triggers(&self, _table: Option<&str>) -> Result<Vec<TriggerInfo>> {
        Err(not_supported(self.database_type(), "getTriggers"))
    }

    async fn get_users(&self) -> Result<Vec<UserInfo>> {
        Err(not_supported(self.database_type(), "getUsers"))
    }

    async fn get_roles(&self) -> Result<Vec<RoleInfo>> {
        Err(not_supported(self.database_type(), "getRoles"))
    }

    async fn begin_transaction(&self) -> Result<()> {
        Err(not_supported(self.database_type(), "beginTransaction"))
    }

    async fn commit(&self) -> Result<()> {
        Err(not_supported(self.database_type(), "commit"))
    }

    async fn rollback(&self) -> Result<()> {
        Err(not_supported(self.database_type(), "rollback"))
    }

    async fn explain_query(&self, _query: &str) -> Result<ExplainResult> {
        Err(not_supported(self.database_type(), "explainQuery"))
    }

    /// One page of rows plus the table's column metadata
    async fn get_table_data(&self, table: &str, limit: usize, offset: usize) -> Result<TableData> {
        let dialect = self
            .sql_dialect()
            .ok_or_else(|| not_supported(self.database_type(), "getTableData"))?;
        self.ensure_connected()?;

        let page = self
            .execute_query(&dialect.select_page(table, limit, offset), None)
            .await?;
        if let Some(err) = page.error {
            return Err(DataError::QueryFailed(format!(
                "reading {} failed: {}",
                table, err.message
            )));
        }

        let count = self.execute_query(&dialect.count_rows(table), None).await?;
        let total_rows = count
            .rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(|v| v.as_u64());

        Ok(TableData {
            columns: self.get_columns(table).await?,
            rows: page.rows,
            total_rows,
            limit,
            offset,
        })
    }

    async fn insert_row(&self, table: &str, values: DataRow) -> Result<QueryResult> {
        let dialect = self
            .sql_dialect()
            .ok_or_else(|| not_supported(self.database_type(), "insertRow"))?;
        let (sql, params) = dialect.insert(table, &values)?;
        self.execute_query(&sql, Some(params)).await
    }

    async fn update_row(
        &self,
        table: &str,
        primary_key: DataRow,
        values: DataRow,
    ) -> Result<QueryResult> {
        let dialect = self
            .sql_dialect()
            .ok_or_else(|| not_supported(self.database_type(), "updateRow"))?;
        let (sql, params) = dialect.update(table, &primary_key, &values)?;
        self.execute_query(&sql, Some(params)).await
    }

    async fn delete_row(&self, table: &str, primary_key: DataRow) -> Result<QueryResult> {
        let dialect = self
            .sql_dialect()
            .ok_or_else(|| not_supported(self.database_type(), "deleteRow"))?;
        let (sql, params) = dialect.delete(table, &primary_key)?;
        self.execute_query(&sql, Some(params)).await
    }
}
