//! Wire envelope and request payloads.

use conduit_query::{ConnectionConfig, DataRow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    // Connection management
    ListConnections,
    AddConnection,
    UpdateConnection,
    RemoveConnection,
    TestConnection,
    ParseConnectionUri,

    // Lifecycle
    Connect,
    Disconnect,

    ExecuteQuery,

    // Introspection
    GetSchema,
    GetTables,
    GetColumns,
    GetIndexes,
    GetPrimaryKey,
    GetTableData,
    GetViews,
    GetViewDefinition,
    GetStoredProcedures,
    GetTriggers,
    GetUsers,
    GetRoles,
    GetVersion,

    // Mutation
    InsertRow,
    UpdateRow,
    DeleteRow,

    // Transactions
    BeginTransaction,
    Commit,
    Rollback,

    ExplainQuery,
    GetDatabaseCapabilities,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&name)
    }
}

/// Inbound envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub payload: Value,
}

/// Outbound envelope; `id` always echoes the request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl Response {
    pub fn ok(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: if data.is_null() { None } else { Some(data) },
            error: None,
            error_code: None,
        }
    }

    pub fn err(id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(message.into()),
            error_code: Some(code.into()),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

// Payloads

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConnectionTarget {
    pub connection_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConfigPayload {
    pub config: ConnectionConfig,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UriPayload {
    pub uri: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueryPayload {
    pub connection_id: String,
    pub query: String,
    #[serde(default)]
    pub params: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TablePayload {
    pub connection_id: String,
    pub table: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OptionalTablePayload {
    pub connection_id: String,
    #[serde(default)]
    pub table: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ViewPayload {
    pub connection_id: String,
    pub view: String,
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TableDataPayload {
    pub connection_id: String,
    pub table: String,
    #[serde(default = "default_page_size")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InsertRowPayload {
    pub connection_id: String,
    pub table: String,
    pub values: DataRow,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UpdateRowPayload {
    pub connection_id: String,
    pub table: String,
    pub primary_key: DataRow,
    pub values: DataRow,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeleteRowPayload {
    pub connection_id: String,
    pub table: String,
    pub primary_key: DataRow,
}
