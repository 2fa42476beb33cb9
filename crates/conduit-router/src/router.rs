use crate::error::{Result, RouterError};
use crate::message::*;
use conduit_connections::ConnectionService;
use conduit_query::{
    classify_statement, ConnectionConfig, DataError, QueryError, QueryResult, StatementKind,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Statements that cannot change the schema
const READ_KEYWORDS: &[&str] = &["SELECT", "WITH", "PRAGMA", "EXPLAIN", "SHOW", "DESCRIBE"];

/// Dispatch outcome before it is wrapped in an envelope
enum Reply {
    Data(Value),
    /// The backend rejected a statement; the result still travels as `data`
    Rejected(QueryError, Value),
}

fn data<T: Serialize>(value: T) -> Result<Reply> {
    let value = serde_json::to_value(value).map_err(DataError::from)?;
    Ok(Reply::Data(value))
}

fn query_reply(result: QueryResult) -> Result<Reply> {
    let error = result.error.clone();
    let value = serde_json::to_value(result).map_err(DataError::from)?;
    Ok(match error {
        Some(error) => Reply::Rejected(error, value),
        None => Reply::Data(value),
    })
}

fn parse<T: DeserializeOwned>(kind: MessageType, payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(|e| RouterError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

/// Decode a raw line into a request. The error side carries whatever id could
/// be recovered so the response can still be correlated.
fn parse_request(raw: &str) -> std::result::Result<Request, (String, RouterError)> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| (String::new(), RouterError::Malformed(e.to_string())))?;
    let object = value.as_object().ok_or_else(|| {
        (
            String::new(),
            RouterError::Malformed("expected a JSON object".to_string()),
        )
    })?;

    let id = match object.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => {
            return Err((
                String::new(),
                RouterError::Malformed("missing request id".to_string()),
            ))
        }
    };

    let type_name = match object.get("type").and_then(Value::as_str) {
        Some(name) => name,
        None => {
            return Err((
                id,
                RouterError::Malformed("missing message type".to_string()),
            ))
        }
    };
    let kind = match serde_json::from_value::<MessageType>(Value::String(type_name.to_string())) {
        Ok(kind) => kind,
        Err(_) => return Err((id, RouterError::UnknownType(type_name.to_string()))),
    };

    Ok(Request {
        id,
        kind,
        payload: object.get("payload").cloned().unwrap_or(Value::Null),
    })
}

/// Prefix for failure messages naming the operation and, when the payload
/// carries one, the target connection
fn failure_context(kind: MessageType, payload: &Value) -> String {
    match payload.get("connectionId").and_then(Value::as_str) {
        Some(connection_id) => format!("{} on connection {}", kind, connection_id),
        None => kind.to_string(),
    }
}

/// The single crossing point between callers and the core: every request
/// yields exactly one [`Response`], and no error escapes it
pub struct MessageRouter {
    connections: Arc<ConnectionService>,
}

impl MessageRouter {
    pub fn new(connections: Arc<ConnectionService>) -> Self {
        Self { connections }
    }

    pub fn connections(&self) -> &Arc<ConnectionService> {
        &self.connections
    }

    /// Handle one JSON-encoded request
    pub async fn handle_raw(&self, raw: &str) -> Response {
        match parse_request(raw) {
            Ok(request) => self.handle(request).await,
            Err((id, e)) => {
                warn!("Rejected message {:?}: {}", id, e);
                Response::err(id, e.code(), e.to_string())
            }
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let started = Instant::now();
        let Request { id, kind, payload } = request;
        let context = failure_context(kind, &payload);

        let response = match self.dispatch(kind, payload).await {
            Ok(Reply::Data(value)) => Response::ok(id, value),
            Ok(Reply::Rejected(error, value)) => {
                debug!("{} {} returned query error {}", kind, id, error.code);
                Response::err(id, "QUERY_ERROR", format!("{}: {}", context, error.message))
                    .with_data(value)
            }
            Err(e) => {
                warn!("{} {} failed: {}", kind, id, e);
                Response::err(id, e.code(), format!("{}: {}", context, e))
            }
        };

        debug!(
            "{} {} handled in {}ms (success={})",
            kind,
            response.id,
            started.elapsed().as_millis(),
            response.success
        );
        response
    }

    async fn dispatch(&self, kind: MessageType, payload: Value) -> Result<Reply> {
        let service = &self.connections;

        match kind {
            MessageType::ListConnections => {
                let live: HashSet<String> = service.connected_ids().await.into_iter().collect();
                let mut listed = Vec::new();
                for config in service.list_connections().await {
                    let connected = live.contains(&config.id);
                    let mut value = serde_json::to_value(config).map_err(DataError::from)?;
                    if let Some(object) = value.as_object_mut() {
                        object.insert("connected".to_string(), Value::Bool(connected));
                    }
                    listed.push(value);
                }
                data(listed)
            }
            MessageType::AddConnection => {
                let p: ConfigPayload = parse(kind, payload)?;
                data(service.add_connection(p.config).await?)
            }
            MessageType::UpdateConnection => {
                let p: ConfigPayload = parse(kind, payload)?;
                data(service.update_connection(p.config).await?)
            }
            MessageType::RemoveConnection => {
                let p: ConnectionTarget = parse(kind, payload)?;
                service.remove_connection(&p.connection_id).await?;
                data(json!({ "connectionId": p.connection_id }))
            }
            MessageType::TestConnection => {
                let p: ConfigPayload = parse(kind, payload)?;
                if service.test_connection(&p.config).await? {
                    data(json!({ "connected": true }))
                } else {
                    Err(DataError::ConnectionFailed(format!(
                        "connection test failed for {}",
                        p.config.display_string()
                    ))
                    .into())
                }
            }
            MessageType::ParseConnectionUri => {
                let p: UriPayload = parse(kind, payload)?;
                data(ConnectionConfig::from_uri(&p.uri)?)
            }

            MessageType::Connect => {
                let p: ConnectionTarget = parse(kind, payload)?;
                service.connect(&p.connection_id).await?;
                data(json!({ "connectionId": p.connection_id, "connected": true }))
            }
            MessageType::Disconnect => {
                let p: ConnectionTarget = parse(kind, payload)?;
                service.disconnect(&p.connection_id).await?;
                data(json!({ "connectionId": p.connection_id, "connected": false }))
            }

            MessageType::ExecuteQuery => {
                let p: QueryPayload = parse(kind, payload)?;
                let adapter = service.adapter(&p.connection_id).await?;
                let result = adapter.execute_query(&p.query, p.params).await?;
                if classify_statement(&p.query, READ_KEYWORDS) == StatementKind::Write {
                    service.invalidate_schema(&p.connection_id).await;
                }
                query_reply(result)
            }

            MessageType::GetSchema => {
                let p: ConnectionTarget = parse(kind, payload)?;
                data(service.adapter(&p.connection_id).await?.get_schema().await?)
            }
            MessageType::GetTables => {
                let p: ConnectionTarget = parse(kind, payload)?;
                data(service.tables(&p.connection_id).await?)
            }
            MessageType::GetColumns => {
                let p: TablePayload = parse(kind, payload)?;
                let adapter = service.adapter(&p.connection_id).await?;
                data(adapter.get_columns(&p.table).await?)
            }
            MessageType::GetIndexes => {
                let p: TablePayload = parse(kind, payload)?;
                let adapter = service.adapter(&p.connection_id).await?;
                data(adapter.get_indexes(&p.table).await?)
            }
            MessageType::GetPrimaryKey => {
                let p: TablePayload = parse(kind, payload)?;
                let adapter = service.adapter(&p.connection_id).await?;
                data(adapter.get_primary_key(&p.table).await?)
            }
            MessageType::GetTableData => {
                let p: TableDataPayload = parse(kind, payload)?;
                let adapter = service.adapter(&p.connection_id).await?;
                data(adapter.get_table_data(&p.table, p.limit, p.offset).await?)
            }
            MessageType::GetViews => {
                let p: ConnectionTarget = parse(kind, payload)?;
                data(service.adapter(&p.connection_id).await?.get_views().await?)
            }
            MessageType::GetViewDefinition => {
                let p: ViewPayload = parse(kind, payload)?;
                let adapter = service.adapter(&p.connection_id).await?;
                let definition = adapter.get_view_definition(&p.view).await?;
                data(json!({ "view": p.view, "definition": definition }))
            }
            MessageType::GetStoredProcedures => {
                let p: ConnectionTarget = parse(kind, payload)?;
                let adapter = service.adapter(&p.connection_id).await?;
                data(adapter.get_stored_procedures().await?)
            }
            MessageType::GetTriggers => {
                let p: OptionalTablePayload = parse(kind, payload)?;
                let adapter = service.adapter(&p.connection_id).await?;
                data(adapter.get_triggers(p.table.as_deref()).await?)
            }
            MessageType::GetUsers => {
                let p: ConnectionTarget = parse(kind, payload)?;
                data(service.adapter(&p.connection_id).await?.get_users().await?)
            }
            MessageType::GetRoles => {
                let p: ConnectionTarget = parse(kind, payload)?;
                data(service.adapter(&p.connection_id).await?.get_roles().await?)
            }
            MessageType::GetVersion => {
                let p: ConnectionTarget = parse(kind, payload)?;
                let version = service.adapter(&p.connection_id).await?.get_version().await?;
                data(json!({ "version": version }))
            }

            MessageType::InsertRow => {
                let p: InsertRowPayload = parse(kind, payload)?;
                let adapter = service.adapter(&p.connection_id).await?;
                let result = adapter.insert_row(&p.table, p.values).await?;
                service.invalidate_schema(&p.connection_id).await;
                query_reply(result)
            }
            MessageType::UpdateRow => {
                let p: UpdateRowPayload = parse(kind, payload)?;
                let adapter = service.adapter(&p.connection_id).await?;
                let result = adapter.update_row(&p.table, p.primary_key, p.values).await?;
                service.invalidate_schema(&p.connection_id).await;
                query_reply(result)
            }
            MessageType::DeleteRow => {
                let p: DeleteRowPayload = parse(kind, payload)?;
                let adapter = service.adapter(&p.connection_id).await?;
                let result = adapter.delete_row(&p.table, p.primary_key).await?;
                service.invalidate_schema(&p.connection_id).await;
                query_reply(result)
            }

            MessageType::BeginTransaction => {
                let p: ConnectionTarget = parse(kind, payload)?;
                service.adapter(&p.connection_id).await?.begin_transaction().await?;
                Ok(Reply::Data(Value::Null))
            }
            MessageType::Commit => {
                let p: ConnectionTarget = parse(kind, payload)?;
                service.adapter(&p.connection_id).await?.commit().await?;
                service.invalidate_schema(&p.connection_id).await;
                Ok(Reply::Data(Value::Null))
            }
            MessageType::Rollback => {
                let p: ConnectionTarget = parse(kind, payload)?;
                service.adapter(&p.connection_id).await?.rollback().await?;
                service.invalidate_schema(&p.connection_id).await;
                Ok(Reply::Data(Value::Null))
            }

            MessageType::ExplainQuery => {
                let p: QueryPayload = parse(kind, payload)?;
                let adapter = service.adapter(&p.connection_id).await?;
                data(adapter.explain_query(&p.query).await?)
            }
            MessageType::GetDatabaseCapabilities => {
                let p: ConnectionTarget = parse(kind, payload)?;
                data(service.capabilities(&p.connection_id).await?)
            }
        }
    }
}
