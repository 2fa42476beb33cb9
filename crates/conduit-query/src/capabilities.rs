//! Capability negotiation: derives what a caller may offer for a connected adapter.

use crate::config::{DatabaseFamily, DatabaseType};
use crate::traits::DatabaseAdapter;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Query language an adapter accepts in `execute_query`
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryLanguage {
    Sql,
    Json,
    Cypher,
    Plaintext,
    Cql,
}

impl QueryLanguage {
    pub fn for_database(db_type: DatabaseType) -> Self {
        match db_type.family() {
            DatabaseFamily::Relational => QueryLanguage::Sql,
            DatabaseFamily::Document | DatabaseFamily::Search => QueryLanguage::Json,
            DatabaseFamily::Graph => QueryLanguage::Cypher,
            DatabaseFamily::KeyValue => QueryLanguage::Plaintext,
            DatabaseFamily::WideColumn => QueryLanguage::Cql,
        }
    }

    /// Editor language identifier for syntax highlighting
    pub fn editor_language_id(&self) -> &'static str {
        match self {
            QueryLanguage::Sql => "sql",
            QueryLanguage::Json => "json",
            QueryLanguage::Cypher => "cypher",
            QueryLanguage::Plaintext => "plaintext",
            QueryLanguage::Cql => "sql",
        }
    }
}

impl fmt::Display for QueryLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryLanguage::Sql => write!(f, "sql"),
            QueryLanguage::Json => write!(f, "json"),
            QueryLanguage::Cypher => write!(f, "cypher"),
            QueryLanguage::Plaintext => write!(f, "plaintext"),
            QueryLanguage::Cql => write!(f, "cql"),
        }
    }
}

fn placeholder_text(db_type: DatabaseType, language: QueryLanguage) -> &'static str {
    match (db_type, language) {
        (DatabaseType::Elasticsearch, _) => {
            r#"{ "index": "my-index", "query": { "match_all": {} } }"#
        }
        (_, QueryLanguage::Sql) => "SELECT * FROM table_name LIMIT 100;",
        (_, QueryLanguage::Json) => r#"{ "collection": "users", "filter": {} }"#,
        (_, QueryLanguage::Cypher) => "MATCH (n) RETURN n LIMIT 25",
        (_, QueryLanguage::Plaintext) => "GET mykey",
        (_, QueryLanguage::Cql) => "SELECT * FROM keyspace.table_name LIMIT 100;",
    }
}

/// Read-only snapshot of what a connected adapter supports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseCapabilities {
    pub database_type: DatabaseType,
    pub query_language: QueryLanguage,
    pub editor_language_id: String,
    pub placeholder_text: String,
    pub label: String,
    pub supports_explain: bool,
    pub supports_transactions: bool,
    pub supports_sql_lint: bool,
    pub supports_sql_format: bool,
    pub supports_stored_procedures: bool,
    pub supports_triggers: bool,
    pub supports_views: bool,
    pub supports_multi_statement: bool,
}

impl DatabaseCapabilities {
    /// Derive capabilities from the adapter's declared operations.
    ///
    /// Never consults a per-backend table for the `supports_*` flags; those
    /// follow the adapter's own [`crate::AdapterCapabilities`].
    pub fn negotiate(adapter: &dyn DatabaseAdapter) -> Self {
        let db_type = adapter.database_type();
        let language = QueryLanguage::for_database(db_type);
        let declared = adapter.capabilities();
        let is_sql = language == QueryLanguage::Sql;

        Self {
            database_type: db_type,
            query_language: language,
            editor_language_id: language.editor_language_id().to_string(),
            placeholder_text: placeholder_text(db_type, language).to_string(),
            label: format!("{} Query", db_type.label()),
            supports_explain: declared.explain,
            supports_transactions: declared.transactions,
            supports_sql_lint: is_sql,
            supports_sql_format: is_sql,
            supports_stored_procedures: declared.stored_procedures,
            supports_triggers: declared.triggers,
            supports_views: declared.views,
            supports_multi_statement: declared.multi_statement,
        }
    }
}
