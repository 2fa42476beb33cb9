//! # conduit-query
//!
//! Core abstractions for operating heterogeneous data stores through one contract.
//!
//! Backends (SQLite, PostgreSQL, Redis, ...) each provide a [`DatabaseAdapter`]
//! and an [`AdapterBuilder`]. The [`AdapterFactory`] keeps at most one adapter
//! per connection id, and [`DatabaseCapabilities::negotiate`] tells callers which
//! optional operations a connected adapter offers.
//!
//! ## Architecture
//!
//! - **DatabaseAdapter**: mandatory lifecycle, query and introspection operations,
//!   plus optional operations (views, triggers, transactions, explain, ...) whose
//!   default implementations report `OperationNotSupported`
//! - **AdapterCapabilities**: flags each adapter declares for the optional
//!   operations it overrides
//! - **AdapterFactory**: process-wide `id -> adapter` table
//! - **plan**: table-driven normalization of native plan text into [`PlanNode`]s
//! - **sql**: statement classification and row-level statement builders
//!
//! ## Example
//!
//! ```rust
//! use conduit_query::{AdapterFactory, ConnectionConfig, DatabaseType};
//!
//! # async fn example() -> conduit_query::Result<()> {
//! let factory = AdapterFactory::new();
//! // factory.register_builder(Arc::new(SqliteBuilder)).await;
//!
//! let config = ConnectionConfig::new("local", DatabaseType::Sqlite)
//!     .with_id("c1")
//!     .with_filename("/tmp/app.db");
//! config.validate()?;
//!
//! // let adapter = factory.create(config).await?;
//! // adapter.connect().await?;
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod config;
pub mod error;
pub mod factory;
pub mod plan;
pub mod sql;
pub mod traits;
pub mod types;
mod uri;

pub use capabilities::{DatabaseCapabilities, QueryLanguage};
pub use config::{ConnectionConfig, ConnectionSecrets, DatabaseFamily, DatabaseType};
pub use error::{DataError, Result};
pub use factory::{AdapterBuilder, AdapterFactory};
pub use sql::{classify_statement, PlaceholderStyle, SqlDialect, StatementKind};
pub use traits::{AdapterCapabilities, DatabaseAdapter};
pub use types::{
    ColumnInfo, DataRow, DatabaseSchema, ExplainResult, ForeignKeyInfo, IndexInfo, PlanNode,
    QueryError, QueryResult, ResultColumn, RoleInfo, SchemaInfo, StoredProcedureInfo, TableData,
    TableInfo, TriggerInfo, UserInfo, ViewInfo,
};
