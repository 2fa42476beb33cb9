//! # conduit-connections
//!
//! The connection registry: saved configs, their secrets, and the set of live
//! connections.
//!
//! - [`ConnectionService`] validates and persists configs, keeps secrets in a
//!   [`SecretVault`] under `password.<id>`, and on connect creates the SSH
//!   tunnel (if any) and the adapter
//! - [`ConfigStore`] persists redacted configs ([`JsonFileStore`], [`MemoryStore`])
//! - [`SecretVault`] holds secrets ([`EncryptedFileVault`], [`MemoryVault`])
//! - [`SchemaCache`] keeps table listings for 60 seconds

pub mod cache;
pub mod encryption;
pub mod events;
mod files;
pub mod service;
pub mod store;
pub mod vault;

pub use cache::{SchemaCache, SCHEMA_CACHE_TTL};
pub use encryption::EncryptionService;
pub use events::ConnectionEvent;
pub use service::ConnectionService;
pub use store::{ConfigStore, JsonFileStore, MemoryStore, CONNECTIONS_KEY};
pub use vault::{secret_key, EncryptedFileVault, MemoryVault, SecretVault};
