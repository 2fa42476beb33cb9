use thiserror::Error;

/// Unified error type for adapter, tunnel and registry operations
#[derive(Error, Debug)]
pub enum DataError {
    /// Missing or invalid configuration field. Never retried.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Connection failed (authentication, network, etc.)
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// SSH session or local listener could not be established
    #[error("Tunnel failed: {0}")]
    TunnelFailed(String),

    /// Backend rejected a statement
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Operation attempted on an adapter that is not connected
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Operation not supported by this backend
    #[error("Operation not supported: {0}")]
    OperationNotSupported(String),

    /// Connection, table or other object not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Secret vault failure
    #[error("Secret store error: {0}")]
    SecretStore(String),

    /// Persistent config store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DataError {
    /// Stable machine-readable code carried in response envelopes
    pub fn code(&self) -> &'static str {
        match self {
            DataError::InvalidConfiguration(_) => "CONFIG_ERROR",
            DataError::ConnectionFailed(_) => "CONNECTION_ERROR",
            DataError::TunnelFailed(_) => "TUNNEL_ERROR",
            DataError::QueryFailed(_) => "QUERY_ERROR",
            DataError::NotConnected(_) => "NOT_CONNECTED",
            DataError::OperationNotSupported(_) => "NOT_SUPPORTED",
            DataError::NotFound(_) => "NOT_FOUND",
            DataError::SecretStore(_) => "SECRET_STORE_ERROR",
            DataError::Storage(_) => "STORAGE_ERROR",
            DataError::Serialization(_) => "SERIALIZATION_ERROR",
            DataError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        DataError::NotFound(msg.into())
    }

    pub fn operation_not_supported(msg: impl Into<String>) -> Self {
        DataError::OperationNotSupported(msg.into())
    }

    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        DataError::InvalidConfiguration(msg.into())
    }

    pub fn not_connected(msg: impl Into<String>) -> Self {
        DataError::NotConnected(msg.into())
    }
}

impl From<serde_json::Error> for DataError {
    fn from(e: serde_json::Error) -> Self {
        DataError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DataError>;
