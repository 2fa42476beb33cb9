use conduit_query::DataError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    /// Not a JSON object with a string `id` and `type`
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// Payload does not match the shape the message type expects
    #[error("Invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error(transparent)]
    Data(#[from] DataError),
}

impl RouterError {
    pub fn code(&self) -> &'static str {
        match self {
            RouterError::Malformed(_) => "INVALID_MESSAGE",
            RouterError::UnknownType(_) => "UNKNOWN_MESSAGE_TYPE",
            RouterError::InvalidPayload { .. } => "INVALID_PAYLOAD",
            RouterError::Data(e) => e.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
