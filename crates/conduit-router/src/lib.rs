//! # conduit-router
//!
//! Typed request/response protocol over the connection registry.
//!
//! Requests are `{id, type, payload}` envelopes; every one of them, including
//! malformed input, produces exactly one `{id, success, data?, error?, errorCode?}`
//! response from [`MessageRouter`].

mod error;
mod message;
mod router;

pub use error::{Result, RouterError};
pub use message::{MessageType, Request, Response, DEFAULT_PAGE_SIZE};
pub use router::MessageRouter;
