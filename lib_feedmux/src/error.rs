//! # Feed Errors
//!
//! A single error type shared by every layer of the multiplexer. Each variant
//! maps to one failure class with its own propagation rule:
//!
//! - **Configuration**: rejected synchronously to the caller that sent the bad
//!   request. The session it targeted is untouched.
//! - **Connection**: surfaced as an `error` broadcast plus a status change. The
//!   session stays registered and waits for the transport to reconnect.
//! - **Parse**: a malformed frame. Logged and dropped where it was read.
//! - **SnapshotTimeout**: fails the pending snapshot answer only.
//! - **RequestTimeout**: raised on the client side when no correlated
//!   response arrives in time.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, FeedError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    /// A required configuration field is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Handshake or transport failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// A frame body could not be decoded into rows.
    #[error("parse error: {0}")]
    Parse(String),

    /// Neither the end-token nor the row cap arrived before the deadline.
    #[error("snapshot for provider '{provider_id}' timed out after {timeout_ms}ms")]
    SnapshotTimeout { provider_id: String, timeout_ms: u64 },

    /// No response correlated to the request before the client deadline.
    #[error("request '{request_id}' timed out after {timeout_ms}ms")]
    RequestTimeout { request_id: String, timeout_ms: u64 },

    /// The referenced provider session does not exist.
    #[error("provider '{0}' not found")]
    NotFound(String),

    /// An error response returned by the multiplexer for a correlated request.
    #[error("{kind} error from multiplexer: {message}")]
    Remote { kind: String, message: String },

    /// The other side of an internal channel has gone away.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

impl FeedError {
    /// Stable machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            FeedError::Configuration(_) => "configuration",
            FeedError::Connection(_) => "connection",
            FeedError::Parse(_) => "parse",
            FeedError::SnapshotTimeout { .. } => "snapshotTimeout",
            FeedError::RequestTimeout { .. } => "requestTimeout",
            FeedError::NotFound(_) => "notFound",
            FeedError::Remote { .. } => "remote",
            FeedError::ChannelClosed(_) => "channelClosed",
        }
    }

    /// Wire form carried inside an `error` response.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

/// The `error` payload of a response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl From<ErrorBody> for FeedError {
    fn from(body: ErrorBody) -> Self {
        FeedError::Remote {
            kind: body.kind,
            message: body.message,
        }
    }
}
