//! Error taxonomy shared by the store, the hub, and both transports.
//!
//! - [`StoreError`]: everything the durable store can report; the hub
//!   forwards these unchanged so the transport can map them.
//! - [`DeliveryError`]: a single connection failed to take a broadcast.
//!   Never surfaced to the submitting client.
//! - [`ProtocolError`]: malformed frames and connection-level failures.

use thiserror::Error;

/// Durable store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Malformed or missing input (bad owner, empty id, ...)
    #[error("validation error: {0}")]
    Validation(String),

    /// Referenced document or user does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Editor is not the document owner
    #[error("user {editor_id} may not edit document {document_id}")]
    PermissionDenied {
        document_id: String,
        editor_id: String,
    },

    /// Database unavailable; the caller may retry
    #[error("store unavailable: {0}")]
    Transient(String),

    /// Stored bytes could not be encoded or decoded
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether a retry of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Stable machine-readable kind used on both transports.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Validation(_) => "validation_error",
            StoreError::NotFound(_) => "not_found",
            StoreError::PermissionDenied { .. } => "permission_denied",
            StoreError::Transient(_) => "transient_store_error",
            StoreError::Corrupt(_) => "internal_error",
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Transient(e.to_string())
    }
}

/// Failure to hand an event to one connection.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Outbox is at capacity (client not draining)
    #[error("outbox full")]
    Full,
    /// Connection task has gone away
    #[error("connection closed")]
    Closed,
    /// Socket write did not complete in time
    #[error("send timed out")]
    Timeout,
}

/// Wire-level errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("connection closed")]
    ConnectionClosed,
    /// Connect or handshake did not finish in time
    #[error("connection timeout")]
    Timeout,
}
