//! JSON wire protocol for the persistent-connection transport.
//!
//! Every frame is a WebSocket text message holding one JSON object.
//!
//! Client → server (edit submission):
//! ```text
//! {"document_id": "...", "content": "...", "client_id": "...", "user_id": "..."}
//! ```
//!
//! Server → client, tagged by `type`:
//! ```text
//! initial  {documents: [...], client_id}        first frame on every connection
//! update   {document_id, content, sender_id,    someone else's committed edit
//!           user_id, version, timestamp}
//! created  {document}                            a new document exists
//! ack      {document_id, version, timestamp}    your edit was committed
//! error    {document_id, error, message}        your edit was rejected
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ProtocolError, StoreError};
use crate::model::Document;

/// A frame encoded once and shared by every recipient.
pub type EncodedFrame = Arc<str>;

/// Edit submission from a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub document_id: String,
    pub content: String,
    /// Informational; the server always uses the id it assigned
    #[serde(default)]
    pub client_id: String,
    pub user_id: String,
}

impl ClientMessage {
    pub fn new(
        document_id: impl Into<String>,
        content: impl Into<String>,
        client_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            content: content.into(),
            client_id: client_id.into(),
            user_id: user_id.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Initial {
        documents: Vec<Document>,
        client_id: String,
    },
    Update {
        document_id: String,
        content: String,
        /// Client id of the connection that submitted the edit
        sender_id: String,
        /// Editor identity
        user_id: String,
        version: u64,
        timestamp: u64,
    },
    Created {
        document: Document,
    },
    Ack {
        document_id: String,
        version: u64,
        timestamp: u64,
    },
    Error {
        document_id: Option<String>,
        error: String,
        message: String,
    },
}

impl ServerMessage {
    /// Broadcast frame for a committed edit.
    pub fn update(doc: &Document, editor_id: &str, origin_client_id: &str) -> Self {
        ServerMessage::Update {
            document_id: doc.id.clone(),
            content: doc.content.clone(),
            sender_id: origin_client_id.to_string(),
            user_id: editor_id.to_string(),
            version: doc.version,
            timestamp: doc.updated_at,
        }
    }

    pub fn ack(doc: &Document) -> Self {
        ServerMessage::Ack {
            document_id: doc.id.clone(),
            version: doc.version,
            timestamp: doc.updated_at,
        }
    }

    pub fn rejected(document_id: Option<&str>, err: &StoreError) -> Self {
        ServerMessage::Error {
            document_id: document_id.map(str::to_string),
            error: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn malformed(err: &ProtocolError) -> Self {
        ServerMessage::Error {
            document_id: None,
            error: "validation_error".to_string(),
            message: err.to_string(),
        }
    }

    pub fn encode(&self) -> Result<EncodedFrame, ProtocolError> {
        serde_json::to_string(self)
            .map(Arc::from)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}
