//! Documents and change-log records.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A versioned text resource with a single owner.
///
/// `version` starts at 1 and grows by exactly one per accepted update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    pub owner_id: String,
    pub version: u64,
    /// Creation time (ms since epoch)
    pub created_at: u64,
    /// Last accepted write (ms since epoch)
    pub updated_at: u64,
}

impl Document {
    /// A fresh document at version 1.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            owner_id: owner_id.into(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// The next version of this document carrying `content`.
    ///
    /// `updated_at` never moves backwards even if the wall clock does.
    pub fn with_content(&self, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            version: self.version + 1,
            updated_at: now_millis().max(self.updated_at),
            ..self.clone()
        }
    }
}

/// Kind of change recorded in the log. Only updates are produced today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Update,
}

/// Immutable audit record of one accepted update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub id: String,
    pub document_id: String,
    pub op: ChangeOp,
    /// Content snapshot after the update
    pub content: String,
    pub editor_id: String,
    /// Document version produced by this update
    pub version: u64,
    pub timestamp: u64,
}

impl ChangeLogEntry {
    /// Audit record for the update that produced `doc`.
    pub fn update(doc: &Document, editor_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: doc.id.clone(),
            op: ChangeOp::Update,
            content: doc.content.clone(),
            editor_id: editor_id.into(),
            version: doc.version,
            timestamp: doc.updated_at,
        }
    }
}
