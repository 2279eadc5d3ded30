//! Durable storage for documents and their change log.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  apply_update   ┌──────────────────────────────────┐
//! │  SyncHub    │ ──────────────► │ DocumentStore (RocksDB)          │
//! │             │                 │                                  │
//! └──────┬──────┘                 │ CF "documents": id → Document    │
//!        │ on startup             │ CF "changelog": seq → entry      │
//!        ▼                        └──────────────────────────────────┘
//! ┌─────────────┐
//! │ Doc cache   │  (loaded once from list_documents)
//! └─────────────┘
//! ```
//!
//! Values are bincode-encoded and LZ4-compressed (see [`record`]).
//! The change log is audit-only; current state is always the document row.

pub mod record;
pub mod rocks;

pub use rocks::{DocumentStore, StoreConfig};
