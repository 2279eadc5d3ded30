//! # atlas-sync: real-time document synchronization core
//!
//! Keeps many clients editing the same set of text documents consistent.
//! Every edit is committed to RocksDB, swapped into an in-memory cache, and
//! pushed to every other live connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket (JSON)   ┌─────────────┐      ┌─────────────┐
//! │ SyncClient  │ ◄──────────────────► │ SyncServer  │ ───► │             │
//! │ (per user)  │                      └─────────────┘      │   SyncHub   │
//! └─────────────┘      HTTP (JSON)     ┌─────────────┐      │ (per-doc    │
//!      curl ─────────────────────────► │ http router │ ───► │  lanes)     │
//!                                      └─────────────┘      └──┬───┬───┬──┘
//!                                                              │   │   │
//!                                      DocumentStore (RocksDB) ◄┘   │   │
//!                                      DocumentCache ◄──────────────┘   │
//!                                      ConnectionRegistry ◄─────────────┘
//! ```
//!
//! Conflict policy is last-writer-wins on whole content. Only the document
//! owner may edit.
//!
//! ## Modules
//!
//! - [`storage`]: durable store (documents + change log)
//! - [`cache`]: latest committed snapshot of every document
//! - [`registry`]: live connections and best-effort fan-out
//! - [`hub`]: per-document write serialization and broadcast
//! - [`protocol`]: JSON wire messages
//! - [`server`]: WebSocket transport
//! - [`http`]: request/response transport
//! - [`client`]: WebSocket sync client
//! - [`identity`]: user lookup
//! - [`config`]: environment configuration

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod hub;
pub mod identity;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use cache::DocumentCache;
pub use client::{ConnectionState, PendingEdit, SyncClient, SyncEvent};
pub use config::{ConfigError, ServerConfig};
pub use error::{DeliveryError, ProtocolError, StoreError};
pub use http::{ApiError, ApiState, router};
pub use hub::{Session, SyncHub};
pub use identity::{IdentityProvider, USER_HEADER, UserDirectory};
pub use model::{ChangeLogEntry, ChangeOp, Document};
pub use protocol::{ClientMessage, EncodedFrame, ServerMessage};
pub use registry::{
    BroadcastReport, ConnectionInfo, ConnectionRegistry, Outbox, Registration, RegistryStats,
};
pub use server::{ServerStats, SyncServer};
pub use storage::{DocumentStore, StoreConfig};
