//! Synchronization hub: serializes writes per document and fans them out.
//!
//! ```text
//!  apply_edit(doc, content, editor, origin)
//!        │
//!        ▼
//!  ┌──────────────┐  lane(doc).commit   ── one writer per document
//!  │ store.apply  │
//!  │ cache.put    │
//!  └──────┬───────┘
//!         │ take lane(doc).fanout, then release commit
//!         ▼
//!  ┌──────────────┐  next writer may commit now, but cannot
//!  │ broadcast    │  broadcast until this one is done
//!  └──────────────┘
//! ```
//!
//! Writes to different documents never share a lock. Lanes are created on
//! first use and kept for the life of the process.
//!
//! Conflict policy is last-writer-wins on whole content: the second of two
//! concurrent edits gets the next version and replaces the first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::cache::DocumentCache;
use crate::error::{ProtocolError, StoreError};
use crate::model::{ChangeLogEntry, Document};
use crate::protocol::{EncodedFrame, ServerMessage};
use crate::registry::{ConnectionRegistry, Registration};
use crate::storage::DocumentStore;

/// Per-document serialization handles.
#[derive(Default)]
struct WriteLane {
    /// Held while persisting and updating the cache
    commit: Arc<AsyncMutex<()>>,
    /// Held while broadcasting; keeps broadcast order equal to commit order
    fanout: Arc<AsyncMutex<()>>,
}

/// A freshly opened client session.
pub struct Session {
    pub registration: Registration,
    /// Encoded `initial` frame; send before anything from the outbox
    pub initial: EncodedFrame,
}

pub struct SyncHub {
    store: Arc<DocumentStore>,
    cache: Arc<DocumentCache>,
    registry: Arc<ConnectionRegistry>,
    lanes: Mutex<HashMap<String, Arc<WriteLane>>>,
}

impl SyncHub {
    /// Load the cache from the store and return a hub ready for traffic.
    pub async fn start(
        store: Arc<DocumentStore>,
        cache: Arc<DocumentCache>,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self, StoreError> {
        cache.load(&store).await?;
        Ok(Self {
            store,
            cache,
            registry,
            lanes: Mutex::new(HashMap::new()),
        })
    }

    fn lane(&self, document_id: &str) -> Arc<WriteLane> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes
            .entry(document_id.to_string())
            .or_default()
            .clone()
    }

    /// Commit a full-content edit and broadcast it to everyone but `origin`.
    ///
    /// Store errors come back unchanged. Delivery failures are handled by
    /// the registry and never fail the write.
    pub async fn apply_edit(
        &self,
        document_id: &str,
        content: &str,
        editor_id: &str,
        origin_client_id: Option<&str>,
    ) -> Result<Document, StoreError> {
        let lane = self.lane(document_id);

        let commit = lane.commit.clone().lock_owned().await;
        let doc = self.store.apply_update(document_id, content, editor_id)?;
        let doc = self.cache.put(doc).await;

        // Hand over: reserve the broadcast slot before letting the next writer in
        let fanout = lane.fanout.clone().lock_owned().await;
        drop(commit);

        let event = ServerMessage::update(&doc, editor_id, origin_client_id.unwrap_or_default());
        match event.encode() {
            Ok(frame) => {
                let report = self.registry.broadcast(frame, origin_client_id).await;
                log::debug!(
                    "Document {document_id} v{} broadcast to {} connections ({} dropped)",
                    doc.version,
                    report.delivered,
                    report.failed.len()
                );
            }
            Err(e) => log::error!("Failed to encode update for {document_id}: {e}"),
        }
        drop(fanout);

        Ok((*doc).clone())
    }

    /// Create a document, cache it, and announce it to every connection.
    ///
    /// With `id = None` the server generates one. Creation runs through the
    /// document's lane like any edit, so `created` is always broadcast
    /// before the first `update` for the same id.
    pub async fn create_document(
        &self,
        id: Option<&str>,
        title: &str,
        content: &str,
        owner_id: &str,
    ) -> Result<Document, StoreError> {
        let id = match id {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        let lane = self.lane(&id);

        // Two creates for the same id must not both pass the existence check
        let commit = lane.commit.clone().lock_owned().await;
        let doc = self
            .store
            .create_document_with_id(&id, title, content, owner_id)?;
        let doc = self.cache.put(doc).await;

        let fanout = lane.fanout.clone().lock_owned().await;
        drop(commit);

        match (ServerMessage::Created {
            document: (*doc).clone(),
        })
        .encode()
        {
            Ok(frame) => {
                self.registry.broadcast(frame, None).await;
            }
            Err(e) => log::error!("Failed to encode creation of {id}: {e}"),
        }
        drop(fanout);

        log::info!("Document {id} created by {owner_id}");
        Ok((*doc).clone())
    }

    /// Latest committed state, served from the cache.
    pub async fn get_document(&self, id: &str) -> Result<Document, StoreError> {
        match self.cache.get(id).await {
            Some(doc) => Ok((*doc).clone()),
            None => self.store.get_document(id),
        }
    }

    pub fn list_documents(&self, owner_id: Option<&str>) -> Result<Vec<Document>, StoreError> {
        self.store.list_documents(owner_id)
    }

    pub fn changes(&self, document_id: &str) -> Result<Vec<ChangeLogEntry>, StoreError> {
        self.store.changes(document_id)
    }

    /// Register a new connection, then snapshot every document.
    ///
    /// Registering first means an update committed during setup lands in
    /// the outbox even if the snapshot already contains it: a duplicate,
    /// never a gap.
    pub async fn open_session(&self) -> Result<Session, ProtocolError> {
        let registration = self.registry.register().await;

        let documents = self
            .cache
            .snapshot_all()
            .await
            .into_iter()
            .map(|d| (*d).clone())
            .collect();
        let initial = ServerMessage::Initial {
            documents,
            client_id: registration.client_id.clone(),
        }
        .encode();

        match initial {
            Ok(initial) => Ok(Session {
                registration,
                initial,
            }),
            Err(e) => {
                self.registry.unregister(&registration.client_id).await;
                Err(e)
            }
        }
    }

    /// Tear down a session. Idempotent.
    pub async fn close_session(&self, client_id: &str) -> bool {
        self.registry.unregister(client_id).await
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<DocumentCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}
