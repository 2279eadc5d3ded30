//! In-memory document cache.
//!
//! Holds the latest committed snapshot of every document. Entries are
//! `Arc<Document>` values swapped whole under a write lock, so a reader
//! sees either the previous document or the new one, never a mix.
//!
//! Only the hub writes to the cache after startup.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::model::Document;
use crate::storage::DocumentStore;

#[derive(Default)]
pub struct DocumentCache {
    entries: RwLock<HashMap<String, Arc<Document>>>,
}

impl DocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate from the store. Must finish before the hub takes traffic.
    ///
    /// Returns the number of documents loaded.
    pub async fn load(&self, store: &DocumentStore) -> Result<usize, StoreError> {
        let docs = store.list_documents(None)?;
        let count = docs.len();

        let mut entries = self.entries.write().await;
        entries.clear();
        for doc in docs {
            entries.insert(doc.id.clone(), Arc::new(doc));
        }

        log::info!("Document cache loaded {count} documents");
        Ok(count)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Document>> {
        self.entries.read().await.get(id).cloned()
    }

    /// Unconditional overwrite.
    pub async fn put(&self, doc: Document) -> Arc<Document> {
        let doc = Arc::new(doc);
        self.entries
            .write()
            .await
            .insert(doc.id.clone(), doc.clone());
        doc
    }

    /// Every cached document, most recently updated first.
    pub async fn snapshot_all(&self) -> Vec<Arc<Document>> {
        let mut docs: Vec<Arc<Document>> = self.entries.read().await.values().cloned().collect();
        docs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        docs
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
