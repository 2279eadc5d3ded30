//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`: one row per document, keyed by the UTF-8 document id
//! - `changelog`: append-only audit entries, keyed by document then version
//!   (`u32` id length, id bytes, `u64` version, all big-endian), so one
//!   document's history is a contiguous range in commit order
//!
//! An update writes the document row and its change-log entry in one
//! `WriteBatch`, so a crash never leaves one without the other.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use super::record;
use crate::error::StoreError;
use crate::identity::IdentityProvider;
use crate::model::{ChangeLogEntry, Document};

const CF_DOCUMENTS: &str = "documents";
const CF_CHANGELOG: &str = "changelog";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_CHANGELOG];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("atlas_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// RocksDB-backed document store.
///
/// Owner validation on create is delegated to the [`IdentityProvider`];
/// edit permission is plain equality with the stored owner.
///
/// `apply_update` is a read-modify-write. Callers that may race on the
/// same document must serialize (the hub does, per document).
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    identity: Arc<dyn IdentityProvider>,
}

impl DocumentStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(
        config: StoreConfig,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            identity,
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Point lookups by id; values are already LZ4 compressed
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_CHANGELOG => {
                // Appends per document, read as one range
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Create a document with a server-generated id.
    pub fn create_document(
        &self,
        title: &str,
        content: &str,
        owner_id: &str,
    ) -> Result<Document, StoreError> {
        self.create_document_with_id(&Uuid::new_v4().to_string(), title, content, owner_id)
    }

    /// Create a document with a caller-chosen id.
    ///
    /// Fails with `Validation` if the owner is not an active user, the id is
    /// empty, or the id is already taken.
    pub fn create_document_with_id(
        &self,
        id: &str,
        title: &str,
        content: &str,
        owner_id: &str,
    ) -> Result<Document, StoreError> {
        if id.trim().is_empty() {
            return Err(StoreError::Validation("document id must not be empty".into()));
        }
        if owner_id.trim().is_empty() {
            return Err(StoreError::Validation("owner_id is required".into()));
        }
        if !self.identity.is_active_user(owner_id) {
            return Err(StoreError::Validation(format!(
                "owner {owner_id} is not an active user"
            )));
        }
        if self.document_exists(id)? {
            return Err(StoreError::Validation(format!("document {id} already exists")));
        }

        let doc = Document::new(id, title, content, owner_id);
        let cf = self.cf(CF_DOCUMENTS)?;
        self.db
            .put_cf_opt(&cf, id.as_bytes(), record::encode(&doc)?, &self.write_options())?;

        log::debug!("Created document {id} for owner {owner_id}");
        Ok(doc)
    }

    /// Load one document.
    pub fn get_document(&self, id: &str) -> Result<Document, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => record::decode(&bytes),
            None => Err(StoreError::NotFound(format!("document {id}"))),
        }
    }

    /// Check if a document exists.
    pub fn document_exists(&self, id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        Ok(self.db.get_cf(&cf, id.as_bytes())?.is_some())
    }

    /// All documents, optionally restricted to one owner, most recently
    /// updated first.
    pub fn list_documents(&self, owner_id: Option<&str>) -> Result<Vec<Document>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut docs = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            let doc: Document = record::decode(&value)?;
            if owner_id.is_none_or(|owner| doc.owner_id == owner) {
                docs.push(doc);
            }
        }

        docs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(docs)
    }

    /// Replace a document's content, bump its version, and log the change.
    ///
    /// The document row and the change-log entry go out in one batch. If the
    /// entry cannot be encoded the document is still written and the failure
    /// is only logged: the log is audit data and never blocks a write.
    pub fn apply_update(
        &self,
        id: &str,
        content: &str,
        editor_id: &str,
    ) -> Result<Document, StoreError> {
        let current = self.get_document(id)?;
        if current.owner_id != editor_id {
            return Err(StoreError::PermissionDenied {
                document_id: id.to_string(),
                editor_id: editor_id.to_string(),
            });
        }

        let updated = current.with_content(content);

        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_log = self.cf(CF_CHANGELOG)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, id.as_bytes(), record::encode(&updated)?);

        let entry = ChangeLogEntry::update(&updated, editor_id);
        match record::encode(&entry) {
            Ok(bytes) => {
                batch.put_cf(&cf_log, changelog_key(id, updated.version), bytes);
            }
            Err(e) => {
                log::error!("Failed to append change log for document {id}: {e}");
            }
        }

        self.db.write_opt(batch, &self.write_options())?;

        log::debug!(
            "Committed document {id} at version {} by {editor_id}",
            updated.version
        );
        Ok(updated)
    }

    // ─── Change log ───────────────────────────────────────────────────

    /// Change-log entries for one document, in commit order.
    pub fn changes(&self, document_id: &str) -> Result<Vec<ChangeLogEntry>, StoreError> {
        if !self.document_exists(document_id)? {
            return Err(StoreError::NotFound(format!("document {document_id}")));
        }

        let cf = self.cf(CF_CHANGELOG)?;
        let prefix = changelog_prefix(document_id);
        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix.as_slice(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_slice()) {
                break;
            }
            entries.push(record::decode(&value)?);
        }
        Ok(entries)
    }

    /// Flush memtables of every column family to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Transient(format!("column family '{name}' not found")))
    }
}

/// Length-prefixed so no id is a prefix of another id's range.
fn changelog_prefix(document_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + document_id.len() + 8);
    key.extend_from_slice(&(document_id.len() as u32).to_be_bytes());
    key.extend_from_slice(document_id.as_bytes());
    key
}

fn changelog_key(document_id: &str, version: u64) -> Vec<u8> {
    let mut key = changelog_prefix(document_id);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
