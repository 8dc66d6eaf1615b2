//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots` : LZ4-compressed snapshot blobs, keyed by
//!   `<id len: u16 BE><id bytes><revision: u64 BE>`
//! - `metadata` : bincode [`SnapshotMetadata`], keyed by `<id len><id bytes>`
//!
//! Older revisions beyond [`StoreConfig::retained_revisions`] are pruned in
//! the same write batch that stores a new one.

use log::debug;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: true, saves are rare)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// Revisions kept per document, newest first (default: 8)
    pub retained_revisions: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
            retained_revisions: 8,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            retained_revisions: 3,
        }
    }
}

/// Per-document bookkeeping stored next to the snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub document_id: String,
    pub latest_revision: u64,
    /// Revisions currently stored
    pub revision_count: u64,
    /// Uncompressed size of the latest snapshot in bytes
    pub snapshot_size: u64,
    /// Compressed size of the latest snapshot in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl SnapshotMetadata {
    fn new(document_id: &str) -> Self {
        let now = unix_seconds();
        Self {
            document_id: document_id.to_string(),
            latest_revision: 0,
            revision_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// RocksDB-backed [`SnapshotStore`].
pub struct RocksSnapshotStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksSnapshotStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        debug!("Opened snapshot store at {}", config.path.display());

        Ok(Self { db, config })
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
            // Values are already LZ4 frames.
            CF_SNAPSHOTS => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Load document metadata.
    pub fn metadata(&self, document_id: &str) -> Result<SnapshotMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, document_prefix(document_id))? {
            Some(bytes) => SnapshotMetadata::decode(&bytes),
            None => Err(StoreError::NotFound {
                document_id: document_id.to_string(),
                revision: None,
            }),
        }
    }

    /// Stored revisions of a document, ascending.
    pub fn revisions(&self, document_id: &str) -> Result<Vec<u64>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let prefix = document_prefix(document_id);
        let mut revisions = Vec::new();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if key.len() != prefix.len() + 8 || !key.starts_with(&prefix) {
                break;
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&key[prefix.len()..]);
            revisions.push(u64::from_be_bytes(buf));
        }
        Ok(revisions)
    }

    /// Delete a document and all its revisions.
    pub fn delete_document(&self, document_id: &str) -> Result<(), StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        for revision in self.revisions(document_id)? {
            batch.delete_cf(cf_snapshots, snapshot_key(document_id, revision));
        }
        batch.delete_cf(cf_meta, document_prefix(document_id));
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl SnapshotStore for RocksSnapshotStore {
    fn save(&self, document_id: &str, revision: u64, snapshot: &[u8]) -> Result<(), StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = match self.metadata(document_id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound { .. }) => SnapshotMetadata::new(document_id),
            Err(e) => return Err(e),
        };
        if meta.revision_count > 0 && revision <= meta.latest_revision {
            return Err(StoreError::StaleRevision {
                document_id: document_id.to_string(),
                revision,
                latest: meta.latest_revision,
            });
        }

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, snapshot_key(document_id, revision), &compressed);

        let mut revisions = self.revisions(document_id)?;
        revisions.push(revision);
        let keep = self.config.retained_revisions.max(1);
        let excess = revisions.len().saturating_sub(keep);
        for old in &revisions[..excess] {
            batch.delete_cf(cf_snapshots, snapshot_key(document_id, *old));
        }

        meta.latest_revision = revision;
        meta.revision_count = (revisions.len() - excess) as u64;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_seconds();
        batch.put_cf(cf_meta, document_prefix(document_id), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        debug!(
            "Saved {} revision {} ({} -> {} bytes, pruned {})",
            document_id,
            revision,
            snapshot.len(),
            compressed.len(),
            excess
        );
        Ok(())
    }

    fn load(&self, document_id: &str, revision: u64) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, snapshot_key(document_id, revision))? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Err(StoreError::NotFound {
                document_id: document_id.to_string(),
                revision: Some(revision),
            }),
        }
    }

    fn latest_revision(&self, document_id: &str) -> Result<Option<u64>, StoreError> {
        match self.metadata(document_id) {
            Ok(meta) => Ok(Some(meta.latest_revision)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// `<len: u16 BE><id bytes>`, so no id is a prefix of another's keys.
fn document_prefix(document_id: &str) -> Vec<u8> {
    let bytes = document_id.as_bytes();
    let mut key = Vec::with_capacity(2 + bytes.len() + 8);
    key.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    key.extend_from_slice(bytes);
    key
}

fn snapshot_key(document_id: &str, revision: u64) -> Vec<u8> {
    let mut key = document_prefix(document_id);
    key.extend_from_slice(&revision.to_be_bytes());
    key
}
