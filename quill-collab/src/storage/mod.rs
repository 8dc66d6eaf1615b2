//! Snapshot persistence boundary.
//!
//! Sessions and relay rooms load the latest snapshot of a document when they
//! start and save a new revision when they end. The store keeps the exported
//! blob verbatim; it never looks inside.
//!
//! ```text
//! ┌──────────────┐   load_latest()   ┌────────────────────────────┐
//! │ Session /    │ ◄──────────────── │ SnapshotStore              │
//! │ relay room   │ ────────────────► │  MemorySnapshotStore       │
//! └──────────────┘   save(rev + 1)   │  RocksSnapshotStore (LZ4)  │
//!                                    └────────────────────────────┘
//! ```

pub mod memory;
pub mod rocks;

pub use memory::MemorySnapshotStore;
pub use rocks::{RocksSnapshotStore, SnapshotMetadata, StoreConfig};

/// A snapshot blob together with its revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub revision: u64,
    pub bytes: Vec<u8>,
}

/// Versioned blob storage keyed by `(document_id, revision)`.
///
/// Revisions start at 1 and must strictly increase per document.
pub trait SnapshotStore: Send + Sync {
    /// Store `snapshot` as `revision` of `document_id`.
    fn save(&self, document_id: &str, revision: u64, snapshot: &[u8]) -> Result<(), StoreError>;

    /// Load one specific revision.
    fn load(&self, document_id: &str, revision: u64) -> Result<Vec<u8>, StoreError>;

    /// Highest stored revision, if any.
    fn latest_revision(&self, document_id: &str) -> Result<Option<u64>, StoreError>;

    /// Load the highest stored revision, if any.
    fn load_latest(&self, document_id: &str) -> Result<Option<StoredSnapshot>, StoreError> {
        match self.latest_revision(document_id)? {
            Some(revision) => Ok(Some(StoredSnapshot {
                revision,
                bytes: self.load(document_id, revision)?,
            })),
            None => Ok(None),
        }
    }

    /// Revision the next save should use.
    fn next_revision(&self, document_id: &str) -> Result<u64, StoreError> {
        Ok(self.latest_revision(document_id)?.map_or(1, |r| r + 1))
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// No such document or revision
    NotFound { document_id: String, revision: Option<u64> },
    /// A newer or equal revision is already stored
    StaleRevision { document_id: String, revision: u64, latest: u64 },
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound { document_id, revision: Some(rev) } => {
                write!(f, "Snapshot not found: {document_id} revision {rev}")
            }
            StoreError::NotFound { document_id, revision: None } => {
                write!(f, "Document not found: {document_id}")
            }
            StoreError::StaleRevision { document_id, revision, latest } => write!(
                f,
                "Revision {revision} of {document_id} is not newer than stored revision {latest}"
            ),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}
