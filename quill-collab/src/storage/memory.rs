use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{SnapshotStore, StoreError};

/// In-process snapshot store. Contents are lost with the process.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    documents: RwLock<HashMap<String, BTreeMap<u64, Vec<u8>>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents with at least one revision.
    pub fn document_count(&self) -> usize {
        self.documents.read().map(|docs| docs.len()).unwrap_or(0)
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::DatabaseError("snapshot map lock poisoned".to_string())
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, document_id: &str, revision: u64, snapshot: &[u8]) -> Result<(), StoreError> {
        let mut docs = self.documents.write().map_err(poisoned)?;
        let revisions = docs.entry(document_id.to_string()).or_default();
        if let Some((&latest, _)) = revisions.last_key_value() {
            if revision <= latest {
                return Err(StoreError::StaleRevision {
                    document_id: document_id.to_string(),
                    revision,
                    latest,
                });
            }
        }
        revisions.insert(revision, snapshot.to_vec());
        Ok(())
    }

    fn load(&self, document_id: &str, revision: u64) -> Result<Vec<u8>, StoreError> {
        let docs = self.documents.read().map_err(poisoned)?;
        docs.get(document_id)
            .and_then(|revisions| revisions.get(&revision))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                document_id: document_id.to_string(),
                revision: Some(revision),
            })
    }

    fn latest_revision(&self, document_id: &str) -> Result<Option<u64>, StoreError> {
        let docs = self.documents.read().map_err(poisoned)?;
        Ok(docs
            .get(document_id)
            .and_then(|revisions| revisions.last_key_value())
            .map(|(rev, _)| *rev))
    }
}
