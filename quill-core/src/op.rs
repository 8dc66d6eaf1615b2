//! Operations exchanged between replicas.

use serde::{Deserialize, Serialize};

use crate::error::DocumentError;
use crate::id::{IdRange, OpId};

/// One replicated operation.
///
/// An insert carries a run of characters. Character `i` of the run has id
/// `id.offset(i)`, its left origin is the previous character of the run
/// (or `origin` for the first one), and every character shares
/// `right_origin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert {
        id: OpId,
        origin: Option<OpId>,
        right_origin: Option<OpId>,
        content: String,
    },
    Delete {
        id: OpId,
        targets: Vec<IdRange>,
    },
}

impl Operation {
    /// Id of the first clock this operation consumes.
    pub fn id(&self) -> OpId {
        match self {
            Self::Insert { id, .. } | Self::Delete { id, .. } => *id,
        }
    }

    /// Number of clocks this operation consumes.
    pub fn clock_len(&self) -> u64 {
        match self {
            Self::Insert { content, .. } => content.chars().count() as u64,
            Self::Delete { .. } => 1,
        }
    }
}

/// A batch of operations, the unit of broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub ops: Vec<Operation>,
}

impl Update {
    pub fn new(ops: Vec<Operation>) -> Self {
        Self { ops }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Concatenate two updates. Merge order is irrelevant.
    pub fn extend(&mut self, other: Update) {
        self.ops.extend(other.ops);
    }

    pub fn encode(&self) -> Result<Vec<u8>, DocumentError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| DocumentError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DocumentError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| DocumentError::Decode(e.to_string()))?;
        Ok(update)
    }
}
