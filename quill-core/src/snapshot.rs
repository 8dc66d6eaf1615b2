//! Snapshot blob layout: 4-byte magic, little-endian `u16` format version,
//! then the bincode body.

use serde::{Deserialize, Serialize};

use crate::document::{Block, DeleteMark, PendingOp};
use crate::error::DocumentError;
use crate::id::StateVector;

pub const SNAPSHOT_MAGIC: &[u8; 4] = b"QSNP";
pub const SNAPSHOT_VERSION: u16 = 1;

const HEADER_LEN: usize = 6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SnapshotBody {
    pub blocks: Vec<Block>,
    pub deletes: Vec<DeleteMark>,
    pub pending: Vec<PendingOp>,
    pub state: StateVector,
}

pub(crate) fn encode(body: &SnapshotBody) -> Result<Vec<u8>, DocumentError> {
    let encoded = bincode::serde::encode_to_vec(body, bincode::config::standard())
        .map_err(|e| DocumentError::Encode(e.to_string()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + encoded.len());
    out.extend_from_slice(SNAPSHOT_MAGIC);
    out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    out.extend_from_slice(&encoded);
    Ok(out)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<SnapshotBody, DocumentError> {
    let version = format_version(bytes)?;
    if version != SNAPSHOT_VERSION {
        return Err(DocumentError::UnsupportedSnapshot { version });
    }
    let (body, _) =
        bincode::serde::decode_from_slice(&bytes[HEADER_LEN..], bincode::config::standard())
            .map_err(|e| DocumentError::Decode(e.to_string()))?;
    Ok(body)
}

/// Format version of a snapshot blob, without decoding the body.
pub fn format_version(bytes: &[u8]) -> Result<u16, DocumentError> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != SNAPSHOT_MAGIC {
        return Err(DocumentError::Decode("not a document snapshot".to_string()));
    }
    Ok(u16::from_le_bytes([bytes[4], bytes[5]]))
}
