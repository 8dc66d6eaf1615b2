use crate::id::ReplicaId;

/// Errors raised by the replicated document.
///
/// Merging a well-formed update never fails; only local edits with stale
/// offsets and malformed bytes produce errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// A local edit referenced an offset past the visible text.
    OutOfRange { position: usize, len: usize },
    /// Serialization failed
    Encode(String),
    /// Bytes could not be decoded as an update, state vector or snapshot
    Decode(String),
    /// Snapshot blob has an unknown magic or format version
    UnsupportedSnapshot { version: u16 },
    /// Snapshot already contains operations authored by this replica id
    ReplicaReused(ReplicaId),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfRange { position, len } => {
                write!(f, "Edit position {position} out of range for length {len}")
            }
            Self::Encode(e) => write!(f, "Encode error: {e}"),
            Self::Decode(e) => write!(f, "Decode error: {e}"),
            Self::UnsupportedSnapshot { version } => {
                write!(f, "Unsupported snapshot format version {version}")
            }
            Self::ReplicaReused(id) => {
                write!(f, "Replica id {id} already authored operations in this snapshot")
            }
        }
    }
}

impl std::error::Error for DocumentError {}
