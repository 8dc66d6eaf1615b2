//! # quill-core: replicated text document for collaborative editing
//!
//! A sequence CRDT holding the shared text of one document. Every character
//! is a block tagged with a unique `(replica, clock)` id and the ids of its
//! left and right neighbours at insertion time. Concurrent inserts are
//! ordered with the YATA rule, deletes leave tombstones, and merges are
//! idempotent and commutative.
//!
//! ```text
//!  local edit                         remote Update
//!      │                                   │
//!      ▼                                   ▼
//! apply_local_insert / delete        merge_remote()
//!      │                                   │
//!      ▼                                   ▼
//! ┌──────────────────────────────────────────────┐
//! │ Document                                      │
//! │   blocks (document order, with tombstones)    │
//! │   delete marks                                │
//! │   state vector   ──► diff() for handshakes    │
//! │   pending ops    (causal gaps)                │
//! └──────────────────────────────────────────────┘
//!      │                                   │
//!      ▼                                   ▼
//!   Update (broadcast)              AppliedDelta (widget edits)
//! ```
//!
//! ## Modules
//!
//! - [`id`]: operation ids, id ranges, state vectors
//! - [`op`]: operations and the `Update` batch codec
//! - [`document`]: the CRDT itself
//! - [`delta`]: widget-facing text edits
//! - [`position`]: offset <-> line/column conversion
//! - [`snapshot`]: versioned snapshot blob

pub mod delta;
pub mod document;
pub mod error;
pub mod id;
pub mod op;
pub mod position;
pub mod snapshot;

pub use delta::{AppliedDelta, TextEdit, diff_texts, minimal_edit};
pub use document::{Document, DocumentConfig};
pub use error::DocumentError;
pub use id::{IdRange, OpId, ReplicaId, StateVector};
pub use op::{Operation, Update};
pub use position::{CursorPosition, offset_at, position_at};
