//! # quill-collab: real-time collaboration around a quill-core document
//!
//! Connects replicated documents over WebSocket, tracks who is editing where,
//! and keeps an editor widget in step with the shared text.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      WebSocket       ┌──────────────┐
//! │ Session      │ ◄──────────────────► │ RelayServer  │
//! │ (per attach) │   SyncMessage frames │ (rendezvous) │
//! └──────┬───────┘                      └──────┬───────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌──────────────┐                      ┌──────────────┐
//! │ Document     │                      │ Document     │
//! │ Awareness    │                      │ Awareness    │
//! │ Binding      │                      │ (per room)   │
//! └──────┬───────┘                      └──────┬───────┘
//!        ▼                                     ▼
//!   EditorWidget                        BroadcastGroup ──► other peers
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: versioned binary envelope
//! - [`awareness`]: ephemeral presence with last-writer-wins and expiry
//! - [`transport`]: reconnecting WebSocket client with jittered backoff
//! - [`supervisor`]: connection state, heartbeat RTT, awareness sweeps
//! - [`binding`]: widget adapter with echo suppression
//! - [`presence`]: remote cursors and the online-user list
//! - [`session`]: session loop, handle and registry
//! - [`broadcast`], [`server`]: relay rooms and fan-out
//! - [`storage`]: snapshot persistence boundary

pub mod awareness;
pub mod binding;
pub mod broadcast;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod supervisor;
pub mod transport;

pub use awareness::{AwarenessConfig, AwarenessEntry, AwarenessFields, AwarenessStore, Selection, UserInfo};
pub use binding::{EchoGuard, EditorBinding, EditorWidget, HeadlessWidget, RenderedCursor};
pub use broadcast::{BroadcastGroup, BroadcastStats, PeerInfo, RoomManager};
pub use presence::{palette_color, CursorColor, CursorRenderData, PresenceSurface, PALETTE};
pub use protocol::{AwarenessPayload, MessageKind, ProtocolError, SyncMessage, PROTOCOL_VERSION};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use session::{
    LocalUser, Session, SessionConfig, SessionError, SessionEvent, SessionHandle, SessionParams,
    SessionRegistry,
};
pub use storage::{
    MemorySnapshotStore, RocksSnapshotStore, SnapshotMetadata, SnapshotStore, StoreConfig, StoreError,
    StoredSnapshot,
};
pub use supervisor::{ConnectionState, ConnectionStatus, ConnectionSupervisor, SupervisorConfig};
pub use transport::{BackoffConfig, TransportConfig, TransportError, TransportEvent, TransportHandle};
