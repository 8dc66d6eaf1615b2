//! Binary envelope for document synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌─────────┬──────┬─────────────┬───────────┬──────────┐
//! │ version │ kind │ document_id │ sender    │ payload  │
//! │ 1 byte  │ enum │ string      │ 16 bytes  │ variable │
//! └─────────┴──────┴─────────────┴───────────┴──────────┘
//! ```
//!
//! | kind              | payload                          |
//! |-------------------|----------------------------------|
//! | `SyncStep1`       | encoded `StateVector`            |
//! | `SyncStep2`       | encoded `Update` (missing ops)   |
//! | `SyncUpdate`      | encoded `Update` (incremental)   |
//! | `AwarenessUpdate` | encoded [`AwarenessPayload`]     |
//! | `Ping` / `Pong`   | 8-byte little-endian nonce       |

use quill_core::{DocumentError, StateVector, Update};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::awareness::AwarenessFields;

/// Current envelope version. Peers speaking another version are rejected.
pub const PROTOCOL_VERSION: u8 = 1;

/// Message kinds multiplexed on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// State vector announcing what the sender has
    SyncStep1 = 1,
    /// Operations the receiver of a step 1 was missing
    SyncStep2 = 2,
    /// Incremental update after the handshake
    SyncUpdate = 3,
    /// Presence state or leave notice
    AwarenessUpdate = 4,
    /// Heartbeat ping
    Ping = 5,
    /// Heartbeat pong echoing the ping nonce
    Pong = 6,
}

/// Awareness payload carried by `AwarenessUpdate` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessPayload {
    State {
        client_id: Uuid,
        /// Sender wall clock, milliseconds since the Unix epoch
        timestamp: u64,
        fields: AwarenessFields,
    },
    Leave {
        client_id: Uuid,
        timestamp: u64,
    },
}

impl AwarenessPayload {
    pub fn client_id(&self) -> Uuid {
        match self {
            Self::State { client_id, .. } | Self::Leave { client_id, .. } => *client_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (payload, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(payload)
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub version: u8,
    pub kind: MessageKind,
    pub document_id: String,
    /// Transient client id of the sender; nil when sent by the relay
    pub sender: Uuid,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(kind: MessageKind, sender: Uuid, document_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            document_id: document_id.into(),
            sender,
            payload,
        }
    }

    /// Create a sync step 1 (state vector announcement).
    pub fn sync_step1(sender: Uuid, document_id: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self::new(MessageKind::SyncStep1, sender, document_id, state_vector)
    }

    /// Create a sync step 2 (missing operations).
    pub fn sync_step2(sender: Uuid, document_id: impl Into<String>, update: Vec<u8>) -> Self {
        Self::new(MessageKind::SyncStep2, sender, document_id, update)
    }

    /// Create an incremental update message.
    pub fn update(sender: Uuid, document_id: impl Into<String>, update: Vec<u8>) -> Self {
        Self::new(MessageKind::SyncUpdate, sender, document_id, update)
    }

    /// Create an awareness update message.
    pub fn awareness(
        sender: Uuid,
        document_id: impl Into<String>,
        payload: &AwarenessPayload,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageKind::AwarenessUpdate,
            sender,
            document_id,
            payload.encode()?,
        ))
    }

    pub fn ping(sender: Uuid, document_id: impl Into<String>, nonce: u64) -> Self {
        Self::new(MessageKind::Ping, sender, document_id, nonce.to_le_bytes().to_vec())
    }

    pub fn pong(sender: Uuid, document_id: impl Into<String>, nonce: u64) -> Self {
        Self::new(MessageKind::Pong, sender, document_id, nonce.to_le_bytes().to_vec())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Reject envelopes of another protocol version or for another document.
    pub fn validate(&self, document_id: &str) -> Result<(), ProtocolError> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                found: self.version,
            });
        }
        if self.document_id != document_id {
            return Err(ProtocolError::DocumentMismatch {
                expected: document_id.to_string(),
                found: self.document_id.clone(),
            });
        }
        Ok(())
    }

    /// Parse the state vector of a step 1.
    pub fn state_vector(&self) -> Result<StateVector, ProtocolError> {
        if self.kind != MessageKind::SyncStep1 {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(StateVector::decode(&self.payload)?)
    }

    /// Parse the update of a step 2 or incremental update.
    pub fn sync_update(&self) -> Result<Update, ProtocolError> {
        if !matches!(self.kind, MessageKind::SyncStep2 | MessageKind::SyncUpdate) {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(Update::decode(&self.payload)?)
    }

    /// Parse awareness payload.
    pub fn awareness_payload(&self) -> Result<AwarenessPayload, ProtocolError> {
        if self.kind != MessageKind::AwarenessUpdate {
            return Err(ProtocolError::InvalidMessageType);
        }
        AwarenessPayload::decode(&self.payload)
    }

    /// Nonce of a ping or pong.
    pub fn nonce(&self) -> Result<u64, ProtocolError> {
        if !matches!(self.kind, MessageKind::Ping | MessageKind::Pong) {
            return Err(ProtocolError::InvalidMessageType);
        }
        let bytes: [u8; 8] = self
            .payload
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::DeserializationError("nonce must be 8 bytes".to_string()))?;
        Ok(u64::from_le_bytes(bytes))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    VersionMismatch { expected: u8, found: u8 },
    DocumentMismatch { expected: String, found: String },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::VersionMismatch { expected, found } => {
                write!(f, "Protocol version mismatch: expected {expected}, found {found}")
            }
            Self::DocumentMismatch { expected, found } => {
                write!(f, "Document mismatch: expected {expected}, found {found}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<DocumentError> for ProtocolError {
    fn from(e: DocumentError) -> Self {
        match e {
            DocumentError::Encode(e) => Self::SerializationError(e),
            other => Self::DeserializationError(other.to_string()),
        }
    }
}

impl ProtocolError {
    /// Whether this error means the peer speaks an incompatible protocol.
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::VersionMismatch { .. } | Self::DocumentMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::UserInfo;
    use quill_core::{CursorPosition, Document};

    fn fields() -> AwarenessFields {
        AwarenessFields {
            user: UserInfo::new(Uuid::new_v4(), "Alice", "#e06c75"),
            cursor: Some(CursorPosition::new(3, 5)),
            selection: None,
        }
    }

    #[test]
    fn test_sync_step1_carries_state_vector() {
        let mut doc = Document::new(Uuid::new_v4());
        doc.apply_local_insert(0, "abc").unwrap();
        let sv = doc.state_vector();

        let msg = SyncMessage::sync_step1(Uuid::new_v4(), "notes.rs", sv.encode().unwrap());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, MessageKind::SyncStep1);
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert_eq!(decoded.state_vector().unwrap(), sv);
    }

    #[test]
    fn test_update_roundtrip() {
        let mut doc = Document::new(Uuid::new_v4());
        let update = doc.apply_local_insert(0, "fn main() {}").unwrap();

        let msg = SyncMessage::update(doc.replica_id(), "main.rs", update.encode().unwrap());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, MessageKind::SyncUpdate);
        assert_eq!(decoded.document_id, "main.rs");
        assert_eq!(decoded.sync_update().unwrap(), update);
    }

    #[test]
    fn test_awareness_roundtrip() {
        let client = Uuid::new_v4();
        let payload = AwarenessPayload::State {
            client_id: client,
            timestamp: 1_700_000_000_000,
            fields: fields(),
        };
        let msg = SyncMessage::awareness(client, "doc", &payload).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.awareness_payload().unwrap(), payload);
        assert_eq!(decoded.awareness_payload().unwrap().client_id(), client);
    }

    #[test]
    fn test_ping_pong_nonce() {
        let ping = SyncMessage::ping(Uuid::new_v4(), "doc", 77);
        let pong = SyncMessage::pong(Uuid::nil(), "doc", ping.nonce().unwrap());
        let decoded = SyncMessage::decode(&pong.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, MessageKind::Pong);
        assert_eq!(decoded.nonce().unwrap(), 77);
    }

    #[test]
    fn test_validate_version_and_document() {
        let mut msg = SyncMessage::ping(Uuid::new_v4(), "a.rs", 1);
        assert!(msg.validate("a.rs").is_ok());

        let err = msg.validate("b.rs").unwrap_err();
        assert!(err.is_mismatch());

        msg.version = 9;
        assert_eq!(
            msg.validate("a.rs").unwrap_err(),
            ProtocolError::VersionMismatch { expected: 1, found: 9 }
        );
    }

    #[test]
    fn test_invalid_message_type_error() {
        let msg = SyncMessage::ping(Uuid::new_v4(), "doc", 1);
        assert_eq!(msg.awareness_payload().unwrap_err(), ProtocolError::InvalidMessageType);
        assert_eq!(msg.sync_update().unwrap_err(), ProtocolError::InvalidMessageType);
        assert_eq!(msg.state_vector().unwrap_err(), ProtocolError::InvalidMessageType);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_message_kind_values() {
        assert_eq!(MessageKind::SyncStep1 as u8, 1);
        assert_eq!(MessageKind::SyncStep2 as u8, 2);
        assert_eq!(MessageKind::SyncUpdate as u8, 3);
        assert_eq!(MessageKind::AwarenessUpdate as u8, 4);
        assert_eq!(MessageKind::Ping as u8, 5);
        assert_eq!(MessageKind::Pong as u8, 6);
    }

    #[test]
    fn test_keystroke_envelope_is_small() {
        let mut doc = Document::seeded(Uuid::new_v4(), "hello");
        let update = doc.apply_local_insert(5, "!").unwrap();
        let msg = SyncMessage::update(doc.replica_id(), "notes.txt", update.encode().unwrap());
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 150, "Encoded size {} too large", encoded.len());
    }
}
