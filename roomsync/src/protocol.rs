//! Binary protocol for room synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬──────────┬───────────┬──────────┐
//! │ kind     │ room_id  │ sender    │ payload  │
//! │ 1 byte   │ variable │ 16 bytes  │ variable │
//! └──────────┴──────────┴───────────┴──────────┘
//! ```
//!
//! Every frame names its room and its sending replica. The relay routes by
//! room and never inspects payloads; clients filter out their own frames by
//! `sender`.
//!
//! Performance target: serialization < 500ns for a typical op batch.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::awareness::AwarenessUpdate;
use crate::crdt::{Operation, StateVector};

/// Frame types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// Batch of CRDT operations
    Op = 1,
    /// Presence update (cursor, selection, join/leave)
    Awareness = 2,
    /// State vector announcing what the sender has seen
    SyncRequest = 3,
    /// Operations the requester was missing
    SyncResponse = 4,
}

/// Top-level protocol frame.
///
/// Serialized with bincode for minimal overhead. The payload encoding varies
/// by kind; use the typed accessors to parse it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub room_id: String,
    pub sender: Uuid,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Create an operation batch frame.
    pub fn op(room_id: impl Into<String>, sender: Uuid, ops: &[Operation]) -> Self {
        let payload = bincode::serde::encode_to_vec(ops, bincode::config::standard())
            .unwrap_or_default();
        Self {
            kind: EnvelopeKind::Op,
            room_id: room_id.into(),
            sender,
            payload,
        }
    }

    /// Create an awareness frame.
    pub fn awareness(room_id: impl Into<String>, sender: Uuid, update: &AwarenessUpdate) -> Self {
        let payload = bincode::serde::encode_to_vec(update, bincode::config::standard())
            .unwrap_or_default();
        Self {
            kind: EnvelopeKind::Awareness,
            room_id: room_id.into(),
            sender,
            payload,
        }
    }

    /// Create a sync request carrying the sender's state vector.
    pub fn sync_request(room_id: impl Into<String>, sender: Uuid, sv: &StateVector) -> Self {
        let payload =
            bincode::serde::encode_to_vec(sv, bincode::config::standard()).unwrap_or_default();
        Self {
            kind: EnvelopeKind::SyncRequest,
            room_id: room_id.into(),
            sender,
            payload,
        }
    }

    /// Create a sync response carrying the ops the requester was missing.
    pub fn sync_response(room_id: impl Into<String>, sender: Uuid, ops: &[Operation]) -> Self {
        let payload = bincode::serde::encode_to_vec(ops, bincode::config::standard())
            .unwrap_or_default();
        Self {
            kind: EnvelopeKind::SyncResponse,
            room_id: room_id.into(),
            sender,
            payload,
        }
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

    /// Parse an op batch payload (`Op` or `SyncResponse`).
    pub fn ops(&self) -> Result<Vec<Operation>, ProtocolError> {
        if self.kind != EnvelopeKind::Op && self.kind != EnvelopeKind::SyncResponse {
            return Err(ProtocolError::InvalidKind);
        }
        let (ops, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(ops)
    }

    /// Parse a state vector payload.
    pub fn state_vector(&self) -> Result<StateVector, ProtocolError> {
        if self.kind != EnvelopeKind::SyncRequest {
            return Err(ProtocolError::InvalidKind);
        }
        let (sv, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(sv)
    }

    /// Parse an awareness payload.
    pub fn awareness_update(&self) -> Result<AwarenessUpdate, ProtocolError> {
        if self.kind != EnvelopeKind::Awareness {
            return Err(ProtocolError::InvalidKind);
        }
        let (update, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(update)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidKind,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidKind => write!(f, "Invalid envelope kind"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{Document, Mutation};

    fn sample_ops() -> Vec<Operation> {
        let mut doc = Document::new(Uuid::new_v4());
        doc.get_text("body").unwrap();
        let op = doc
            .apply_local(
                "body",
                Mutation::TextInsert {
                    index: 0,
                    text: "sync".into(),
                },
            )
            .unwrap();
        vec![op]
    }

    #[test]
    fn test_op_roundtrip() {
        let sender = Uuid::new_v4();
        let ops = sample_ops();

        let msg = Envelope::op("design-review", sender, &ops);
        let encoded = msg.encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();

        assert_eq!(decoded.kind, EnvelopeKind::Op);
        assert_eq!(decoded.room_id, "design-review");
        assert_eq!(decoded.sender, sender);
        assert_eq!(decoded.ops().unwrap(), ops);
    }

    #[test]
    fn test_sync_request_roundtrip() {
        let sender = Uuid::new_v4();
        let mut sv = StateVector::new();
        sv.insert(sender, 17);
        sv.insert(Uuid::new_v4(), 3);

        let msg = Envelope::sync_request("room", sender, &sv);
        let decoded = Envelope::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, EnvelopeKind::SyncRequest);
        assert_eq!(decoded.state_vector().unwrap(), sv);
    }

    #[test]
    fn test_sync_response_roundtrip() {
        let sender = Uuid::new_v4();
        let ops = sample_ops();

        let msg = Envelope::sync_response("room", sender, &ops);
        let decoded = Envelope::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, EnvelopeKind::SyncResponse);
        assert_eq!(decoded.ops().unwrap(), ops);
    }

    #[test]
    fn test_awareness_roundtrip() {
        let sender = Uuid::new_v4();
        let update = AwarenessUpdate::Left { client_id: sender };

        let msg = Envelope::awareness("room", sender, &update);
        let decoded = Envelope::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, EnvelopeKind::Awareness);
        assert_eq!(decoded.awareness_update().unwrap(), update);
    }

    #[test]
    fn test_kind_values() {
        assert_eq!(EnvelopeKind::Op as u8, 1);
        assert_eq!(EnvelopeKind::Awareness as u8, 2);
        assert_eq!(EnvelopeKind::SyncRequest as u8, 3);
        assert_eq!(EnvelopeKind::SyncResponse as u8, 4);
    }

    #[test]
    fn test_mismatched_accessor() {
        let msg = Envelope::op("room", Uuid::new_v4(), &[]);
        assert!(msg.state_vector().is_err());
        assert!(msg.awareness_update().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(Envelope::decode(&garbage).is_err());
    }

    #[test]
    fn test_empty_op_batch() {
        let msg = Envelope::op("room", Uuid::new_v4(), &[]);
        let decoded = Envelope::decode(&msg.encode().unwrap()).unwrap();
        assert!(decoded.ops().unwrap().is_empty());
    }
}
