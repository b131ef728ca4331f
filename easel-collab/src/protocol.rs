//! Message envelope carried on every data channel.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬──────────────┬──────────────────┐
//! │ kind     │ payload      │ timestamp        │
//! │ 1 byte   │ len + bytes  │ varint, ms epoch │
//! └──────────┴──────────────┴──────────────────┘
//! ```
//!
//! The payload is opaque to the envelope: CRDT updates and state vectors
//! pass through unmodified, presence and asset messages are bincode
//! structs of their own.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Pointer / selection / typing state
    Presence = 1,
    /// Yrs state vector for the initial handshake
    SyncStep1 = 2,
    /// Yrs diff answering a state vector
    SyncStep2 = 3,
    /// Incremental Yrs update
    DocUpdate = 4,
    AssetRequest = 5,
    AssetStart = 6,
    AssetChunk = 7,
    AssetComplete = 8,
    AssetFailed = 9,
}

impl MessageKind {
    /// Kinds handled by document replication.
    pub fn is_document(self) -> bool {
        matches!(self, MessageKind::SyncStep1 | MessageKind::SyncStep2 | MessageKind::DocUpdate)
    }

    pub fn is_asset(self) -> bool {
        matches!(
            self,
            MessageKind::AssetRequest
                | MessageKind::AssetStart
                | MessageKind::AssetChunk
                | MessageKind::AssetComplete
                | MessageKind::AssetFailed
        )
    }
}

/// `{ type, payload, timestamp }` as sent over a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    /// Milliseconds since the UNIX epoch at send time.
    pub timestamp: u64,
}

impl Envelope {
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
            timestamp: now_millis(),
        }
    }

    /// Envelope whose payload is `value` in bincode.
    pub fn with_payload<T: Serialize>(kind: MessageKind, value: &T) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(Self::new(kind, payload))
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(envelope)
    }

    /// Parse a bincode payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let (value, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(value)
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Envelope errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Encode(String),
    #[error("Deserialization error: {0}")]
    Decode(String),
    #[error("Unexpected message kind {0:?}")]
    UnexpectedKind(MessageKind),
}
