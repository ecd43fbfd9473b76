//! Binary frames exchanged over the push connection.
//!
//! Wire format (bincode-encoded, one frame per WebSocket binary message):
//! ```text
//! client → server   Subscribe { topic } | Unsubscribe { topic } | Ping { nonce }
//! server → client   Event { topic, seq, event } | Subscribed { topic } | Pong { nonce }
//! ```
//!
//! `seq` increases by one per event on a given topic, so the client can
//! spot duplicates and reordering while the connection stays up.

use newhire_core::{Entity, EntityId, Patch, Topic};
use serde::{Deserialize, Serialize};

/// Typed push event delivered on a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PushEvent {
    /// A new entity; inserted at the head of windows on this topic.
    Created(Entity),
    /// Partial-field patch of an existing entity.
    Updated { id: EntityId, patch: Patch },
    /// Server-confirmed deletion.
    Deleted { id: EntityId },
    /// Collection size changed without item payload.
    CountChanged(CountChange),
}

impl PushEvent {
    /// The entity this event is about, if any.
    pub fn entity_id(&self) -> Option<EntityId> {
        match self {
            PushEvent::Created(entity) => Some(entity.id),
            PushEvent::Updated { id, .. } | PushEvent::Deleted { id } => Some(*id),
            PushEvent::CountChanged(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountChange {
    Delta(i64),
    Total(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    Subscribe { topic: Topic },
    Unsubscribe { topic: Topic },
    Ping { nonce: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    Event { topic: Topic, seq: u64, event: PushEvent },
    Subscribed { topic: Topic },
    Pong { nonce: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("connection closed")]
    ConnectionClosed,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}
