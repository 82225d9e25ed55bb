//! Binary protocol for the rebase sync loop.
//!
//! Wire format (bincode-encoded envelope):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ author_id │ doc_id   │ history  │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ 8 bytes  │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! The payload is canonical JSON: data items serialize untagged (`"a"`
//! versus `{"type": "paragraph"}`), which rules out a self-describing-free
//! binary encoding for the inner structures. The envelope stays binary so
//! routing never has to parse a payload.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;
use weft_core::{DataItem, StoreDelta};

use crate::change::Change;
use crate::error::CollabError;
use crate::selection::{AuthorId, Selection};

/// Message types for the rebase protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Server assigns the connecting author its id
    Registered = 1,
    /// Full document snapshot for a late joiner
    InitDoc = 2,
    /// Client submits an uncommitted change
    SubmitChange = 3,
    /// Server broadcasts a committed change
    NewChange = 4,
    /// Author left; drop their presence
    AuthorDisconnect = 5,
    /// Heartbeat ping
    Ping = 6,
    /// Heartbeat pong
    Pong = 7,
}

/// Everything a late joiner needs to start editing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub items: Vec<DataItem>,
    pub store: StoreDelta,
    /// Number of committed transactions behind this snapshot.
    pub history_length: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selections: BTreeMap<AuthorId, Selection>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub author_id: Uuid,
    pub doc_id: Uuid,
    /// History index the payload is anchored at; redundant with the payload
    /// but lets a router order messages without parsing it.
    pub history: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create a registration acknowledgement.
    pub fn registered(author_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Registered,
            author_id,
            doc_id,
            history: 0,
            payload: Vec::new(),
        }
    }

    /// Create a snapshot message for a late joiner.
    pub fn init_doc(
        author_id: Uuid,
        doc_id: Uuid,
        snapshot: &DocumentSnapshot,
    ) -> Result<Self, CollabError> {
        Ok(Self {
            msg_type: MessageType::InitDoc,
            author_id,
            doc_id,
            history: snapshot.history_length as u64,
            payload: serde_json::to_vec(snapshot)
                .map_err(|e| CollabError::Serialization(e.to_string()))?,
        })
    }

    /// Create a change submission.
    pub fn submit_change(
        author_id: Uuid,
        doc_id: Uuid,
        change: &Change,
    ) -> Result<Self, CollabError> {
        Self::change_message(MessageType::SubmitChange, author_id, doc_id, change)
    }

    /// Create a committed-change broadcast.
    pub fn new_change(author_id: Uuid, doc_id: Uuid, change: &Change) -> Result<Self, CollabError> {
        Self::change_message(MessageType::NewChange, author_id, doc_id, change)
    }

    fn change_message(
        msg_type: MessageType,
        author_id: Uuid,
        doc_id: Uuid,
        change: &Change,
    ) -> Result<Self, CollabError> {
        change.validate()?;
        Ok(Self {
            msg_type,
            author_id,
            doc_id,
            history: change.start as u64,
            payload: serde_json::to_vec(change)
                .map_err(|e| CollabError::Serialization(e.to_string()))?,
        })
    }

    /// Create a disconnect notification.
    pub fn author_disconnect(author_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::AuthorDisconnect,
            author_id,
            doc_id,
            history: 0,
            payload: Vec::new(),
        }
    }

    /// Create a ping message.
    pub fn ping(author_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            author_id,
            doc_id: Uuid::nil(),
            history: 0,
            payload: Vec::new(),
        }
    }

    /// Create a pong message.
    pub fn pong(author_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            author_id,
            doc_id: Uuid::nil(),
            history: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, CollabError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, CollabError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CollabError::Serialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a change payload, verifying it against the envelope.
    pub fn change(&self) -> Result<Change, CollabError> {
        if !matches!(
            self.msg_type,
            MessageType::SubmitChange | MessageType::NewChange
        ) {
            return Err(CollabError::ProtocolViolation(format!(
                "{:?} carries no change payload",
                self.msg_type
            )));
        }
        let change: Change = serde_json::from_slice(&self.payload)
            .map_err(|e| CollabError::Serialization(e.to_string()))?;
        change.validate()?;
        if change.start as u64 != self.history {
            return Err(CollabError::ProtocolViolation(format!(
                "envelope anchored at history {} but change starts at {}",
                self.history, change.start
            )));
        }
        Ok(change)
    }

    /// Parse a snapshot payload.
    pub fn snapshot(&self) -> Result<DocumentSnapshot, CollabError> {
        if self.msg_type != MessageType::InitDoc {
            return Err(CollabError::ProtocolViolation(format!(
                "{:?} carries no snapshot payload",
                self.msg_type
            )));
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| CollabError::Serialization(e.to_string()))
    }
}
