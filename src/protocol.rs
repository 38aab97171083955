//! Wire payload types crossing the transport boundary.
//!
//! The engine does not own a network transport; it consumes a narrow
//! boundary ("publish to all subscribers of document X", "receive a message
//! from subscriber S addressed to document X"). These are the payloads that
//! cross it, bincode-encoded:
//!
//! - [`ClientFrame`] — inbound mutations. Each frame carries the full
//!   document id fields so the engine can verify them against the id the
//!   message arrived under (defensive integrity check).
//! - [`ServerEvent`] — outbound state, accepted operations, merge updates,
//!   and per-connection errors.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::DocumentId;
use crate::ot::Operation;

/// Transport-level connection identity.
pub type ConnectionId = Uuid;

/// Inbound mutation frame from a subscriber or agent connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Revision-transform protocol: one operation against a base revision.
    Submit {
        environment: String,
        bucket: String,
        path: String,
        base_revision: u64,
        operation: Operation,
        author: Uuid,
    },
    /// Merge protocol: an opaque CRDT update blob.
    Update {
        environment: String,
        bucket: String,
        path: String,
        update: Vec<u8>,
        /// True when the frame originates from the bucket's agent channel.
        from_agent: bool,
    },
}

impl ClientFrame {
    /// Recompute the document id from the frame's own fields.
    pub fn document_id(&self) -> DocumentId {
        match self {
            ClientFrame::Submit {
                environment,
                bucket,
                path,
                ..
            }
            | ClientFrame::Update {
                environment,
                bucket,
                path,
                ..
            } => DocumentId::new(environment.clone(), bucket.clone(), path.clone()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

/// Outbound event fanned out by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Full document state, sent to a connection on subscribe or resync.
    DocumentState {
        environment: String,
        bucket: String,
        path: String,
        content: String,
        revision: u64,
    },
    /// An accepted (possibly transformed) operation from another editor.
    RemoteOperation {
        environment: String,
        bucket: String,
        path: String,
        operation: Operation,
        author: Uuid,
        revision: u64,
    },
    /// A merged CRDT update, re-broadcast to everyone but its originator.
    StateUpdate {
        environment: String,
        bucket: String,
        path: String,
        update: Vec<u8>,
        from_agent: bool,
        revision: u64,
    },
    /// Per-message failure, delivered only to the originating connection.
    Error { message: String },
}

impl ServerEvent {
    pub fn document_state(id: &DocumentId, content: &str, revision: u64) -> Self {
        ServerEvent::DocumentState {
            environment: id.environment().to_string(),
            bucket: id.bucket().to_string(),
            path: id.path().to_string(),
            content: content.to_string(),
            revision,
        }
    }

    pub fn remote_operation(
        id: &DocumentId,
        operation: &Operation,
        author: Uuid,
        revision: u64,
    ) -> Self {
        ServerEvent::RemoteOperation {
            environment: id.environment().to_string(),
            bucket: id.bucket().to_string(),
            path: id.path().to_string(),
            operation: operation.clone(),
            author,
            revision,
        }
    }

    pub fn state_update(id: &DocumentId, update: &[u8], from_agent: bool, revision: u64) -> Self {
        ServerEvent::StateUpdate {
            environment: id.environment().to_string(),
            bucket: id.bucket().to_string(),
            path: id.path().to_string(),
            update: update.to_vec(),
            from_agent,
            revision,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(event)
    }
}

/// Wire codec errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
