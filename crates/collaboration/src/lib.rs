/// Real-time collaboration engine
///
/// Server-sequenced operational transformation for the shared document, a
/// replicated whiteboard, chat and presence, all behind one JSON protocol.
use std::time::Duration;
use thiserror::Error;

pub use session::*;

mod clock;
pub use clock::*;

mod document;
pub use document::*;

mod whiteboard;
pub use whiteboard::*;

mod chat;
pub use chat::*;

mod presence;
pub use presence::*;

mod workspace;
pub use workspace::*;

mod registry;
pub use registry::*;

mod sync;
pub use sync::*;

mod offline;
pub use offline::*;

#[derive(Debug, Error)]
pub enum CollaborationError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("no session for invite code {0}")]
    InviteNotFound(String),

    #[error("user {0} has not joined this session")]
    NotJoined(UserId),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("base version {base} is ahead of document version {current}")]
    VersionAhead { base: u64, current: u64 },

    #[error("expected version {expected}, received {received}")]
    OutOfOrder { expected: u64, received: u64 },

    #[error("invalid operation: {0}")]
    InvalidOp(String),
}

impl From<serde_json::Error> for CollaborationError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for CollaborationError {
    fn from(err: std::io::Error) -> Self {
        Self::StorageError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// Limits and timeouts shared by every session in a registry
#[derive(Debug, Clone, PartialEq)]
pub struct CollaborationConfig {
    /// Participants without activity for this long count as idle
    pub idle_after: Duration,
    /// Participants without activity for this long are marked disconnected
    pub disconnect_after: Duration,
    /// Used when a session is created without a participant limit
    pub default_max_participants: usize,
    pub max_participants_limit: usize,
    /// In characters
    pub max_message_len: usize,
    pub invite_base_url: String,
}

impl Default for CollaborationConfig {
    fn default() -> Self {
        Self {
            idle_after: Duration::from_secs(60),
            disconnect_after: Duration::from_secs(300),
            default_max_participants: 10,
            max_participants_limit: 50,
            max_message_len: 4000,
            invite_base_url: "http://localhost:3000".to_string(),
        }
    }
}
