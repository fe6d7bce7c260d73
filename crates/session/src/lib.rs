use thiserror::Error;

mod ids;
pub use ids::*;
mod participant;
pub use participant::*;
mod lifecycle;
pub use lifecycle::*;
mod text;
pub use text::*;
mod drawing;
pub use drawing::*;
mod chat;
pub use chat::*;
mod progress;
pub use progress::*;

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("invalid transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("session is full ({max} participants)")]
    SessionFull { max: usize },
    #[error("participant already joined: {0}")]
    ParticipantExists(UserId),
    #[error("participant not found: {0}")]
    ParticipantNotFound(UserId),
    #[error("position {position} out of bounds (length {len})")]
    PositionOutOfBounds { position: usize, len: usize },
    #[error("range {position}..{end} out of bounds (length {len})")]
    RangeOutOfBounds {
        position: usize,
        end: usize,
        len: usize,
    },
    #[error("drawing not found: {0}")]
    DrawingNotFound(DrawingId),
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),
    #[error("history empty: {0}")]
    HistoryEmpty(&'static str),
    #[error("version mismatch: expected {expected}, found {actual}")]
    VersionMismatch { expected: u64, actual: u64 },
    #[error("invalid operation: {0}")]
    InvalidOp(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
