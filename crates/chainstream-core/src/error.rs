//! Error types for the chainstream control surface.

use thiserror::Error;
use uuid::Uuid;

/// Errors returned by stream control operations and the filter resolver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The supplied filter or options text is not valid JSON.
    #[error("Malformed JSON in {context}: {reason}")]
    MalformedInput { context: String, reason: String },

    /// The JSON parsed, but the ABI/filter content is incomplete or unsupported.
    #[error("Invalid event filter: {reason}")]
    InvalidSemantics { reason: String },

    #[error("Event stream {id} is already started")]
    DuplicateStream { id: Uuid },

    #[error("Listener {listener_id} already exists in event stream {stream_id}")]
    DuplicateListener { stream_id: Uuid, listener_id: Uuid },

    #[error("Event stream {id} not found")]
    UnknownStream { id: Uuid },

    #[error("Listener {listener_id} not found in event stream {stream_id}")]
    UnknownListener { stream_id: Uuid, listener_id: Uuid },

    #[error("Event stream {id} has not stopped")]
    NotYetStopped { id: Uuid },
}

/// Flat classification of [`StreamError`] for callers that map errors to codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedInput,
    InvalidSemantics,
    DuplicateStream,
    DuplicateListener,
    UnknownStream,
    UnknownListener,
    NotYetStopped,
}

impl StreamError {
    pub fn malformed(context: impl Into<String>, err: &serde_json::Error) -> Self {
        Self::MalformedInput {
            context: context.into(),
            reason: err.to_string(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidSemantics {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedInput { .. } => ErrorKind::MalformedInput,
            Self::InvalidSemantics { .. } => ErrorKind::InvalidSemantics,
            Self::DuplicateStream { .. } => ErrorKind::DuplicateStream,
            Self::DuplicateListener { .. } => ErrorKind::DuplicateListener,
            Self::UnknownStream { .. } => ErrorKind::UnknownStream,
            Self::UnknownListener { .. } => ErrorKind::UnknownListener,
            Self::NotYetStopped { .. } => ErrorKind::NotYetStopped,
        }
    }
}
