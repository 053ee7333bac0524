//! Typed error hierarchy for the Kanban board.
//!
//! Three top-level enums cover the three subsystems:
//! - `BoardError`: store, policy and API failures on the server side
//! - `TransportError`: realtime channel failures (retried, never fatal)
//! - `WriteError`: a single client write, surfaced on the action that made it

use thiserror::Error;

/// Errors from the board store, the access policy and the API layer.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Project {id} not found")]
    ProjectNotFound { id: i64 },

    #[error("Column {id} not found")]
    ColumnNotFound { id: i64 },

    #[error("Item {id} not found")]
    ItemNotFound { id: i64 },

    #[error("Custom field {id} not found")]
    FieldNotFound { id: i64 },

    #[error("Comment {id} not found")]
    CommentNotFound { id: i64 },

    #[error("Profile '{id}' not found")]
    ProfileNotFound { id: String },

    #[error("Missing or unknown actor identity")]
    Unauthenticated,

    #[error("Not allowed to {action}: {reason}")]
    PolicyDenied { action: String, reason: String },

    #[error("Invalid value for field '{field}': {message}")]
    InvalidFieldValue { field: String, message: String },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BoardError {
    pub fn denied(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PolicyDenied {
            action: action.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ProjectNotFound { .. }
                | Self::ColumnNotFound { .. }
                | Self::ItemNotFound { .. }
                | Self::FieldNotFound { .. }
                | Self::CommentNotFound { .. }
                | Self::ProfileNotFound { .. }
        )
    }
}

/// Errors from the realtime transport. These drive the connection status
/// and the retry loop; subscribers never see them directly.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Subscription handshake failed: {0}")]
    Handshake(String),

    #[error("Timed out after {millis}ms waiting for subscription ack")]
    Timeout { millis: u64 },

    #[error("Server rejected channel '{channel}': {reason}")]
    Rejected { channel: String, reason: String },

    #[error("Channel closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Failure of one client-side write. `Rejected` means the store refused the
/// write (policy or validation) and the optimistic change must be rolled
/// back; `Transport` is worth retrying.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WriteError {
    #[error("Write rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl WriteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
