//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when handling events.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The outbox action is not one of INSERT, UPDATE or DELETE.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// The event payload could not be decoded.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::InvalidPayload(err.to_string())
    }
}
