//! Core error types shared across the relay.

use thiserror::Error;

/// Errors that arise from protocol handling, independent of transport.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The inbound frame was not a structurally valid client message.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The change feed delivered a payload we could not interpret.
    #[error("malformed change notification: {0}")]
    MalformedNotification(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::MalformedMessage(e.to_string())
    }
}
