//! Error types for core Colony types

use crate::ids::IdValidationError;
use thiserror::Error;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while building, decoding or correlating events
#[derive(Error, Debug)]
pub enum CoreError {
    /// An identifier failed validation
    #[error("Invalid identifier '{value}': {reason}")]
    InvalidId {
        value: String,
        reason: IdValidationError,
    },

    /// A wire envelope could not be turned back into an event
    #[error("Malformed event envelope: {0}")]
    MalformedEnvelope(String),

    /// An event payload did not have the expected shape
    #[error("Invalid payload for '{kind}': {message}")]
    InvalidPayload { kind: String, message: String },

    /// A request id is already waiting for a response
    #[error("Request '{0}' is already pending")]
    DuplicateRequest(String),

    /// JSON (de)serialization failed
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub fn invalid_id(value: impl Into<String>, reason: IdValidationError) -> Self {
        Self::InvalidId {
            value: value.into(),
            reason,
        }
    }

    pub fn invalid_payload(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            kind: kind.into(),
            message: message.into(),
        }
    }
}
