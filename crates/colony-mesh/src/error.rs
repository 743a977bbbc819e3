//! Error types for bus, runtime and lock operations

use colony_core::CoreError;
use std::time::Duration;
use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors that can occur inside a single process's event mesh
#[derive(Error, Debug)]
pub enum MeshError {
    /// The bus has been shut down
    #[error("Event bus is closed")]
    BusClosed,

    /// No local agent with this id
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// An agent with this id is already registered on this bus
    #[error("Agent already registered: {0}")]
    AgentAlreadyRegistered(String),

    /// The environment inbox was already claimed
    #[error("Environment inbox already attached")]
    EnvAlreadyAttached,

    /// Handler table failed validation at registration time
    #[error("Invalid handler table: {0}")]
    InvalidHandlerTable(String),

    /// No factory knows how to build agents of this type
    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),

    /// Lock could not be acquired before the wait deadline
    #[error("Timed out after {waited:?} waiting for lock '{lock_id}'")]
    LockTimeout { lock_id: String, waited: Duration },

    /// Lock authority unreachable or refused the request
    #[error("Lock authority unavailable: {0}")]
    LockUnavailable(String),

    /// Relay to another process failed
    #[error("Relay failed: {0}")]
    RelayFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error from a core type
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Core(CoreError::Serialization(err))
    }
}
