//! Node layer errors and their HTTP mapping

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use colony_core::{ConfigError, CoreError};
use colony_env::EnvError;
use colony_mesh::MeshError;
use colony_observability::ObservabilityError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    /// Connection refused, reset, or similar
    #[error("Transport error calling {peer}: {message}")]
    Transport { peer: String, message: String },

    #[error("Request to {peer} timed out")]
    Timeout { peer: String },

    /// Calls to this peer are short-circuited after repeated failures
    #[error("Circuit open for {peer}")]
    CircuitOpen { peer: String },

    /// The peer answered with a non-success status
    #[error("{peer} answered {status} ({code}): {message}")]
    Remote {
        peer: String,
        status: u16,
        code: String,
        message: String,
    },

    #[error("Worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("No workers registered")]
    NoWorkers,

    #[error("Registration failed after {attempts} attempts: {last_error}")]
    RegistrationExhausted { attempts: u32, last_error: String },

    #[error("Timed out after {waited:?} waiting for {expected} workers")]
    WorkersUnavailable { expected: usize, waited: Duration },

    #[error("Node is shutting down")]
    ShuttingDown,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Server(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Observability(#[from] ObservabilityError),
}

impl NodeError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Faults worth retrying: the peer may answer a later attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            NodeError::Transport { .. }
            | NodeError::Timeout { .. }
            | NodeError::CircuitOpen { .. } => true,
            NodeError::Remote { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Stable machine-readable code carried in [`ErrorResponse`]
    pub fn code(&self) -> &'static str {
        match self {
            NodeError::Transport { .. } => "transport",
            NodeError::Timeout { .. } => "timeout",
            NodeError::CircuitOpen { .. } => "circuit_open",
            NodeError::Remote { .. } => "remote",
            NodeError::DuplicateWorker(_) => "duplicate_worker",
            NodeError::UnknownWorker(_) => "unknown_worker",
            NodeError::AgentNotFound(_) => "agent_not_found",
            NodeError::NoWorkers => "no_workers",
            NodeError::RegistrationExhausted { .. } => "registration_exhausted",
            NodeError::WorkersUnavailable { .. } => "workers_unavailable",
            NodeError::ShuttingDown => "shutting_down",
            NodeError::InvalidRequest(_) => "invalid_request",
            NodeError::Bind { .. } | NodeError::Server(_) => "server",
            NodeError::Config(_) => "config",
            NodeError::Mesh(MeshError::AgentNotFound(_)) => "agent_not_found",
            NodeError::Mesh(MeshError::AgentAlreadyRegistered(_)) => "duplicate_agent",
            NodeError::Mesh(MeshError::UnknownAgentType(_)) => "unknown_agent_type",
            NodeError::Mesh(MeshError::LockTimeout { .. }) => "lock_timeout",
            NodeError::Mesh(MeshError::LockUnavailable(_)) => "lock_unavailable",
            NodeError::Mesh(MeshError::BusClosed) => "shutting_down",
            NodeError::Mesh(_) => "mesh",
            NodeError::Env(EnvError::InvalidTransition { .. }) => "invalid_transition",
            NodeError::Env(_) => "environment",
            NodeError::Core(_) => "invalid_request",
            NodeError::Observability(_) => "observability",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.code() {
            "invalid_request" | "unknown_agent_type" => StatusCode::BAD_REQUEST,
            "agent_not_found" | "unknown_worker" => StatusCode::NOT_FOUND,
            "duplicate_worker" | "duplicate_agent" | "invalid_transition" => StatusCode::CONFLICT,
            "lock_timeout" => StatusCode::REQUEST_TIMEOUT,
            "lock_unavailable" | "shutting_down" | "no_workers" | "workers_unavailable" => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            "transport" | "circuit_open" | "remote" => StatusCode::BAD_GATEWAY,
            "timeout" => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a remote answer carried the given error code
    pub fn has_remote_code(&self, expected: &str) -> bool {
        matches!(self, NodeError::Remote { code, .. } if code == expected)
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(err: reqwest::Error) -> Self {
        let peer = err
            .url()
            .map(|url| url.origin().ascii_serialization())
            .unwrap_or_else(|| "unknown".to_string());
        if err.is_timeout() {
            NodeError::Timeout { peer }
        } else if err.is_decode() {
            NodeError::Remote {
                peer,
                status: 200,
                code: "decode".to_string(),
                message: err.to_string(),
            }
        } else {
            NodeError::Transport {
                peer,
                message: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Core(CoreError::Serialization(err))
    }
}

/// JSON body of every non-success response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&NodeError> for ErrorResponse {
    fn from(err: &NodeError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(code = self.code(), error = %self, "Request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self, "Request rejected");
        }
        (status, Json(ErrorResponse::from(&self))).into_response()
    }
}
