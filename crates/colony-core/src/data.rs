//! Payload bodies of the built-in data access and control events

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::AgentId;

/// Body of a `DataEvent`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    pub request_id: String,
    pub key: String,
}

/// Body of a `DataResponseEvent`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataResponse {
    pub request_id: String,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DataResponse {
    pub fn found(request_id: impl Into<String>, value: Value) -> Self {
        Self {
            request_id: request_id.into(),
            value: Some(value),
            error: None,
        }
    }

    pub fn failed(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            value: None,
            error: Some(error.into()),
        }
    }
}

/// Body of a `DataUpdateEvent`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataUpdate {
    pub request_id: String,
    pub key: String,
    pub value: Value,
}

/// Body of a `DataUpdateResponseEvent`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataUpdateResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DataUpdateResponse {
    pub fn ok(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            error: None,
        }
    }

    pub fn failed(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Body of a `StartEvent`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSignal {
    /// Round (round mode) or step (timed mode), starting at 1
    pub step: u64,
}

/// Body of an `EndEvent`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndReport {
    pub step: u64,
}

/// Body of a `TerminationEvent`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TerminationNotice {
    #[serde(default)]
    pub reason: String,
}

/// Body of a `DecisionEvent`: one agent decision to persist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub agent_id: AgentId,
    /// Event kind the decision reacted to
    pub trigger: String,
    pub decision: Value,
}

/// Initial description of an agent, used for allocation and remote creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: AgentId,
    pub agent_type: String,
    #[serde(default)]
    pub profile: serde_json::Map<String, Value>,
}

impl AgentConfig {
    pub fn new(agent_id: AgentId, agent_type: impl Into<String>) -> Self {
        Self {
            agent_id,
            agent_type: agent_type.into(),
            profile: serde_json::Map::new(),
        }
    }

    pub fn with_profile_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.profile.insert(key.into(), value.into());
        self
    }
}
