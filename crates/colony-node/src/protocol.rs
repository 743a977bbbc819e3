//! Request and response bodies of the node RPC surface.
//!
//! Every call is a JSON request to one of the [`routes`]. Events cross the
//! wire as [`EventEnvelope`]s.

use chrono::{DateTime, Utc};
use colony_core::{AgentConfig, AgentId, EventEnvelope, WorkerId};
use colony_env::ActivitySnapshot;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub mod routes {
    pub const REGISTER_WORKER: &str = "/v1/workers/register";
    pub const HEARTBEAT: &str = "/v1/workers/heartbeat";
    pub const EVENTS: &str = "/v1/events";
    pub const AGENT_LOCATION: &str = "/v1/agents/{agent_id}/location";
    pub const ENV_GET: &str = "/v1/env/get";
    pub const ENV_UPDATE: &str = "/v1/env/update";
    pub const AGENT_DATA_GET: &str = "/v1/agents/data/get";
    pub const AGENT_DATA_BY_TYPE: &str = "/v1/agents/data/by-type";
    pub const AGENT_DATA_UPDATE: &str = "/v1/agents/data/update";
    pub const AGENTS: &str = "/v1/agents";
    pub const AGENTS_BATCH: &str = "/v1/agents/batch";
    pub const STOP: &str = "/v1/stop";
    pub const PAUSE: &str = "/v1/pause";
    pub const RESUME: &str = "/v1/resume";
    pub const COLLECT: &str = "/v1/collect";
    pub const STATUS: &str = "/v1/status";
    pub const LOCK_ACQUIRE: &str = "/v1/locks/acquire";
    pub const LOCK_RELEASE: &str = "/v1/locks/release";
    pub const METRICS: &str = "/metrics";

    pub fn agent_location(agent_id: &str) -> String {
        format!("/v1/agents/{agent_id}/location")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    pub worker_id: WorkerId,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWorkerResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: WorkerId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub acknowledged: bool,
    /// The master no longer knows this worker; register again
    #[serde(default)]
    pub reregister_required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEventResponse {
    pub received: bool,
}

/// Where an agent lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLocation {
    pub worker_id: WorkerId,
    pub address: String,
    pub port: u16,
    pub agent_type: String,
}

impl AgentLocation {
    pub fn base_url(&self) -> String {
        base_url(&self.address, self.port)
    }
}

pub fn base_url(address: &str, port: u16) -> String {
    format!("http://{address}:{port}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvDataRequest {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEnvDataRequest {
    pub key: String,
    pub value: Value,
}

/// A single looked-up value; `None` when the key or owner is missing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataValueResponse {
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDataRequest {
    pub agent_id: AgentId,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateAgentDataRequest {
    pub agent_id: AgentId,
    pub key: String,
    pub value: Value,
}

/// Used by both `GetAgentDataByType` and `CollectDataBatch`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectRequest {
    pub agent_type: String,
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectResponse {
    pub values: BTreeMap<AgentId, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateAgentsBatchRequest {
    pub configs: Vec<AgentConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentFailure {
    pub agent_id: AgentId,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAgentsResponse {
    pub agent_ids: Vec<AgentId>,
    #[serde(default)]
    pub failures: Vec<AgentFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
    pub worker_id: Option<WorkerId>,
    pub reason: String,
}

/// Pause or resume delivery on one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub worker_id: Option<WorkerId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub acknowledged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub worker_id: WorkerId,
    pub activity: ActivitySnapshot,
    pub agents: usize,
    pub running: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub released: bool,
}

/// Envelope sent to `POST /v1/events`
pub type SendEventRequest = EventEnvelope;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_heartbeat_response_defaults_reregister() {
        let parsed: HeartbeatResponse =
            serde_json::from_value(json!({"acknowledged": true})).unwrap();
        assert!(!parsed.reregister_required);
    }

    #[test]
    fn test_collect_response_keys_are_agent_ids() {
        let mut values = BTreeMap::new();
        values.insert(AgentId::parse("a2").unwrap(), json!(2));
        values.insert(AgentId::parse("a1").unwrap(), json!(1));
        let encoded = serde_json::to_value(CollectResponse { values }).unwrap();
        assert_eq!(encoded, json!({"values": {"a1": 1, "a2": 2}}));
    }

    #[test]
    fn test_location_route() {
        assert_eq!(routes::agent_location("a1"), "/v1/agents/a1/location");
        let location = AgentLocation {
            worker_id: WorkerId::parse("w1").unwrap(),
            address: "127.0.0.1".into(),
            port: 9001,
            agent_type: "counter".into(),
        };
        assert_eq!(location.base_url(), "http://127.0.0.1:9001");
    }
}
