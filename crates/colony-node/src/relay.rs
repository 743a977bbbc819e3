//! Cross-process event delivery.
//!
//! The master relays to the worker that hosts an agent, using its
//! [`AgentDirectory`], and fans broadcasts out to every worker except the
//! one the event came from. A worker sends unicasts straight to the owning
//! worker once it has learned the location from the master, and hands
//! everything else to the master.

use async_trait::async_trait;
use colony_core::{Address, AgentId, Event, EventEnvelope, WorkerId};
use colony_mesh::{EventRelay, MeshError, MeshResult};
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::client::PeerClient;
use crate::directory::AgentDirectory;
use crate::error::NodeError;
use crate::protocol::{AgentLocation, SendEventResponse, routes};
use crate::registry::WorkerRegistry;

fn relay_error(err: NodeError) -> MeshError {
    match err {
        NodeError::Remote { ref code, .. } if code == "agent_not_found" => {
            MeshError::AgentNotFound(err.to_string())
        }
        other => MeshError::RelayFailed(other.to_string()),
    }
}

async fn post_event(client: &PeerClient, peer: &str, envelope: &EventEnvelope) -> MeshResult<()> {
    client
        .post::<_, SendEventResponse>("send_event", peer, routes::EVENTS, envelope)
        .await
        .map(|_| ())
        .map_err(relay_error)
}

/// Relay installed on the master bus
#[derive(Debug, Clone)]
pub struct MasterRelay {
    directory: Arc<AgentDirectory>,
    registry: Arc<WorkerRegistry>,
    client: PeerClient,
}

impl MasterRelay {
    pub fn new(
        directory: Arc<AgentDirectory>,
        registry: Arc<WorkerRegistry>,
        client: PeerClient,
    ) -> Self {
        Self {
            directory,
            registry,
            client,
        }
    }

    /// Worker that hosts the sender, which already delivered locally
    fn origin_worker(&self, event: &Event) -> Option<WorkerId> {
        event
            .from()
            .as_agent()
            .and_then(|id| self.directory.lookup(id))
            .map(|location| location.worker_id)
    }

    async fn fan_out(&self, event: &Event) -> MeshResult<()> {
        let skip = self.origin_worker(event);
        let targets: Vec<String> = match event.to() {
            Address::Type(agent_type) => {
                let hosting = self.directory.workers_with_type(agent_type);
                self.registry
                    .list()
                    .into_iter()
                    .filter(|w| hosting.contains(&w.worker_id))
                    .filter(|w| Some(&w.worker_id) != skip.as_ref())
                    .map(|w| w.base_url())
                    .collect()
            }
            _ => self
                .registry
                .list()
                .into_iter()
                .filter(|w| Some(&w.worker_id) != skip.as_ref())
                .map(|w| w.base_url())
                .collect(),
        };

        let envelope = EventEnvelope::from(event);
        let results = join_all(
            targets
                .iter()
                .map(|peer| post_event(&self.client, peer, &envelope)),
        )
        .await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        for (peer, result) in targets.iter().zip(&results) {
            if let Err(err) = result {
                warn!(peer = %peer, kind = %event.kind(), error = %err, "Broadcast to worker failed");
            }
        }
        if failed > 0 && failed == targets.len() {
            return Err(MeshError::RelayFailed(format!(
                "broadcast reached none of {failed} workers"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EventRelay for MasterRelay {
    async fn relay(&self, event: Event) -> MeshResult<()> {
        match event.to() {
            Address::Agent(id) => {
                let location = self
                    .directory
                    .lookup(id)
                    .ok_or_else(|| MeshError::AgentNotFound(id.to_string()))?;
                post_event(
                    &self.client,
                    &location.base_url(),
                    &EventEnvelope::from(&event),
                )
                .await
            }
            Address::All | Address::Type(_) => self.fan_out(&event).await,
            Address::Env => Err(MeshError::RelayFailed(
                "environment is not attached to the master bus".to_string(),
            )),
        }
    }
}

/// Relay installed on a worker bus
#[derive(Debug, Clone)]
pub struct WorkerRelay {
    master_url: String,
    client: PeerClient,
    locations: Arc<DashMap<AgentId, AgentLocation>>,
}

impl WorkerRelay {
    pub fn new(master_url: impl Into<String>, client: PeerClient) -> Self {
        Self {
            master_url: master_url.into(),
            client,
            locations: Arc::new(DashMap::new()),
        }
    }

    pub fn cached_locations(&self) -> usize {
        self.locations.len()
    }

    async fn locate(&self, agent_id: &AgentId) -> MeshResult<AgentLocation> {
        if let Some(location) = self.locations.get(agent_id) {
            return Ok(location.clone());
        }
        let location: AgentLocation = self
            .client
            .get(
                "locate_agent",
                &self.master_url,
                &routes::agent_location(agent_id.as_str()),
            )
            .await
            .map_err(relay_error)?;
        self.locations.insert(agent_id.clone(), location.clone());
        Ok(location)
    }

    async fn send_direct(&self, agent_id: &AgentId, envelope: &EventEnvelope) -> MeshResult<()> {
        let location = self.locate(agent_id).await?;
        match post_event(&self.client, &location.base_url(), envelope).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // the agent may have moved or its worker died; ask the master next time
                self.locations.remove(agent_id);
                debug!(agent_id = %agent_id, error = %err, "Direct delivery failed, routing via master");
                post_event(&self.client, &self.master_url, envelope).await
            }
        }
    }
}

#[async_trait]
impl EventRelay for WorkerRelay {
    async fn relay(&self, event: Event) -> MeshResult<()> {
        let envelope = EventEnvelope::from(&event);
        match event.to() {
            Address::Agent(id) => self.send_direct(id, &envelope).await,
            Address::Env | Address::All | Address::Type(_) => {
                post_event(&self.client, &self.master_url, &envelope).await
            }
        }
    }
}
