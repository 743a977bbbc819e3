//! Cluster-wide views used by the master environment

use async_trait::async_trait;
use colony_core::WorkerId;
use colony_env::{ActivityProbe, ActivitySnapshot, ControlBroadcaster};
use colony_mesh::EventBus;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::client::{Delivery, PeerClient};
use crate::protocol::{AckResponse, ControlRequest, StatusResponse, StopRequest, routes};
use crate::registry::WorkerRegistry;

/// Merges the master bus with the `Status` of every registered worker.
/// Workers that do not answer are left out of the picture.
#[derive(Debug, Clone)]
pub struct ClusterProbe {
    bus: EventBus,
    registry: Arc<WorkerRegistry>,
    client: PeerClient,
}

impl ClusterProbe {
    pub fn new(bus: EventBus, registry: Arc<WorkerRegistry>, client: PeerClient) -> Self {
        Self {
            bus,
            registry,
            client,
        }
    }
}

#[async_trait]
impl ActivityProbe for ClusterProbe {
    async fn snapshot(&self) -> ActivitySnapshot {
        let workers = self.registry.list();
        let calls = workers.iter().map(|worker| {
            let peer = worker.base_url();
            async move {
                let result = self
                    .client
                    .get::<StatusResponse>("status", &peer, routes::STATUS)
                    .await;
                (peer, result)
            }
        });

        let mut snapshot = ActivitySnapshot::of_bus(&self.bus);
        for (peer, result) in join_all(calls).await {
            match result {
                Ok(status) => snapshot = snapshot.merge(status.activity),
                Err(err) => warn!(peer = %peer, error = %err, "Worker status unavailable"),
            }
        }
        snapshot
    }
}

/// Fans pause, resume and `StopSimulation` out to every registered worker.
/// Unreachable workers are logged and skipped; during shutdown they are
/// assumed stopped.
#[derive(Debug, Clone)]
pub struct ClusterBroadcaster {
    registry: Arc<WorkerRegistry>,
    client: PeerClient,
}

impl ClusterBroadcaster {
    pub fn new(registry: Arc<WorkerRegistry>, client: PeerClient) -> Self {
        Self { registry, client }
    }

    /// One acknowledgement call per worker; returns (workers, acknowledged)
    async fn fan_out<Req, F>(&self, op: &'static str, path: &str, request_for: F) -> (usize, usize)
    where
        Req: Serialize + Send + Sync,
        F: Fn(&WorkerId) -> Req,
    {
        let workers = self.registry.list();
        let calls = workers.iter().map(|worker| {
            let request = request_for(&worker.worker_id);
            let peer = worker.base_url();
            async move {
                let delivery = self
                    .client
                    .acknowledge::<_, AckResponse>(op, &peer, path, &request)
                    .await;
                (peer, delivery)
            }
        });

        let mut acknowledged = 0;
        for (peer, delivery) in join_all(calls).await {
            match delivery {
                Delivery::Delivered => acknowledged += 1,
                Delivery::Assumed => {}
                Delivery::Failed(err) => warn!(peer = %peer, op, error = %err, "Control call failed"),
            }
        }
        (workers.len(), acknowledged)
    }
}

#[async_trait]
impl ControlBroadcaster for ClusterBroadcaster {
    async fn broadcast_pause(&self) {
        let (workers, acknowledged) = self
            .fan_out("pause", routes::PAUSE, |id| ControlRequest {
                worker_id: Some(id.clone()),
            })
            .await;
        info!(workers, acknowledged, "Pause broadcast to workers");
    }

    async fn broadcast_resume(&self) {
        let (workers, acknowledged) = self
            .fan_out("resume", routes::RESUME, |id| ControlRequest {
                worker_id: Some(id.clone()),
            })
            .await;
        info!(workers, acknowledged, "Resume broadcast to workers");
    }

    async fn broadcast_termination(&self, reason: &str) {
        self.client.begin_shutdown();
        let (workers, acknowledged) = self
            .fan_out("stop", routes::STOP, |id| StopRequest {
                worker_id: Some(id.clone()),
                reason: reason.to_string(),
            })
            .await;
        info!(workers, acknowledged, reason, "Termination broadcast to workers");
    }
}
