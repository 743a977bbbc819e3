//! Master-side registry of live workers

use chrono::{DateTime, Utc};
use colony_core::WorkerId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{NodeError, NodeResult};
use crate::protocol::{RegisterWorkerRequest, base_url};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub address: String,
    pub port: u16,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerInfo {
    pub fn base_url(&self) -> String {
        base_url(&self.address, self.port)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    info: WorkerInfo,
    last_seen: Instant,
}

pub struct WorkerRegistry {
    workers: DashMap<WorkerId, Entry>,
    heartbeat_timeout: Duration,
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.workers.len())
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .finish()
    }
}

impl WorkerRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            workers: DashMap::new(),
            heartbeat_timeout,
        }
    }

    /// Add a worker. A live worker with the same id is rejected; a stale one
    /// is replaced.
    pub fn register(&self, request: RegisterWorkerRequest) -> NodeResult<WorkerInfo> {
        let now = Utc::now();
        let info = WorkerInfo {
            worker_id: request.worker_id.clone(),
            address: request.address,
            port: request.port,
            registered_at: now,
            last_heartbeat: now,
        };

        match self.workers.entry(request.worker_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                if existing.get().last_seen.elapsed() < self.heartbeat_timeout {
                    return Err(NodeError::DuplicateWorker(request.worker_id.to_string()));
                }
                warn!(worker_id = %request.worker_id, "Replacing stale worker registration");
                existing.insert(Entry {
                    info: info.clone(),
                    last_seen: Instant::now(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Entry {
                    info: info.clone(),
                    last_seen: Instant::now(),
                });
            }
        }

        info!(
            worker_id = %info.worker_id,
            address = %info.address,
            port = info.port,
            "Worker registered"
        );
        Ok(info)
    }

    /// Refresh a worker's heartbeat. `false` means it must register again.
    pub fn heartbeat(&self, worker_id: &WorkerId) -> bool {
        match self.workers.get_mut(worker_id) {
            Some(mut entry) => {
                entry.last_seen = Instant::now();
                entry.info.last_heartbeat = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, worker_id: &WorkerId) -> Option<WorkerInfo> {
        self.workers.remove(worker_id).map(|(_, entry)| entry.info)
    }

    pub fn get(&self, worker_id: &WorkerId) -> Option<WorkerInfo> {
        self.workers.get(worker_id).map(|entry| entry.info.clone())
    }

    /// All workers ordered by id
    pub fn list(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> = self
            .workers
            .iter()
            .map(|entry| entry.info.clone())
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Drop workers whose heartbeat is older than the timeout
    pub fn sweep_expired(&self) -> Vec<WorkerId> {
        let expired: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|entry| entry.last_seen.elapsed() >= self.heartbeat_timeout)
            .map(|entry| entry.key().clone())
            .collect();
        for worker_id in &expired {
            self.workers.remove(worker_id);
            warn!(%worker_id, "Worker heartbeat expired, dropped from registry");
        }
        expired
    }

    /// Run [`WorkerRegistry::sweep_expired`] every `every` until cancelled.
    /// `on_sweep` sees the dropped ids and the registry size after each pass.
    pub fn spawn_sweeper<F>(
        self: Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
        on_sweep: F,
    ) -> JoinHandle<()>
    where
        F: Fn(&[WorkerId], usize) + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = self.sweep_expired();
                        on_sweep(&expired, self.len());
                    }
                }
            }
        })
    }
}
