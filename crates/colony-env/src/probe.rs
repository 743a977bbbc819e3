//! Seams between the environment and the rest of the cluster

use async_trait::async_trait;
use colony_mesh::EventBus;
use serde::{Deserialize, Serialize};

/// Work outstanding somewhere in the cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    pub pending: usize,
    pub active_handlers: usize,
    /// Time since the last activity, in milliseconds
    pub idle_ms: u64,
}

impl ActivitySnapshot {
    pub fn is_quiet(&self) -> bool {
        self.pending == 0 && self.active_handlers == 0
    }

    /// Combine two nodes' views: work adds up, idleness is the shorter of the two
    pub fn merge(self, other: Self) -> Self {
        Self {
            pending: self.pending + other.pending,
            active_handlers: self.active_handlers + other.active_handlers,
            idle_ms: self.idle_ms.min(other.idle_ms),
        }
    }

    pub fn of_bus(bus: &EventBus) -> Self {
        Self {
            pending: bus.pending(),
            active_handlers: bus.active_handlers(),
            idle_ms: u64::try_from(bus.idle_for().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Source of the activity picture used for idle detection
#[async_trait]
pub trait ActivityProbe: Send + Sync + 'static {
    async fn snapshot(&self) -> ActivitySnapshot;
}

/// Activity of a single local bus
#[derive(Debug, Clone)]
pub struct BusProbe {
    bus: EventBus,
}

impl BusProbe {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl ActivityProbe for BusProbe {
    async fn snapshot(&self) -> ActivitySnapshot {
        ActivitySnapshot::of_bus(&self.bus)
    }
}

/// Carries simulation control to remote processes. Every call must return
/// even when peers are unreachable.
#[async_trait]
pub trait ControlBroadcaster: Send + Sync + 'static {
    /// Hold event delivery on every remote bus
    async fn broadcast_pause(&self);

    /// Release remote buses; each one restarts its idle clock
    async fn broadcast_resume(&self);

    /// The simulation is over
    async fn broadcast_termination(&self, reason: &str);
}
