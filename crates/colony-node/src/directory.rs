//! Master-side map from agent id to the worker hosting it

use colony_core::{AgentId, WorkerId};
use dashmap::DashMap;
use std::collections::BTreeMap;

use crate::protocol::AgentLocation;

#[derive(Debug, Default)]
pub struct AgentDirectory {
    locations: DashMap<AgentId, AgentLocation>,
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record where an agent lives, replacing any earlier location
    pub fn record(&self, agent_id: AgentId, location: AgentLocation) {
        self.locations.insert(agent_id, location);
    }

    pub fn lookup(&self, agent_id: &AgentId) -> Option<AgentLocation> {
        self.locations.get(agent_id).map(|entry| entry.clone())
    }

    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.locations.contains_key(agent_id)
    }

    pub fn remove(&self, agent_id: &AgentId) -> Option<AgentLocation> {
        self.locations.remove(agent_id).map(|(_, location)| location)
    }

    /// Forget every agent hosted by a worker. Returns how many were dropped.
    pub fn remove_worker(&self, worker_id: &WorkerId) -> usize {
        let before = self.locations.len();
        self.locations
            .retain(|_, location| location.worker_id != *worker_id);
        before - self.locations.len()
    }

    pub fn count_on(&self, worker_id: &WorkerId) -> usize {
        self.locations
            .iter()
            .filter(|entry| entry.worker_id == *worker_id)
            .count()
    }

    pub fn counts_by_worker(&self) -> BTreeMap<WorkerId, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.locations.iter() {
            *counts.entry(entry.worker_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// All known agent ids, sorted
    pub fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.locations.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Workers hosting at least one agent of `agent_type`
    pub fn workers_with_type(&self, agent_type: &str) -> Vec<WorkerId> {
        let mut workers: Vec<WorkerId> = self
            .locations
            .iter()
            .filter(|entry| entry.agent_type == agent_type)
            .map(|entry| entry.worker_id.clone())
            .collect();
        workers.sort();
        workers.dedup();
        workers
    }
}
