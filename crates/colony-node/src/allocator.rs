//! Assignment of agent configs to workers.
//!
//! The plan is computed up front by [`plan_assignments`], then each worker
//! receives a single `CreateAgentsBatch` call. All batches run concurrently.
//! A failed batch fails only its own agents.

use colony_core::{AgentConfig, AgentId, WorkerId};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

use crate::client::PeerClient;
use crate::directory::AgentDirectory;
use crate::error::{NodeError, NodeResult};
use crate::protocol::{
    AgentFailure, AgentLocation, CreateAgentsBatchRequest, CreateAgentsResponse, routes,
};
use crate::registry::{WorkerInfo, WorkerRegistry};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    #[default]
    RoundRobin,
    /// Always the worker currently hosting the fewest agents
    LeastLoaded,
}

impl FromStr for AllocationPolicy {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "least_loaded" | "leastloaded" => Ok(Self::LeastLoaded),
            other => Err(NodeError::invalid_request(format!(
                "unknown allocation policy '{other}'"
            ))),
        }
    }
}

/// Worker index for each of `count` new agents.
///
/// `loads` holds the current agent count of each worker; `cursor` is where
/// round-robin resumes. Ties in least-loaded go to the lowest index.
pub fn plan_assignments(
    policy: AllocationPolicy,
    loads: &[usize],
    count: usize,
    cursor: usize,
) -> Vec<usize> {
    if loads.is_empty() {
        return Vec::new();
    }
    match policy {
        AllocationPolicy::RoundRobin => (0..count).map(|i| (cursor + i) % loads.len()).collect(),
        AllocationPolicy::LeastLoaded => {
            let mut loads = loads.to_vec();
            (0..count)
                .map(|_| {
                    let (index, _) = loads
                        .iter()
                        .enumerate()
                        .min_by_key(|(index, load)| (**load, *index))
                        .unwrap_or((0, &0));
                    loads[index] += 1;
                    index
                })
                .collect()
        }
    }
}

/// Outcome of one allocation call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationReport {
    pub allocated: BTreeMap<AgentId, WorkerId>,
    pub failures: Vec<AgentFailure>,
}

impl AllocationReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug)]
pub struct AgentAllocator {
    registry: Arc<WorkerRegistry>,
    directory: Arc<AgentDirectory>,
    client: PeerClient,
    policy: AllocationPolicy,
    cursor: AtomicUsize,
}

impl AgentAllocator {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        directory: Arc<AgentDirectory>,
        client: PeerClient,
        policy: AllocationPolicy,
    ) -> Self {
        Self {
            registry,
            directory,
            client,
            policy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> AllocationPolicy {
        self.policy
    }

    /// Create every config on some worker
    ///
    /// # Errors
    ///
    /// [`NodeError::NoWorkers`] when nobody is registered. Per-agent problems
    /// are reported in [`AllocationReport::failures`] instead.
    pub async fn allocate(&self, configs: Vec<AgentConfig>) -> NodeResult<AllocationReport> {
        let workers = self.registry.list();
        if workers.is_empty() {
            return Err(NodeError::NoWorkers);
        }

        let mut report = AllocationReport::default();
        let mut seen = HashSet::new();
        let mut accepted = Vec::with_capacity(configs.len());
        for config in configs {
            if self.directory.contains(&config.agent_id) || !seen.insert(config.agent_id.clone()) {
                report.failures.push(AgentFailure {
                    agent_id: config.agent_id.clone(),
                    error: format!("duplicate agent id '{}'", config.agent_id),
                });
                continue;
            }
            accepted.push(config);
        }

        let loads: Vec<usize> = workers
            .iter()
            .map(|w| self.directory.count_on(&w.worker_id))
            .collect();
        let cursor = self.cursor.fetch_add(accepted.len(), Ordering::Relaxed);
        let plan = plan_assignments(self.policy, &loads, accepted.len(), cursor);

        let mut batches: BTreeMap<usize, Vec<AgentConfig>> = BTreeMap::new();
        for (config, index) in accepted.into_iter().zip(plan) {
            batches.entry(index).or_default().push(config);
        }

        let calls = batches
            .into_iter()
            .map(|(index, configs)| self.create_batch(&workers[index], configs));
        for (worker, configs, result) in join_all(calls).await {
            self.settle(worker, configs, result, &mut report);
        }

        info!(
            allocated = report.allocated.len(),
            failed = report.failures.len(),
            workers = workers.len(),
            policy = ?self.policy,
            "Agent allocation finished"
        );
        Ok(report)
    }

    async fn create_batch<'a>(
        &self,
        worker: &'a WorkerInfo,
        configs: Vec<AgentConfig>,
    ) -> (
        &'a WorkerInfo,
        Vec<AgentConfig>,
        NodeResult<CreateAgentsResponse>,
    ) {
        let request = CreateAgentsBatchRequest { configs };
        let result = self
            .client
            .post(
                "create_agents",
                &worker.base_url(),
                routes::AGENTS_BATCH,
                &request,
            )
            .await;
        (worker, request.configs, result)
    }

    fn settle(
        &self,
        worker: &WorkerInfo,
        configs: Vec<AgentConfig>,
        result: NodeResult<CreateAgentsResponse>,
        report: &mut AllocationReport,
    ) {
        match result {
            Ok(response) => {
                let types: BTreeMap<AgentId, String> = configs
                    .into_iter()
                    .map(|c| (c.agent_id, c.agent_type))
                    .collect();
                for agent_id in response.agent_ids {
                    let agent_type = types.get(&agent_id).cloned().unwrap_or_default();
                    self.directory.record(
                        agent_id.clone(),
                        AgentLocation {
                            worker_id: worker.worker_id.clone(),
                            address: worker.address.clone(),
                            port: worker.port,
                            agent_type,
                        },
                    );
                    report
                        .allocated
                        .insert(agent_id, worker.worker_id.clone());
                }
                report.failures.extend(response.failures);
            }
            Err(err) => {
                warn!(
                    worker_id = %worker.worker_id,
                    agents = configs.len(),
                    error = %err,
                    "Batch creation failed"
                );
                report
                    .failures
                    .extend(configs.into_iter().map(|config| AgentFailure {
                        agent_id: config.agent_id,
                        error: err.to_string(),
                    }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::protocol::RegisterWorkerRequest;
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case(AllocationPolicy::RoundRobin, &[0, 0, 0], 5, 0, vec![0, 1, 2, 0, 1])]
    #[case(AllocationPolicy::RoundRobin, &[0, 0], 3, 1, vec![1, 0, 1])]
    #[case(AllocationPolicy::LeastLoaded, &[2, 0, 1], 3, 0, vec![1, 1, 2])]
    #[case(AllocationPolicy::LeastLoaded, &[1, 1], 2, 7, vec![0, 1])]
    fn test_plan(
        #[case] policy: AllocationPolicy,
        #[case] loads: &[usize],
        #[case] count: usize,
        #[case] cursor: usize,
        #[case] expected: Vec<usize>,
    ) {
        assert_eq!(plan_assignments(policy, loads, count, cursor), expected);
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!(
            "least-loaded".parse::<AllocationPolicy>().unwrap(),
            AllocationPolicy::LeastLoaded
        );
        assert_eq!(
            "round_robin".parse::<AllocationPolicy>().unwrap(),
            AllocationPolicy::RoundRobin
        );
        assert!("random".parse::<AllocationPolicy>().is_err());
    }

    fn allocator(registry: Arc<WorkerRegistry>) -> AgentAllocator {
        AgentAllocator::new(
            registry,
            Arc::new(AgentDirectory::new()),
            PeerClient::new(Duration::from_millis(200), CircuitBreakerConfig::default()).unwrap(),
            AllocationPolicy::RoundRobin,
        )
    }

    #[tokio::test]
    async fn test_no_workers() {
        let allocator = allocator(Arc::new(WorkerRegistry::new(Duration::from_secs(30))));
        let configs = vec![AgentConfig::new(AgentId::parse("a1").unwrap(), "counter")];
        assert!(matches!(
            allocator.allocate(configs).await,
            Err(NodeError::NoWorkers)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_worker_fails_its_batch_and_duplicates() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        registry
            .register(RegisterWorkerRequest {
                worker_id: WorkerId::parse("w1").unwrap(),
                address: "127.0.0.1".into(),
                port: 9,
            })
            .unwrap();
        let allocator = allocator(registry);

        let a1 = AgentId::parse("a1").unwrap();
        let configs = vec![
            AgentConfig::new(a1.clone(), "counter"),
            AgentConfig::new(a1.clone(), "counter"),
            AgentConfig::new(AgentId::parse("a2").unwrap(), "counter"),
        ];
        let report = allocator.allocate(configs).await.unwrap();
        assert!(report.allocated.is_empty());
        assert_eq!(report.failures.len(), 3);
        assert!(report.failures[0].error.contains("duplicate"));
        assert!(!report.is_complete());
    }
}
