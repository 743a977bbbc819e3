//! Process-local collection of agent runtimes

use colony_core::{AgentConfig, AgentId, Profile};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::error::{MeshError, MeshResult};
use crate::handler::HandlerTable;
use crate::lock::LockAuthority;
use crate::runtime::{AgentDefinition, AgentHandle, AgentStatus, RuntimeConfig, spawn_agent};

/// Builds agent definitions from their serializable configuration
pub trait AgentFactory: Send + Sync + 'static {
    fn create(&self, config: &AgentConfig) -> MeshResult<AgentDefinition>;
}

type Blueprint = Arc<dyn Fn(&AgentConfig) -> MeshResult<HandlerTable> + Send + Sync>;

/// [`AgentFactory`] keyed by agent type
#[derive(Clone, Default)]
pub struct AgentTypeRegistry {
    blueprints: HashMap<String, Blueprint>,
}

impl std::fmt::Debug for AgentTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTypeRegistry")
            .field("types", &self.blueprints.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AgentTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler table builder for one agent type
    pub fn register<F>(mut self, agent_type: impl Into<String>, build: F) -> Self
    where
        F: Fn(&AgentConfig) -> MeshResult<HandlerTable> + Send + Sync + 'static,
    {
        self.blueprints.insert(agent_type.into(), Arc::new(build));
        self
    }

    pub fn knows(&self, agent_type: &str) -> bool {
        self.blueprints.contains_key(agent_type)
    }
}

impl AgentFactory for AgentTypeRegistry {
    fn create(&self, config: &AgentConfig) -> MeshResult<AgentDefinition> {
        let build = self
            .blueprints
            .get(&config.agent_type)
            .ok_or_else(|| MeshError::UnknownAgentType(config.agent_type.clone()))?;
        let handlers = build(config)?;
        Ok(
            AgentDefinition::new(config.agent_id.clone(), config.agent_type.clone(), handlers)
                .with_profile(Profile::from(config.profile.clone())),
        )
    }
}

/// Owns the agent runtimes running in this process
pub struct AgentHost {
    bus: EventBus,
    locks: Arc<dyn LockAuthority>,
    factory: Arc<dyn AgentFactory>,
    config: RuntimeConfig,
    agents: DashMap<AgentId, AgentHandle>,
}

impl std::fmt::Debug for AgentHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHost")
            .field("agents", &self.agents.len())
            .finish()
    }
}

impl AgentHost {
    pub fn new(
        bus: EventBus,
        locks: Arc<dyn LockAuthority>,
        factory: Arc<dyn AgentFactory>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            bus,
            locks,
            factory,
            config,
            agents: DashMap::new(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Build and start an agent from its configuration
    pub fn create(&self, config: &AgentConfig) -> MeshResult<AgentId> {
        let definition = self.factory.create(config)?;
        self.spawn(definition)
    }

    /// Start an already-built agent
    ///
    /// # Errors
    ///
    /// [`MeshError::AgentAlreadyRegistered`] if the id is already live here.
    pub fn spawn(&self, definition: AgentDefinition) -> MeshResult<AgentId> {
        if let Some(existing) = self.agents.get(&definition.id) {
            if existing.status() == AgentStatus::Running {
                return Err(MeshError::AgentAlreadyRegistered(definition.id.to_string()));
            }
        }
        let handle = spawn_agent(definition, &self.bus, Arc::clone(&self.locks), &self.config)?;
        let id = handle.id().clone();
        self.agents.insert(id.clone(), handle);
        Ok(id)
    }

    pub fn get(&self, id: &AgentId) -> Option<AgentHandle> {
        self.agents.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn running_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|entry| entry.status() == AgentStatus::Running)
            .count()
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agents.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Read one key of a local agent's profile
    pub async fn read(&self, id: &AgentId, key: &str) -> MeshResult<Option<Value>> {
        let handle = self
            .get(id)
            .ok_or_else(|| MeshError::AgentNotFound(id.to_string()))?;
        let profile = handle.profile().read().await;
        Ok(profile.get(key).cloned())
    }

    /// Write one key of a local agent's profile
    pub async fn write(&self, id: &AgentId, key: &str, value: Value) -> MeshResult<()> {
        let handle = self
            .get(id)
            .ok_or_else(|| MeshError::AgentNotFound(id.to_string()))?;
        handle.profile().write().await.update(key, value);
        Ok(())
    }

    /// `key` from every local agent of `agent_type` that has it
    pub async fn collect(&self, agent_type: &str, key: &str) -> HashMap<AgentId, Value> {
        let handles: Vec<AgentHandle> = self
            .agents
            .iter()
            .filter(|entry| entry.agent_type() == agent_type)
            .map(|entry| entry.value().clone())
            .collect();

        let mut values = HashMap::with_capacity(handles.len());
        for handle in handles {
            if let Some(value) = handle.profile().read().await.get(key) {
                values.insert(handle.id().clone(), value.clone());
            }
        }
        values
    }

    /// Stop every runtime and wait up to `grace` for each to finish
    pub async fn shutdown(&self, grace: Duration) {
        let handles: Vec<AgentHandle> = self.agents.iter().map(|e| e.value().clone()).collect();
        for handle in &handles {
            handle.stop();
        }
        for handle in handles {
            if tokio::time::timeout(grace, handle.join()).await.is_err() {
                warn!(agent_id = %handle.id(), "Agent did not stop within grace period");
            }
        }
        info!(agents = self.agents.len(), "Agent host shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::lock::LocalLockAuthority;
    use serde_json::json;

    fn host() -> AgentHost {
        let registry = AgentTypeRegistry::new()
            .register("trader", |_config| Ok(HandlerTable::default()));
        AgentHost::new(
            EventBus::new(BusConfig::default()),
            Arc::new(LocalLockAuthority::new()),
            Arc::new(registry),
            RuntimeConfig::default(),
        )
    }

    fn config(id: &str, agent_type: &str) -> AgentConfig {
        AgentConfig::new(AgentId::parse(id).unwrap(), agent_type).with_profile_field("cash", 100)
    }

    #[tokio::test]
    async fn test_create_and_read_profile() {
        let host = host();
        let id = host.create(&config("t1", "trader")).unwrap();
        assert_eq!(host.read(&id, "cash").await.unwrap(), Some(json!(100)));

        host.write(&id, "cash", json!(80)).await.unwrap();
        assert_eq!(host.read(&id, "cash").await.unwrap(), Some(json!(80)));
        assert!(host.bus().is_local(&id));
    }

    #[tokio::test]
    async fn test_unknown_type_and_duplicate_id() {
        let host = host();
        assert!(matches!(
            host.create(&config("x", "alien")),
            Err(MeshError::UnknownAgentType(_))
        ));

        host.create(&config("t1", "trader")).unwrap();
        assert!(matches!(
            host.create(&config("t1", "trader")),
            Err(MeshError::AgentAlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_collect_by_type() {
        let host = host();
        host.create(&config("t1", "trader")).unwrap();
        host.create(&config("t2", "trader")).unwrap();

        let values = host.collect("trader", "cash").await;
        assert_eq!(values.len(), 2);
        assert!(host.collect("trader", "debt").await.is_empty());
        assert!(host.collect("broker", "cash").await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_all() {
        let host = host();
        host.create(&config("t1", "trader")).unwrap();
        host.create(&config("t2", "trader")).unwrap();
        assert_eq!(host.running_count(), 2);

        host.shutdown(Duration::from_secs(1)).await;
        assert_eq!(host.running_count(), 0);
    }

    #[tokio::test]
    async fn test_read_unknown_agent() {
        let host = host();
        let missing = AgentId::parse("ghost").unwrap();
        assert!(matches!(
            host.read(&missing, "cash").await,
            Err(MeshError::AgentNotFound(_))
        ));
    }
}
