//! The master node.
//!
//! Owns the environment, the worker registry, the agent directory and the
//! lock table. Its bus forwards events from one worker to another, so every
//! agent can reach every other agent, and the environment, by id.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use colony_core::{AgentConfig, AgentId, Event, Profile};
use colony_env::{
    SimulationConfig, SimulationEnvironment, SimulationReport, SimulationState,
    ControlBroadcaster, TrailStore,
};
use colony_mesh::{BusConfig, EventBus, LocalLockAuthority, LockAuthority, LockLease, LockRequest};
use colony_observability::{BusCounters, RuntimeMetrics};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::allocator::{AgentAllocator, AllocationPolicy, AllocationReport};
use crate::client::PeerClient;
use crate::config::MasterConfig;
use crate::directory::AgentDirectory;
use crate::error::{NodeError, NodeResult};
use crate::probe::{ClusterBroadcaster, ClusterProbe};
use crate::protocol::{
    AgentDataRequest, AgentLocation, CollectRequest, CollectResponse, DataValueResponse,
    EnvDataRequest, HeartbeatRequest, HeartbeatResponse, RegisterWorkerRequest,
    RegisterWorkerResponse, ReleaseResponse, SendEventRequest, SendEventResponse,
    UpdateEnvDataRequest, UpdateResponse, routes,
};
use crate::registry::{WorkerInfo, WorkerRegistry};
use crate::relay::MasterRelay;

pub struct MasterBuilder {
    config: MasterConfig,
    simulation: SimulationConfig,
    trail: Option<Arc<dyn TrailStore>>,
    profile: Profile,
    policy: AllocationPolicy,
}

impl MasterBuilder {
    pub fn trail_store(mut self, store: Arc<dyn TrailStore>) -> Self {
        self.trail = Some(store);
        self
    }

    /// Initial environment data
    pub fn env_profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    pub fn policy(mut self, policy: AllocationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Wire the master together. Must run inside a tokio runtime.
    pub fn build(self) -> NodeResult<MasterNode> {
        self.config.validate()?;

        let metrics = Arc::new(RuntimeMetrics::new()?);
        let client = PeerClient::new(self.config.request_timeout, self.config.breaker.clone())?
            .with_metrics(Arc::clone(&metrics));
        let registry = Arc::new(WorkerRegistry::new(self.config.heartbeat_timeout));
        let directory = Arc::new(AgentDirectory::new());
        let locks = Arc::new(LocalLockAuthority::new());

        let bus = EventBus::new(BusConfig::default().with_forward_remote(true));
        bus.set_relay(Arc::new(MasterRelay::new(
            Arc::clone(&directory),
            Arc::clone(&registry),
            client.clone(),
        )));

        let broadcaster: Arc<dyn ControlBroadcaster> = Arc::new(ClusterBroadcaster::new(
            Arc::clone(&registry),
            client.clone(),
        ));
        let mut env = SimulationEnvironment::builder(self.simulation, bus.clone())
            .profile(self.profile)
            .probe(Arc::new(ClusterProbe::new(
                bus.clone(),
                Arc::clone(&registry),
                client.clone(),
            )))
            .broadcaster(broadcaster)
            .metrics(Arc::clone(&metrics));
        if let Some(trail) = self.trail {
            env = env.trail_store(trail);
        }
        let env = env.build()?;

        let allocator = AgentAllocator::new(
            Arc::clone(&registry),
            Arc::clone(&directory),
            client.clone(),
            self.policy,
        );

        Ok(MasterNode {
            inner: Arc::new(MasterInner {
                config: self.config,
                bus,
                env,
                registry,
                directory,
                locks,
                client,
                metrics,
                allocator,
                cancel: CancellationToken::new(),
            }),
        })
    }
}

struct MasterInner {
    config: MasterConfig,
    bus: EventBus,
    env: SimulationEnvironment,
    registry: Arc<WorkerRegistry>,
    directory: Arc<AgentDirectory>,
    locks: Arc<LocalLockAuthority>,
    client: PeerClient,
    metrics: Arc<RuntimeMetrics>,
    allocator: AgentAllocator,
    cancel: CancellationToken,
}

/// Handle to the master; cheap to clone
#[derive(Clone)]
pub struct MasterNode {
    inner: Arc<MasterInner>,
}

impl std::fmt::Debug for MasterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterNode")
            .field("workers", &self.inner.registry.len())
            .field("agents", &self.inner.directory.len())
            .field("env", &self.inner.env)
            .finish()
    }
}

impl MasterNode {
    pub fn builder(config: MasterConfig, simulation: SimulationConfig) -> MasterBuilder {
        MasterBuilder {
            config,
            simulation,
            trail: None,
            profile: Profile::new(),
            policy: AllocationPolicy::default(),
        }
    }

    pub fn config(&self) -> &MasterConfig {
        &self.inner.config
    }

    pub fn env(&self) -> &SimulationEnvironment {
        &self.inner.env
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.inner.registry
    }

    pub fn directory(&self) -> &AgentDirectory {
        &self.inner.directory
    }

    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.inner.metrics
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(routes::REGISTER_WORKER, post(register_worker))
            .route(routes::HEARTBEAT, post(heartbeat))
            .route(routes::EVENTS, post(receive_event))
            .route(routes::AGENT_LOCATION, get(locate_agent))
            .route(routes::ENV_GET, post(get_env_data))
            .route(routes::ENV_UPDATE, post(update_env_data))
            .route(routes::AGENT_DATA_GET, post(get_agent_data))
            .route(routes::AGENT_DATA_BY_TYPE, post(get_agent_data_by_type))
            .route(routes::LOCK_ACQUIRE, post(acquire_lock))
            .route(routes::LOCK_RELEASE, post(release_lock))
            .route(routes::METRICS, get(metrics_endpoint))
            .with_state(self.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address
    pub async fn bind(&self) -> NodeResult<TcpListener> {
        let addr = self.inner.config.bind_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| NodeError::Bind { addr, source })
    }

    /// Serve RPCs on `listener` until [`MasterNode::shutdown`] is called.
    /// Also runs the heartbeat sweeper and the lock lease sweeper.
    pub async fn serve(&self, listener: TcpListener) -> NodeResult<()> {
        let local = listener
            .local_addr()
            .map_err(|e| NodeError::Server(e.to_string()))?;
        info!(addr = %local, "Master listening");

        let sweeper = self.spawn_registry_sweeper();
        let lock_sweeper = self.spawn_lock_sweeper();

        let cancel = self.inner.cancel.clone();
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| NodeError::Server(e.to_string()));

        sweeper.abort();
        lock_sweeper.abort();
        info!("Master stopped");
        result
    }

    /// [`MasterNode::serve`] on a background task
    pub fn spawn(&self, listener: TcpListener) -> JoinHandle<NodeResult<()>> {
        let node = self.clone();
        tokio::spawn(async move { node.serve(listener).await })
    }

    fn spawn_registry_sweeper(&self) -> JoinHandle<()> {
        let directory = Arc::clone(&self.inner.directory);
        let metrics = Arc::clone(&self.inner.metrics);
        Arc::clone(&self.inner.registry).spawn_sweeper(
            self.inner.config.sweep_interval,
            self.inner.cancel.clone(),
            move |expired, registered| {
                for worker_id in expired {
                    let dropped = directory.remove_worker(worker_id);
                    if dropped > 0 {
                        warn!(%worker_id, dropped, "Forgot agents of expired worker");
                    }
                }
                metrics.set_workers_registered(registered);
            },
        )
    }

    fn spawn_lock_sweeper(&self) -> JoinHandle<()> {
        let locks = Arc::clone(&self.inner.locks);
        let cancel = self.inner.cancel.clone();
        let every = self.inner.config.eviction_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        locks.sweep_expired();
                    }
                }
            }
        })
    }

    /// Block until at least `expected` workers are registered
    ///
    /// # Errors
    ///
    /// [`NodeError::WorkersUnavailable`] once `timeout` has passed.
    pub async fn wait_for_workers(&self, expected: usize, timeout: Duration) -> NodeResult<()> {
        let started = Instant::now();
        loop {
            let registered = self.inner.registry.len();
            if registered >= expected {
                info!(registered, expected, "Workers ready");
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(NodeError::WorkersUnavailable {
                    expected,
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn allocate(&self, configs: Vec<AgentConfig>) -> NodeResult<AllocationReport> {
        self.inner.allocator.allocate(configs).await
    }

    /// Start the simulation and wait for it to finish
    pub async fn run_simulation(&self) -> NodeResult<SimulationReport> {
        self.inner.env.start()?;
        Ok(self.inner.env.wait_finished().await)
    }

    /// Terminate a running simulation, stop the workers and the server
    pub async fn shutdown(&self, reason: &str) {
        if matches!(
            self.inner.env.state(),
            SimulationState::Running | SimulationState::Paused
        ) {
            if let Err(err) = self.inner.env.terminate(reason).await {
                warn!(error = %err, "Termination during shutdown failed");
            }
        }
        self.inner.client.begin_shutdown();
        self.inner.cancel.cancel();
        self.inner.bus.shutdown();
    }

    /// Look up an agent's location, or fail with `AgentNotFound`
    fn locate(&self, agent_id: &AgentId) -> NodeResult<AgentLocation> {
        self.inner
            .directory
            .lookup(agent_id)
            .ok_or_else(|| NodeError::AgentNotFound(agent_id.to_string()))
    }

    fn workers_for_type(&self, agent_type: &str) -> Vec<WorkerInfo> {
        let hosting = self.inner.directory.workers_with_type(agent_type);
        self.inner
            .registry
            .list()
            .into_iter()
            .filter(|worker| hosting.contains(&worker.worker_id))
            .collect()
    }
}

async fn register_worker(
    State(master): State<MasterNode>,
    Json(request): Json<RegisterWorkerRequest>,
) -> NodeResult<Json<RegisterWorkerResponse>> {
    let info = master.inner.registry.register(request)?;
    master
        .inner
        .metrics
        .set_workers_registered(master.inner.registry.len());
    Ok(Json(RegisterWorkerResponse {
        success: true,
        message: format!("worker {} registered", info.worker_id),
    }))
}

async fn heartbeat(
    State(master): State<MasterNode>,
    Json(request): Json<HeartbeatRequest>,
) -> Json<HeartbeatResponse> {
    let known = master.inner.registry.heartbeat(&request.worker_id);
    if !known {
        warn!(worker_id = %request.worker_id, "Heartbeat from unknown worker");
    }
    Json(HeartbeatResponse {
        acknowledged: known,
        reregister_required: !known,
    })
}

async fn receive_event(
    State(master): State<MasterNode>,
    Json(envelope): Json<SendEventRequest>,
) -> NodeResult<Json<SendEventResponse>> {
    let event = Event::try_from(envelope)?;
    master.inner.bus.dispatch_remote(event)?;
    Ok(Json(SendEventResponse { received: true }))
}

async fn locate_agent(
    State(master): State<MasterNode>,
    Path(agent_id): Path<String>,
) -> NodeResult<Json<AgentLocation>> {
    let agent_id = AgentId::parse(&agent_id)
        .map_err(|e| NodeError::invalid_request(format!("agent id '{agent_id}': {e}")))?;
    Ok(Json(master.locate(&agent_id)?))
}

async fn get_env_data(
    State(master): State<MasterNode>,
    Json(request): Json<EnvDataRequest>,
) -> Json<DataValueResponse> {
    Json(DataValueResponse {
        value: master.inner.env.get_data(&request.key).await,
    })
}

async fn update_env_data(
    State(master): State<MasterNode>,
    Json(request): Json<UpdateEnvDataRequest>,
) -> Json<UpdateResponse> {
    master.inner.env.update_data(request.key, request.value).await;
    Json(UpdateResponse { success: true })
}

async fn get_agent_data(
    State(master): State<MasterNode>,
    Json(request): Json<AgentDataRequest>,
) -> NodeResult<Json<DataValueResponse>> {
    let location = master.locate(&request.agent_id)?;
    let response = master
        .inner
        .client
        .post(
            "get_agent_data",
            &location.base_url(),
            routes::AGENT_DATA_GET,
            &request,
        )
        .await?;
    Ok(Json(response))
}

async fn get_agent_data_by_type(
    State(master): State<MasterNode>,
    Json(request): Json<CollectRequest>,
) -> Json<CollectResponse> {
    let workers = master.workers_for_type(&request.agent_type);
    let calls = workers.iter().map(|worker| {
        let peer = worker.base_url();
        let client = &master.inner.client;
        let request = &request;
        async move {
            let result = client
                .post::<_, CollectResponse>("collect", &peer, routes::COLLECT, request)
                .await;
            (peer, result)
        }
    });

    let mut values = BTreeMap::new();
    for (peer, result) in join_all(calls).await {
        match result {
            Ok(response) => values.extend(response.values),
            Err(err) => warn!(peer = %peer, error = %err, "Collect from worker failed"),
        }
    }
    Json(CollectResponse { values })
}

async fn acquire_lock(
    State(master): State<MasterNode>,
    Json(request): Json<LockRequest>,
) -> NodeResult<Json<LockLease>> {
    Ok(Json(master.inner.locks.acquire(request).await?))
}

async fn release_lock(
    State(master): State<MasterNode>,
    Json(lease): Json<LockLease>,
) -> NodeResult<Json<ReleaseResponse>> {
    let released = master.inner.locks.release(&lease).await?;
    Ok(Json(ReleaseResponse { released }))
}

async fn metrics_endpoint(State(master): State<MasterNode>) -> NodeResult<String> {
    let stats = master.inner.bus.stats();
    master.inner.metrics.observe_bus(BusCounters {
        dispatched: stats.dispatched,
        dropped_no_route: stats.dropped_no_route,
        dropped_stopped: stats.dropped_stopped,
        unhandled: stats.unhandled,
        relay_failures: stats.relay_failures,
        pending: stats.pending,
    });
    master
        .inner
        .metrics
        .set_workers_registered(master.inner.registry.len());
    Ok(master.inner.metrics.render()?)
}
