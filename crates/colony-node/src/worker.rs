//! The worker node.
//!
//! Hosts agents, accepts forwarded events into its local bus and answers
//! data and status calls. After its server is up it registers with the
//! master (retrying with backoff) and keeps the registration alive with
//! heartbeats.

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use colony_core::{Address, AgentConfig, Event, EventKind, TerminationNotice, WorkerId};
use colony_env::ActivitySnapshot;
use colony_mesh::{AgentFactory, AgentHost, BusConfig, EventBus};
use colony_observability::{BusCounters, RuntimeMetrics};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::client::PeerClient;
use crate::config::WorkerConfig;
use crate::error::{NodeError, NodeResult};
use crate::locks::RemoteLockAuthority;
use crate::protocol::{
    AckResponse, AgentDataRequest, AgentFailure, CollectRequest, CollectResponse, ControlRequest,
    CreateAgentsBatchRequest, CreateAgentsResponse, DataValueResponse, HeartbeatRequest,
    HeartbeatResponse, RegisterWorkerRequest, RegisterWorkerResponse, SendEventRequest,
    SendEventResponse, StatusResponse, StopRequest, UpdateAgentDataRequest, UpdateResponse,
    routes,
};
use crate::relay::WorkerRelay;

struct WorkerInner {
    config: WorkerConfig,
    master_url: String,
    bus: EventBus,
    host: AgentHost,
    client: PeerClient,
    metrics: Arc<RuntimeMetrics>,
    advertised_port: AtomicU16,
    stopping: AtomicBool,
    cancel: CancellationToken,
}

/// Handle to a worker; cheap to clone
#[derive(Clone)]
pub struct WorkerNode {
    inner: Arc<WorkerInner>,
}

impl std::fmt::Debug for WorkerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerNode")
            .field("worker_id", &self.inner.config.worker_id)
            .field("master_url", &self.inner.master_url)
            .field("agents", &self.inner.host.len())
            .finish()
    }
}

impl WorkerNode {
    /// Wire a worker together. Must run inside a tokio runtime.
    pub fn new(config: WorkerConfig, factory: Arc<dyn AgentFactory>) -> NodeResult<Self> {
        config.validate()?;
        let master_url = config.master_url.trim_end_matches('/').to_string();

        let metrics = Arc::new(RuntimeMetrics::new()?);
        let client = PeerClient::new(config.request_timeout, config.breaker.clone())?
            .with_metrics(Arc::clone(&metrics));

        let bus = EventBus::new(BusConfig::default());
        bus.set_relay(Arc::new(WorkerRelay::new(master_url.clone(), client.clone())));
        let locks = Arc::new(RemoteLockAuthority::new(master_url.clone(), client.clone()));
        let host = AgentHost::new(bus.clone(), locks, factory, config.runtime.clone());

        Ok(Self {
            inner: Arc::new(WorkerInner {
                advertised_port: AtomicU16::new(config.port),
                config,
                master_url,
                bus,
                host,
                client,
                metrics,
                stopping: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        })
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.inner.config.worker_id
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn host(&self) -> &AgentHost {
        &self.inner.host
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(routes::EVENTS, post(receive_event))
            .route(routes::AGENTS, post(create_agent))
            .route(routes::AGENTS_BATCH, post(create_agents_batch))
            .route(routes::AGENT_DATA_GET, post(get_agent_data))
            .route(routes::AGENT_DATA_UPDATE, post(update_agent_data))
            .route(routes::AGENT_DATA_BY_TYPE, post(collect))
            .route(routes::COLLECT, post(collect))
            .route(routes::STATUS, get(status))
            .route(routes::STOP, post(stop))
            .route(routes::PAUSE, post(pause))
            .route(routes::RESUME, post(resume))
            .route(routes::METRICS, get(metrics_endpoint))
            .with_state(self.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn bind(&self) -> NodeResult<TcpListener> {
        let addr = self.inner.config.bind_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| NodeError::Bind { addr, source })
    }

    /// Serve on `listener`, register with the master and heartbeat until
    /// stopped.
    ///
    /// # Errors
    ///
    /// [`NodeError::RegistrationExhausted`] when the master cannot be reached
    /// within the retry policy; the server is shut down in that case.
    pub async fn serve(&self, listener: TcpListener) -> NodeResult<()> {
        let local = listener
            .local_addr()
            .map_err(|e| NodeError::Server(e.to_string()))?;
        self.inner
            .advertised_port
            .store(local.port(), Ordering::Release);
        info!(worker_id = %self.worker_id(), addr = %local, "Worker listening");

        let cancel = self.inner.cancel.clone();
        let router = self.router();
        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
        });

        if let Err(err) = self.register().await {
            self.inner.cancel.cancel();
            self.inner.bus.shutdown();
            let _ = server.await;
            return Err(err);
        }
        let heartbeat = self.spawn_heartbeat();

        let result = match server.await {
            Ok(served) => served.map_err(|e| NodeError::Server(e.to_string())),
            Err(join) => Err(NodeError::Server(join.to_string())),
        };
        heartbeat.abort();
        info!(worker_id = %self.worker_id(), "Worker stopped");
        result
    }

    /// [`WorkerNode::serve`] on a background task
    pub fn spawn(&self, listener: TcpListener) -> JoinHandle<NodeResult<()>> {
        let node = self.clone();
        tokio::spawn(async move { node.serve(listener).await })
    }

    fn registration(&self) -> RegisterWorkerRequest {
        RegisterWorkerRequest {
            worker_id: self.worker_id().clone(),
            address: self.inner.config.advertise_host.clone(),
            port: self.inner.advertised_port.load(Ordering::Acquire),
        }
    }

    async fn register_once(&self) -> NodeResult<()> {
        let response: RegisterWorkerResponse = self
            .inner
            .client
            .post(
                "register_worker",
                &self.inner.master_url,
                routes::REGISTER_WORKER,
                &self.registration(),
            )
            .await?;
        if response.success {
            Ok(())
        } else {
            Err(NodeError::Server(response.message))
        }
    }

    /// Register with the master, retrying with exponential backoff
    pub async fn register(&self) -> NodeResult<()> {
        let policy = &self.inner.config.retry;
        let mut attempt = 1;
        loop {
            match self.register_once().await {
                Ok(()) => {
                    info!(
                        worker_id = %self.worker_id(),
                        master = %self.inner.master_url,
                        attempt,
                        "Registered with master"
                    );
                    return Ok(());
                }
                Err(err) if attempt >= policy.max_attempts => {
                    error!(
                        worker_id = %self.worker_id(),
                        attempts = attempt,
                        error = %err,
                        "Registration with master failed"
                    );
                    return Err(NodeError::RegistrationExhausted {
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }
                Err(err) => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        worker_id = %self.worker_id(),
                        attempt,
                        retry_in = ?delay,
                        error = %err,
                        "Registration attempt failed"
                    );
                    tokio::select! {
                        _ = self.inner.cancel.cancelled() => return Err(NodeError::ShuttingDown),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.inner.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick is immediate and registration just happened
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = node.inner.cancel.cancelled() => break,
                    _ = ticker.tick() => node.send_heartbeat().await,
                }
            }
        })
    }

    async fn send_heartbeat(&self) {
        let request = HeartbeatRequest {
            worker_id: self.worker_id().clone(),
            timestamp: chrono::Utc::now(),
        };
        let result = self
            .inner
            .client
            .post::<_, HeartbeatResponse>(
                "heartbeat",
                &self.inner.master_url,
                routes::HEARTBEAT,
                &request,
            )
            .await;
        match result {
            Ok(response) if response.reregister_required => {
                info!(worker_id = %self.worker_id(), "Master asked for re-registration");
                if let Err(err) = self.register().await {
                    warn!(error = %err, "Re-registration failed");
                }
            }
            Ok(_) => debug!(worker_id = %self.worker_id(), "Heartbeat acknowledged"),
            Err(err) => warn!(worker_id = %self.worker_id(), error = %err, "Heartbeat failed"),
        }
    }

    /// Control calls may name a worker; they must name this one
    fn ensure_addressed(&self, target: Option<&WorkerId>) -> NodeResult<()> {
        match target {
            Some(target) if target != self.worker_id() => {
                Err(NodeError::UnknownWorker(target.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Stop agents and the server. Safe to call more than once.
    pub async fn shutdown(&self, reason: &str) {
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(worker_id = %self.worker_id(), reason, "Worker shutting down");
        self.inner.client.begin_shutdown();

        // agents that missed the master's broadcast still hear about it
        match Event::new(EventKind::TERMINATION, Address::Env, Address::All).with_body(
            &TerminationNotice {
                reason: reason.to_string(),
            },
        ) {
            Ok(event) => {
                if let Err(err) = self.inner.bus.dispatch_remote(event) {
                    debug!(error = %err, "Local termination event not dispatched");
                }
            }
            Err(err) => warn!(error = %err, "Failed to build termination event"),
        }

        self.inner
            .host
            .shutdown(self.inner.config.shutdown_grace)
            .await;
        self.inner.cancel.cancel();
        self.inner.bus.shutdown();
    }
}

async fn receive_event(
    State(worker): State<WorkerNode>,
    Json(envelope): Json<SendEventRequest>,
) -> NodeResult<Json<SendEventResponse>> {
    let event = Event::try_from(envelope)?;
    worker.inner.bus.dispatch_remote(event)?;
    Ok(Json(SendEventResponse { received: true }))
}

async fn create_agent(
    State(worker): State<WorkerNode>,
    Json(config): Json<AgentConfig>,
) -> NodeResult<Json<CreateAgentsResponse>> {
    if worker.is_stopping() {
        return Err(NodeError::ShuttingDown);
    }
    let agent_id = worker.inner.host.create(&config)?;
    Ok(Json(CreateAgentsResponse {
        agent_ids: vec![agent_id],
        failures: Vec::new(),
    }))
}

async fn create_agents_batch(
    State(worker): State<WorkerNode>,
    Json(request): Json<CreateAgentsBatchRequest>,
) -> NodeResult<Json<CreateAgentsResponse>> {
    if worker.is_stopping() {
        return Err(NodeError::ShuttingDown);
    }
    let mut response = CreateAgentsResponse::default();
    for config in &request.configs {
        match worker.inner.host.create(config) {
            Ok(agent_id) => response.agent_ids.push(agent_id),
            Err(err) => {
                warn!(agent_id = %config.agent_id, error = %err, "Agent creation failed");
                response.failures.push(AgentFailure {
                    agent_id: config.agent_id.clone(),
                    error: err.to_string(),
                });
            }
        }
    }
    info!(
        worker_id = %worker.worker_id(),
        created = response.agent_ids.len(),
        failed = response.failures.len(),
        "Agent batch created"
    );
    Ok(Json(response))
}

async fn get_agent_data(
    State(worker): State<WorkerNode>,
    Json(request): Json<AgentDataRequest>,
) -> NodeResult<Json<DataValueResponse>> {
    let value = worker
        .inner
        .host
        .read(&request.agent_id, &request.key)
        .await?;
    Ok(Json(DataValueResponse { value }))
}

async fn update_agent_data(
    State(worker): State<WorkerNode>,
    Json(request): Json<UpdateAgentDataRequest>,
) -> NodeResult<Json<UpdateResponse>> {
    worker
        .inner
        .host
        .write(&request.agent_id, &request.key, request.value)
        .await?;
    Ok(Json(UpdateResponse { success: true }))
}

async fn collect(
    State(worker): State<WorkerNode>,
    Json(request): Json<CollectRequest>,
) -> Json<CollectResponse> {
    let values = worker
        .inner
        .host
        .collect(&request.agent_type, &request.key)
        .await;
    Json(CollectResponse {
        values: values.into_iter().collect(),
    })
}

async fn status(State(worker): State<WorkerNode>) -> Json<StatusResponse> {
    Json(StatusResponse {
        worker_id: worker.worker_id().clone(),
        activity: ActivitySnapshot::of_bus(&worker.inner.bus),
        agents: worker.inner.host.len(),
        running: worker.inner.host.running_count(),
    })
}

/// Acknowledge at once; the actual shutdown runs in the background
async fn stop(
    State(worker): State<WorkerNode>,
    Json(request): Json<StopRequest>,
) -> NodeResult<Json<AckResponse>> {
    worker.ensure_addressed(request.worker_id.as_ref())?;
    tokio::spawn(async move { worker.shutdown(&request.reason).await });
    Ok(Json(AckResponse { acknowledged: true }))
}

/// Hold local delivery; handlers already running finish, their output waits
async fn pause(
    State(worker): State<WorkerNode>,
    Json(request): Json<ControlRequest>,
) -> NodeResult<Json<AckResponse>> {
    worker.ensure_addressed(request.worker_id.as_ref())?;
    worker.inner.bus.pause();
    Ok(Json(AckResponse { acknowledged: true }))
}

async fn resume(
    State(worker): State<WorkerNode>,
    Json(request): Json<ControlRequest>,
) -> NodeResult<Json<AckResponse>> {
    worker.ensure_addressed(request.worker_id.as_ref())?;
    worker.inner.bus.resume();
    worker.inner.bus.touch();
    Ok(Json(AckResponse { acknowledged: true }))
}

async fn metrics_endpoint(State(worker): State<WorkerNode>) -> NodeResult<String> {
    let stats = worker.inner.bus.stats();
    worker.inner.metrics.observe_bus(BusCounters {
        dispatched: stats.dispatched,
        dropped_no_route: stats.dropped_no_route,
        dropped_stopped: stats.dropped_stopped,
        unhandled: stats.unhandled,
        relay_failures: stats.relay_failures,
        pending: stats.pending,
    });
    Ok(worker.inner.metrics.render()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use colony_core::AgentId;
    use colony_mesh::{AgentTypeRegistry, HandlerTable};
    use std::time::Duration;

    fn worker(master_url: &str) -> WorkerNode {
        let registry =
            AgentTypeRegistry::new().register("idle", |_config| Ok(HandlerTable::default()));
        let config = WorkerConfig::new(WorkerId::parse("w1").unwrap(), master_url).with_retry(
            RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(20),
                multiplier: 2,
            },
        );
        WorkerNode::new(config, Arc::new(registry)).unwrap()
    }

    #[tokio::test]
    async fn test_registration_exhausted() {
        let worker = worker("http://127.0.0.1:9");
        let listener = worker.bind().await.unwrap();
        let err = worker.serve(listener).await.unwrap_err();
        assert!(matches!(
            err,
            NodeError::RegistrationExhausted { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_batch_reports_per_agent_failures() {
        let worker = worker("http://127.0.0.1:9");
        let configs = vec![
            AgentConfig::new(AgentId::parse("a1").unwrap(), "idle"),
            AgentConfig::new(AgentId::parse("a1").unwrap(), "idle"),
            AgentConfig::new(AgentId::parse("a2").unwrap(), "ghost"),
        ];
        let Json(response) = create_agents_batch(
            State(worker.clone()),
            Json(CreateAgentsBatchRequest { configs }),
        )
        .await
        .unwrap();
        assert_eq!(response.agent_ids, vec![AgentId::parse("a1").unwrap()]);
        assert_eq!(response.failures.len(), 2);

        let Json(status) = status(State(worker.clone())).await;
        assert_eq!(status.agents, 1);
        worker.shutdown("test over").await;
        assert!(worker.is_stopping());
    }

    #[tokio::test]
    async fn test_stop_for_other_worker_rejected() {
        let worker = worker("http://127.0.0.1:9");
        let result = stop(
            State(worker.clone()),
            Json(StopRequest {
                worker_id: Some(WorkerId::parse("w2").unwrap()),
                reason: "done".into(),
            }),
        )
        .await;
        assert!(matches!(result, Err(NodeError::UnknownWorker(_))));
        assert!(!worker.is_stopping());
    }

    #[tokio::test]
    async fn test_pause_and_resume_hold_local_delivery() {
        let worker = worker("http://127.0.0.1:9");
        let own = || {
            Json(ControlRequest {
                worker_id: Some(WorkerId::parse("w1").unwrap()),
            })
        };

        pause(State(worker.clone()), own()).await.unwrap();
        assert!(worker.bus().is_paused());

        let other = Json(ControlRequest {
            worker_id: Some(WorkerId::parse("w2").unwrap()),
        });
        assert!(matches!(
            resume(State(worker.clone()), other).await,
            Err(NodeError::UnknownWorker(_))
        ));
        assert!(worker.bus().is_paused());

        tokio::time::sleep(Duration::from_millis(30)).await;
        resume(State(worker.clone()), own()).await.unwrap();
        assert!(!worker.bus().is_paused());
        assert!(worker.bus().idle_for() < Duration::from_millis(30));
    }
}
