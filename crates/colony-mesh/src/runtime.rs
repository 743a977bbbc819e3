//! Per-agent runtime: owns a profile and an inbox, dispatches events to the
//! agent's handler table, and serves data requests against the profile.

use colony_core::{
    Address, AgentId, CoreResult, DecisionRecord, EndReport, Event, EventKind, Profile,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Inbox};
use crate::data::{DataAccess, DataAccessConfig, answer_data_event};
use crate::error::MeshResult;
use crate::handler::HandlerTable;
use crate::lock::LockAuthority;

/// Lifecycle of an agent runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub data: DataAccessConfig,
    /// How often an agent sweeps data requests nobody is waiting on anymore
    pub eviction_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data: DataAccessConfig::default(),
            eviction_interval: Duration::from_secs(1),
        }
    }
}

/// Everything needed to start one agent
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub id: AgentId,
    pub agent_type: String,
    pub profile: Profile,
    pub handlers: HandlerTable,
}

impl AgentDefinition {
    pub fn new(id: AgentId, agent_type: impl Into<String>, handlers: HandlerTable) -> Self {
        Self {
            id,
            agent_type: agent_type.into(),
            profile: Profile::new(),
            handlers,
        }
    }

    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }
}

/// View of its own agent handed to every handler invocation
#[derive(Clone)]
pub struct AgentContext {
    id: AgentId,
    agent_type: Arc<str>,
    profile: Arc<RwLock<Profile>>,
    data: DataAccess,
    bus: EventBus,
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("id", &self.id)
            .field("agent_type", &self.agent_type)
            .finish_non_exhaustive()
    }
}

impl AgentContext {
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn address(&self) -> Address {
        Address::Agent(self.id.clone())
    }

    /// New event sent by this agent
    pub fn event(&self, kind: impl Into<EventKind>, to: Address) -> Event {
        Event::new(kind, self.address(), to)
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.profile.read().await.get(key).cloned()
    }

    pub async fn get_or(&self, key: &str, default: Value) -> Value {
        self.profile.read().await.get_or(key, default)
    }

    /// Update the agent's own profile directly
    pub async fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.profile.write().await.update(key, value)
    }

    pub async fn profile_snapshot(&self) -> Value {
        self.profile.read().await.snapshot()
    }

    /// Client for reading and writing other profiles
    pub fn data(&self) -> &DataAccess {
        &self.data
    }

    /// Dispatch immediately instead of returning the event from the handler
    pub fn emit(&self, event: Event) -> MeshResult<()> {
        self.bus.dispatch(event)
    }

    /// Send a decision to the environment for persistence
    pub fn record_decision(&self, trigger: &EventKind, decision: Value) -> MeshResult<()> {
        let event = self.decision_event(trigger, decision)?;
        self.emit(event)
    }

    pub fn decision_event(&self, trigger: &EventKind, decision: Value) -> CoreResult<Event> {
        self.event(EventKind::DECISION, Address::Env)
            .with_body(&DecisionRecord {
                agent_id: self.id.clone(),
                trigger: trigger.to_string(),
                decision,
            })
    }

    /// `EndEvent` telling the environment this agent finished `step`
    pub fn end_of_step(&self, step: u64) -> CoreResult<Event> {
        self.event(EventKind::END, Address::Env)
            .with_body(&EndReport { step })
    }
}

/// Handle to a spawned agent runtime
#[derive(Clone)]
pub struct AgentHandle {
    id: AgentId,
    agent_type: String,
    profile: Arc<RwLock<Profile>>,
    status: watch::Receiver<AgentStatus>,
    cancel: CancellationToken,
    join: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.id)
            .field("agent_type", &self.agent_type)
            .field("status", &self.status())
            .finish()
    }
}

impl AgentHandle {
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn status(&self) -> AgentStatus {
        *self.status.borrow()
    }

    pub fn profile(&self) -> &Arc<RwLock<Profile>> {
        &self.profile
    }

    /// Ask the runtime to stop without a `TerminationEvent`
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the runtime task to finish
    pub async fn join(&self) {
        let handle = self.join.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(agent_id = %self.id, error = %err, "Agent runtime task failed");
            }
        }
    }

    /// Resolves once the agent has stopped
    pub async fn stopped(&self) {
        let mut status = self.status.clone();
        // sender dropped means the runtime is gone
        let _ = status.wait_for(|s| *s == AgentStatus::Stopped).await;
    }
}

/// Start an agent on `bus`
///
/// # Errors
///
/// Fails if the id is already registered on this bus.
pub fn spawn_agent(
    definition: AgentDefinition,
    bus: &EventBus,
    locks: Arc<dyn LockAuthority>,
    config: &RuntimeConfig,
) -> MeshResult<AgentHandle> {
    let AgentDefinition {
        id,
        agent_type,
        profile,
        handlers,
    } = definition;

    let inbox = bus.register_agent(id.clone(), agent_type.clone())?;
    let profile = Arc::new(RwLock::new(profile));
    let data = DataAccess::new(
        Address::Agent(id.clone()),
        bus.clone(),
        locks,
        config.data.clone(),
    );
    let ctx = AgentContext {
        id: id.clone(),
        agent_type: agent_type.as_str().into(),
        profile: Arc::clone(&profile),
        data,
        bus: bus.clone(),
    };
    let (status_tx, status_rx) = watch::channel(AgentStatus::Running);
    let cancel = CancellationToken::new();
    let _sweep = ctx
        .data
        .spawn_eviction(config.eviction_interval, cancel.clone());

    let runtime = AgentRuntime {
        ctx,
        handlers: Arc::new(handlers),
        status: status_tx,
        cancel: cancel.clone(),
    };
    let join = tokio::spawn(runtime.run(inbox));

    Ok(AgentHandle {
        id,
        agent_type,
        profile,
        status: status_rx,
        cancel,
        join: Arc::new(std::sync::Mutex::new(Some(join))),
    })
}

struct AgentRuntime {
    ctx: AgentContext,
    handlers: Arc<HandlerTable>,
    status: watch::Sender<AgentStatus>,
    cancel: CancellationToken,
}

impl AgentRuntime {
    async fn run(self, mut inbox: Inbox) {
        info!(agent_id = %self.ctx.id, agent_type = %self.ctx.agent_type, "Agent started");

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = inbox.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            if event.is(&EventKind::TERMINATION) && self.terminates_me(event.to()) {
                debug!(agent_id = %self.ctx.id, "Termination received");
                break;
            }
            self.process(event);
        }

        // also ends the data eviction sweep
        self.cancel.cancel();
        self.ctx.bus.mark_stopped(&self.ctx.id);
        self.status.send_replace(AgentStatus::Stopped);
        inbox.drain();
        info!(agent_id = %self.ctx.id, "Agent stopped");
    }

    /// Only a termination sent to this agent or to everyone stops it
    fn terminates_me(&self, to: &Address) -> bool {
        match to {
            Address::All => true,
            Address::Agent(id) => *id == self.ctx.id,
            Address::Env | Address::Type(_) => false,
        }
    }

    fn process(&self, event: Event) {
        let kind = event.kind().clone();

        if kind == EventKind::DATA_REQUEST || kind == EventKind::DATA_UPDATE {
            self.serve_data(event);
            return;
        }
        if self.ctx.data.handle_response(&event) {
            return;
        }

        let handlers = self.handlers.handlers_for(&kind);
        if handlers.is_empty() {
            if kind == EventKind::PAUSE || kind == EventKind::RESUME {
                // environment control broadcasts reach agents too
                debug!(agent_id = %self.ctx.id, %kind, "Control event ignored by agent");
            } else {
                warn!(agent_id = %self.ctx.id, %kind, "No handler registered for event kind");
                self.ctx.bus.record_unhandled();
            }
            return;
        }

        let event = Arc::new(event);
        for named in handlers {
            let guard = self.ctx.bus.activity_guard();
            let ctx = self.ctx.clone();
            let named = named.clone();
            let event = Arc::clone(&event);
            tokio::spawn(async move {
                let _guard = guard;
                let trigger = event.id();
                match named.handler().handle(ctx.clone(), Event::clone(&event)).await {
                    Ok(emitted) => {
                        for out in emitted {
                            if let Err(err) = ctx.bus.dispatch(out.with_parent(trigger)) {
                                warn!(agent_id = %ctx.id, error = %err, "Failed to dispatch handler output");
                            }
                        }
                    }
                    Err(err) => {
                        warn!(
                            agent_id = %ctx.id,
                            handler = named.name(),
                            kind = %event.kind(),
                            error = %err,
                            "Handler failed"
                        );
                    }
                }
            });
        }
    }

    fn serve_data(&self, event: Event) {
        let guard = self.ctx.bus.activity_guard();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let _guard = guard;
            match answer_data_event(&ctx.address(), &ctx.profile, &event).await {
                Ok(Some(reply)) => {
                    if let Err(err) = ctx.bus.dispatch(reply) {
                        warn!(agent_id = %ctx.id, error = %err, "Failed to send data reply");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(agent_id = %ctx.id, from = %event.from(), error = %err, "Malformed data event");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::handler::{HandlerError, handler_fn};
    use crate::lock::LocalLockAuthority;
    use serde_json::json;
    use std::time::Duration;

    fn id(s: &str) -> AgentId {
        AgentId::parse(s).unwrap()
    }

    fn locks() -> Arc<dyn LockAuthority> {
        Arc::new(LocalLockAuthority::new())
    }

    async fn settle(bus: &EventBus) {
        for _ in 0..100 {
            if bus.is_quiescent() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("bus did not settle");
    }

    fn ping_pong() -> HandlerTable {
        HandlerTable::builder()
            .on(
                "Ping",
                "reply",
                handler_fn(|ctx: AgentContext, event: Event| async move {
                    let hits = ctx.get_or("hits", json!(0)).await.as_i64().unwrap_or(0);
                    ctx.set("hits", json!(hits + 1)).await;
                    Ok(vec![ctx.event("Pong", event.from().clone())])
                }),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_handler_output_is_tagged_and_dispatched() {
        let bus = EventBus::new(BusConfig::default().with_flow_recording(64));
        let agent = spawn_agent(
            AgentDefinition::new(id("a"), "echo", ping_pong()),
            &bus,
            locks(),
            &RuntimeConfig::default(),
        )
        .unwrap();
        let mut env = bus.attach_env().unwrap();

        let ping = Event::new("Ping", Address::Env, Address::Agent(id("a")));
        let ping_id = ping.id();
        bus.dispatch(ping).unwrap();

        let pong = tokio::time::timeout(Duration::from_secs(1), env.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pong.kind().as_str(), "Pong");
        assert_eq!(pong.parent_id(), Some(ping_id));
        assert_eq!(pong.from(), &Address::Agent(id("a")));

        settle(&bus).await;
        assert_eq!(agent.profile().read().await.get("hits"), Some(&json!(1)));
        assert_eq!(bus.export_flow().edges.len(), 1);
    }

    #[tokio::test]
    async fn test_termination_stops_agent() {
        let bus = EventBus::new(BusConfig::default());
        let agent = spawn_agent(
            AgentDefinition::new(id("a"), "echo", ping_pong()),
            &bus,
            locks(),
            &RuntimeConfig::default(),
        )
        .unwrap();

        bus.dispatch(Event::new(
            EventKind::TERMINATION,
            Address::Env,
            Address::Agent(id("a")),
        ))
        .unwrap();
        tokio::time::timeout(Duration::from_secs(1), agent.stopped())
            .await
            .unwrap();
        agent.join().await;

        assert_eq!(agent.status(), AgentStatus::Stopped);
        assert!(bus.is_stopped(&id("a")));

        // later deliveries are no-ops
        bus.dispatch(Event::new("Ping", Address::Env, Address::Agent(id("a"))))
            .unwrap();
        settle(&bus).await;
        assert_eq!(bus.stats().dropped_stopped, 1);
    }

    #[tokio::test]
    async fn test_termination_to_a_type_does_not_stop_agent() {
        let bus = EventBus::new(BusConfig::default());
        let agent = spawn_agent(
            AgentDefinition::new(id("a"), "echo", ping_pong()),
            &bus,
            locks(),
            &RuntimeConfig::default(),
        )
        .unwrap();

        bus.dispatch(Event::new(
            EventKind::TERMINATION,
            Address::Env,
            Address::Type("echo".into()),
        ))
        .unwrap();
        settle(&bus).await;
        assert_eq!(agent.status(), AgentStatus::Running);

        bus.dispatch(Event::new(EventKind::TERMINATION, Address::Env, Address::All))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), agent.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_orphaned_read_is_evicted_in_background() {
        let handlers = HandlerTable::builder()
            .on(
                "Ask",
                "give_up",
                handler_fn(|ctx: AgentContext, _event| async move {
                    let ghost = Address::Agent(AgentId::parse("ghost").unwrap());
                    // dropping the read leaves its entry behind
                    let read = ctx.data().get_data(&ghost, "price", json!(0));
                    let _ = tokio::time::timeout(Duration::from_millis(10), read).await;
                    Ok(Vec::new())
                }),
            )
            .on(
                "Count",
                "count",
                handler_fn(|ctx: AgentContext, _event| async move {
                    let pending = ctx.data().pending_reads();
                    ctx.set("pending", json!(pending)).await;
                    Ok(Vec::new())
                }),
            )
            .build()
            .unwrap();
        let mut config = RuntimeConfig::default();
        config.data.request_timeout = Duration::from_millis(100);
        config.eviction_interval = Duration::from_millis(20);

        let bus = EventBus::new(BusConfig::default());
        let agent = spawn_agent(
            AgentDefinition::new(id("a"), "asker", handlers),
            &bus,
            locks(),
            &config,
        )
        .unwrap();

        bus.dispatch(Event::new("Ask", Address::Env, Address::Agent(id("a"))))
            .unwrap();
        settle(&bus).await;
        bus.dispatch(Event::new("Count", Address::Env, Address::Agent(id("a"))))
            .unwrap();
        settle(&bus).await;
        assert_eq!(agent.profile().read().await.get("pending"), Some(&json!(1)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        bus.dispatch(Event::new("Count", Address::Env, Address::Agent(id("a"))))
            .unwrap();
        settle(&bus).await;
        assert_eq!(agent.profile().read().await.get("pending"), Some(&json!(0)));
    }

    #[tokio::test]
    async fn test_unhandled_kind_is_counted() {
        let bus = EventBus::new(BusConfig::default());
        let _agent = spawn_agent(
            AgentDefinition::new(id("a"), "echo", ping_pong()),
            &bus,
            locks(),
            &RuntimeConfig::default(),
        )
        .unwrap();

        bus.dispatch(Event::new("Unknown", Address::Env, Address::Agent(id("a"))))
            .unwrap();
        settle(&bus).await;
        assert_eq!(bus.stats().unhandled, 1);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_agent() {
        let handlers = HandlerTable::builder()
            .on(
                "Boom",
                "fail",
                handler_fn(|_ctx, _event| async { Err(HandlerError::new("nope")) }),
            )
            .build()
            .unwrap();
        let bus = EventBus::new(BusConfig::default());
        let agent = spawn_agent(
            AgentDefinition::new(id("a"), "t", handlers),
            &bus,
            locks(),
            &RuntimeConfig::default(),
        )
        .unwrap();

        bus.dispatch(Event::new("Boom", Address::Env, Address::Agent(id("a"))))
            .unwrap();
        settle(&bus).await;
        assert_eq!(agent.status(), AgentStatus::Running);
    }

    #[tokio::test]
    async fn test_agents_read_each_others_profiles() {
        let bus = EventBus::new(BusConfig::default());
        let mut seller_profile = Profile::new();
        seller_profile.update("price", json!(42));

        let _seller = spawn_agent(
            AgentDefinition::new(id("seller"), "seller", HandlerTable::default())
                .with_profile(seller_profile),
            &bus,
            locks(),
            &RuntimeConfig::default(),
        )
        .unwrap();

        let handlers = HandlerTable::builder()
            .on(
                "Quote",
                "ask",
                handler_fn(|ctx: AgentContext, _event| async move {
                    let seller = Address::Agent(AgentId::parse("seller").unwrap());
                    let price = ctx.data().get_data(&seller, "price", json!(0)).await;
                    ctx.set("seen_price", price).await;
                    Ok(Vec::new())
                }),
            )
            .build()
            .unwrap();
        let buyer = spawn_agent(
            AgentDefinition::new(id("buyer"), "buyer", handlers),
            &bus,
            locks(),
            &RuntimeConfig::default(),
        )
        .unwrap();

        bus.dispatch(Event::new("Quote", Address::Env, Address::Agent(id("buyer"))))
            .unwrap();
        settle(&bus).await;
        assert_eq!(
            buyer.profile().read().await.get("seen_price"),
            Some(&json!(42))
        );
    }

    #[tokio::test]
    async fn test_decision_reaches_env() {
        let bus = EventBus::new(BusConfig::default());
        let mut env = bus.attach_env().unwrap();
        let ctx = AgentContext {
            id: id("a"),
            agent_type: "t".into(),
            profile: Arc::new(RwLock::new(Profile::new())),
            data: DataAccess::new(
                Address::Agent(id("a")),
                bus.clone(),
                locks(),
                DataAccessConfig::default(),
            ),
            bus,
        };
        ctx.record_decision(&EventKind::new("Bid"), json!({"buy": 3}))
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), env.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(event.is(&EventKind::DECISION));
        assert_eq!(event.to(), &Address::Env);
        let record: DecisionRecord = event.body().unwrap();
        assert_eq!(record.trigger, "Bid");
        assert_eq!(record.decision, json!({"buy": 3}));
    }
}
