//! Per-process event bus.
//!
//! Every process (master or worker) owns one [`EventBus`]. Senders enqueue
//! with [`EventBus::dispatch`] and return immediately; a single routing task
//! drains the queue in dispatch order and hands each event to the inbox of
//! the addressed local agent, to the environment inbox, or to an
//! [`EventRelay`] when the target lives in another process.
//!
//! The bus counts work that is still "in flight": events queued for
//! routing, events sitting in inboxes, relays in progress and handler tasks
//! holding an [`ActivityGuard`]. The environment uses [`EventBus::is_quiescent`]
//! and [`EventBus::idle_for`] to decide when a simulation has gone quiet.

use async_trait::async_trait;
use colony_core::{Address, AgentId, Event, EventKind};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{MeshError, MeshResult};
use crate::flow::{EventFlow, FlowRecorder};

/// Bus tuning knobs
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Forward remotely-originated events whose target is not local.
    /// Set on the master, which brokers between workers.
    pub forward_remote: bool,
    /// Record dispatched events for [`EventBus::export_flow`]
    pub record_flow: bool,
    /// Maximum number of events kept by the flow recorder
    pub flow_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            forward_remote: false,
            record_flow: false,
            flow_capacity: 10_000,
        }
    }
}

impl BusConfig {
    pub fn with_forward_remote(mut self, forward: bool) -> Self {
        self.forward_remote = forward;
        self
    }

    pub fn with_flow_recording(mut self, capacity: usize) -> Self {
        self.record_flow = true;
        self.flow_capacity = capacity;
        self
    }
}

/// Delivery hook for events addressed outside this process
#[async_trait]
pub trait EventRelay: Send + Sync + 'static {
    /// Deliver an event to whichever process hosts its target
    async fn relay(&self, event: Event) -> MeshResult<()>;
}

/// Passive observer called for every dispatched event
pub trait EventTap: Send + Sync + 'static {
    fn observe(&self, event: &Event);
}

/// Where an event entered this bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Emitted by an agent, scheduler or environment in this process
    Local,
    /// Received from another process over RPC
    Remote,
}

struct Queued {
    event: Event,
    origin: Origin,
}

struct LocalAgent {
    agent_type: String,
    sender: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    delivered: AtomicU64,
    relayed: AtomicU64,
    relay_failures: AtomicU64,
    dropped_no_route: AtomicU64,
    dropped_stopped: AtomicU64,
    unhandled: AtomicU64,
}

/// Point-in-time bus counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub dispatched: u64,
    pub delivered: u64,
    pub relayed: u64,
    pub relay_failures: u64,
    pub dropped_no_route: u64,
    pub dropped_stopped: u64,
    pub unhandled: u64,
    pub pending: usize,
    pub active_handlers: usize,
    pub local_agents: usize,
    pub paused: bool,
}

struct BusShared {
    config: BusConfig,
    queue: mpsc::UnboundedSender<Queued>,
    agents: DashMap<AgentId, LocalAgent>,
    stopped: DashSet<AgentId>,
    env_sink: RwLock<Option<mpsc::UnboundedSender<Event>>>,
    relay: RwLock<Option<Arc<dyn EventRelay>>>,
    taps: RwLock<Vec<Arc<dyn EventTap>>>,
    paused: watch::Sender<bool>,
    pending: AtomicUsize,
    active_handlers: AtomicUsize,
    last_activity: Mutex<Instant>,
    counters: Counters,
    flow: Option<FlowRecorder>,
    shutdown: CancellationToken,
}

/// Cloneable handle to a process-local event bus
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<BusShared>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("pending", &self.pending())
            .field("local_agents", &self.shared.agents.len())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl EventBus {
    /// Create a bus and spawn its routing task on the current runtime
    pub fn new(config: BusConfig) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let (paused, paused_rx) = watch::channel(false);
        let flow = config
            .record_flow
            .then(|| FlowRecorder::new(config.flow_capacity));

        let shared = Arc::new(BusShared {
            config,
            queue,
            agents: DashMap::new(),
            stopped: DashSet::new(),
            env_sink: RwLock::new(None),
            relay: RwLock::new(None),
            taps: RwLock::new(Vec::new()),
            paused,
            pending: AtomicUsize::new(0),
            active_handlers: AtomicUsize::new(0),
            last_activity: Mutex::new(Instant::now()),
            counters: Counters::default(),
            flow,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(route_loop(Arc::clone(&shared), rx, paused_rx));
        Self { shared }
    }

    /// Enqueue an event emitted in this process
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::BusClosed`] after [`EventBus::shutdown`].
    pub fn dispatch(&self, event: Event) -> MeshResult<()> {
        self.enqueue(event, Origin::Local)
    }

    /// Enqueue an event received from another process
    pub fn dispatch_remote(&self, event: Event) -> MeshResult<()> {
        self.enqueue(event, Origin::Remote)
    }

    fn enqueue(&self, event: Event, origin: Origin) -> MeshResult<()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(MeshError::BusClosed);
        }

        self.shared.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        if let Some(flow) = &self.shared.flow {
            flow.record(&event);
        }
        if let Ok(taps) = self.shared.taps.read() {
            for tap in taps.iter() {
                tap.observe(&event);
            }
        }

        self.shared.begin_work();
        self.shared
            .queue
            .send(Queued { event, origin })
            .map_err(|_| {
                self.shared.end_work();
                MeshError::BusClosed
            })
    }

    /// Register a local agent and get its inbox
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::AgentAlreadyRegistered`] if the id is live on this bus.
    pub fn register_agent(&self, id: AgentId, agent_type: impl Into<String>) -> MeshResult<Inbox> {
        use dashmap::mapref::entry::Entry;

        let (sender, receiver) = mpsc::unbounded_channel();
        match self.shared.agents.entry(id.clone()) {
            Entry::Occupied(_) => return Err(MeshError::AgentAlreadyRegistered(id.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(LocalAgent {
                    agent_type: agent_type.into(),
                    sender,
                });
            }
        }
        self.shared.stopped.remove(&id);
        debug!(agent_id = %id, "Agent registered on bus");
        Ok(Inbox::new(receiver, Arc::clone(&self.shared)))
    }

    /// Stop delivering to an agent. Later events for it are dropped quietly.
    pub fn mark_stopped(&self, id: &AgentId) {
        if self.shared.agents.remove(id).is_some() {
            self.shared.stopped.insert(id.clone());
            debug!(agent_id = %id, "Agent marked stopped on bus");
        }
    }

    pub fn is_local(&self, id: &AgentId) -> bool {
        self.shared.agents.contains_key(id)
    }

    pub fn is_stopped(&self, id: &AgentId) -> bool {
        self.shared.stopped.contains(id)
    }

    /// Live local agents with their types
    pub fn local_agents(&self) -> Vec<(AgentId, String)> {
        self.shared
            .agents
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().agent_type.clone()))
            .collect()
    }

    /// Claim the inbox for events addressed to `ENV`
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::EnvAlreadyAttached`] on a second call.
    pub fn attach_env(&self) -> MeshResult<Inbox> {
        let mut sink = self
            .shared
            .env_sink
            .write()
            .map_err(|_| MeshError::EnvAlreadyAttached)?;
        if sink.is_some() {
            return Err(MeshError::EnvAlreadyAttached);
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        *sink = Some(sender);
        Ok(Inbox::new(receiver, Arc::clone(&self.shared)))
    }

    pub fn set_relay(&self, relay: Arc<dyn EventRelay>) {
        if let Ok(mut slot) = self.shared.relay.write() {
            *slot = Some(relay);
        }
    }

    pub fn add_tap(&self, tap: Arc<dyn EventTap>) {
        if let Ok(mut taps) = self.shared.taps.write() {
            taps.push(tap);
        }
    }

    /// Hold back ordinary events until [`EventBus::resume`].
    /// Pause, resume and termination events still get through.
    pub fn pause(&self) {
        if !self.shared.paused.send_replace(true) {
            info!("Event bus paused");
        }
    }

    pub fn resume(&self) {
        if self.shared.paused.send_replace(false) {
            self.shared.touch();
            info!("Event bus resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    /// Events queued, sitting in inboxes, or being relayed
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    pub fn active_handlers(&self) -> usize {
        self.shared.active_handlers.load(Ordering::Acquire)
    }

    /// No pending events and no handler still running
    pub fn is_quiescent(&self) -> bool {
        self.is_empty() && self.active_handlers() == 0
    }

    /// Time since the last dispatch, delivery, or handler completion
    pub fn idle_for(&self) -> Duration {
        self.shared
            .last_activity
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    /// Reset the idle clock
    pub fn touch(&self) {
        self.shared.touch();
    }

    /// Mark a handler as running until the guard is dropped
    pub fn activity_guard(&self) -> ActivityGuard {
        self.shared.active_handlers.fetch_add(1, Ordering::AcqRel);
        self.shared.touch();
        ActivityGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Count an event that reached an agent with no handler for its kind
    pub fn record_unhandled(&self) {
        self.shared.counters.unhandled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BusStats {
        let c = &self.shared.counters;
        BusStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            relayed: c.relayed.load(Ordering::Relaxed),
            relay_failures: c.relay_failures.load(Ordering::Relaxed),
            dropped_no_route: c.dropped_no_route.load(Ordering::Relaxed),
            dropped_stopped: c.dropped_stopped.load(Ordering::Relaxed),
            unhandled: c.unhandled.load(Ordering::Relaxed),
            pending: self.pending(),
            active_handlers: self.active_handlers(),
            local_agents: self.shared.agents.len(),
            paused: self.is_paused(),
        }
    }

    /// Causal graph of recorded events, empty unless flow recording is on
    pub fn export_flow(&self) -> EventFlow {
        self.shared
            .flow
            .as_ref()
            .map(FlowRecorder::export)
            .unwrap_or_default()
    }

    /// Stop routing. Queued events are discarded.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.is_cancelled() {
            self.shared.shutdown.cancel();
            info!("Event bus shut down");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }
}

impl BusShared {
    fn touch(&self) {
        if let Ok(mut at) = self.last_activity.lock() {
            *at = Instant::now();
        }
    }

    fn begin_work(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    fn end_work(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        self.touch();
    }

    fn relay(&self) -> Option<Arc<dyn EventRelay>> {
        self.relay.read().ok().and_then(|slot| slot.clone())
    }

    fn env_sink(&self) -> Option<mpsc::UnboundedSender<Event>> {
        self.env_sink.read().ok().and_then(|slot| slot.clone())
    }

    fn may_forward(&self, origin: Origin) -> bool {
        origin == Origin::Local || self.config.forward_remote
    }

    /// Route one dequeued event. Consumes the queue's unit of pending work.
    fn route(self: &Arc<Self>, queued: Queued) {
        let Queued { event, origin } = queued;
        match event.to().clone() {
            Address::Agent(id) => self.route_unicast(&id, event, origin),
            Address::Env => match self.env_sink() {
                Some(sink) => self.deliver(&sink, event),
                None if self.may_forward(origin) => self.spawn_relay(event),
                None => self.drop_no_route(&event),
            },
            target @ (Address::All | Address::Type(_)) => {
                self.route_broadcast(&target, event, origin)
            }
        }
    }

    fn route_unicast(self: &Arc<Self>, id: &AgentId, event: Event, origin: Origin) {
        if self.stopped.contains(id) {
            debug!(agent_id = %id, kind = %event.kind(), "Dropping event for stopped agent");
            self.counters.dropped_stopped.fetch_add(1, Ordering::Relaxed);
            self.end_work();
            return;
        }

        let sender = self.agents.get(id).map(|agent| agent.sender.clone());
        match sender {
            Some(sender) => self.deliver(&sender, event),
            None if self.may_forward(origin) => self.spawn_relay(event),
            None => self.drop_no_route(&event),
        }
    }

    fn route_broadcast(self: &Arc<Self>, target: &Address, event: Event, origin: Origin) {
        let senders: Vec<_> = self
            .agents
            .iter()
            .filter(|entry| target.matches(entry.key(), &entry.value().agent_type))
            .map(|entry| entry.value().sender.clone())
            .collect();

        for sender in senders {
            self.begin_work();
            self.deliver(&sender, event.clone());
        }

        if *target == Address::All {
            if let Some(sink) = self.env_sink() {
                self.begin_work();
                self.deliver(&sink, event.clone());
            }
        }

        if self.may_forward(origin) && self.relay().is_some() {
            self.begin_work();
            self.spawn_relay(event);
        }

        self.end_work();
    }

    /// Hand an event to an inbox. The inbox takes over the unit of pending work.
    fn deliver(&self, sender: &mpsc::UnboundedSender<Event>, event: Event) {
        match sender.send(event) {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::SendError(event)) => {
                debug!(to = %event.to(), kind = %event.kind(), "Inbox closed, event dropped");
                self.counters.dropped_stopped.fetch_add(1, Ordering::Relaxed);
                self.end_work();
            }
        }
    }

    fn spawn_relay(self: &Arc<Self>, event: Event) {
        let Some(relay) = self.relay() else {
            self.drop_no_route(&event);
            return;
        };

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let event_id = event.id();
            let to = event.to().clone();
            match relay.relay(event).await {
                Ok(()) => {
                    shared.counters.relayed.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    shared.counters.relay_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(%event_id, %to, error = %err, "Failed to relay event");
                }
            }
            shared.end_work();
        });
    }

    fn drop_no_route(&self, event: &Event) {
        warn!(
            to = %event.to(),
            kind = %event.kind(),
            event_id = %event.id(),
            "No route for event, dropping"
        );
        self.counters.dropped_no_route.fetch_add(1, Ordering::Relaxed);
        self.end_work();
    }
}

/// Control kinds bypass a paused bus so a pause can be lifted or cut short.
fn bypasses_pause(kind: &EventKind) -> bool {
    *kind == EventKind::PAUSE || *kind == EventKind::RESUME || *kind == EventKind::TERMINATION
}

async fn route_loop(
    shared: Arc<BusShared>,
    mut rx: mpsc::UnboundedReceiver<Queued>,
    mut paused: watch::Receiver<bool>,
) {
    let mut held: VecDeque<Queued> = VecDeque::new();

    loop {
        if !*paused.borrow_and_update() {
            while let Some(queued) = held.pop_front() {
                shared.route(queued);
            }
        }

        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            changed = paused.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            queued = rx.recv() => {
                let Some(queued) = queued else { break };
                if *paused.borrow() && !bypasses_pause(queued.event.kind()) {
                    held.push_back(queued);
                } else {
                    shared.route(queued);
                }
            }
        }
    }

    debug!(discarded = held.len(), "Event routing loop stopped");
}

/// Receiving end for one agent or the environment
pub struct Inbox {
    receiver: mpsc::UnboundedReceiver<Event>,
    shared: Arc<BusShared>,
}

impl std::fmt::Debug for Inbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox").finish_non_exhaustive()
    }
}

impl Inbox {
    fn new(receiver: mpsc::UnboundedReceiver<Event>, shared: Arc<BusShared>) -> Self {
        Self { receiver, shared }
    }

    /// Next delivered event, or `None` once the bus drops this inbox
    pub async fn recv(&mut self) -> Option<Event> {
        let event = self.receiver.recv().await?;
        self.shared.end_work();
        Some(event)
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        let event = self.receiver.try_recv().ok()?;
        self.shared.end_work();
        Some(event)
    }

    /// Close the inbox and discard anything left in it
    pub fn drain(&mut self) -> usize {
        self.receiver.close();
        let mut drained = 0;
        while self.receiver.try_recv().is_ok() {
            self.shared.end_work();
            drained += 1;
        }
        drained
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        let drained = self.drain();
        if drained > 0 {
            debug!(drained, "Discarded undelivered events from closed inbox");
        }
    }
}

/// Keeps the bus non-quiescent while a handler runs
pub struct ActivityGuard {
    shared: Arc<BusShared>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.shared.active_handlers.fetch_sub(1, Ordering::AcqRel);
        self.shared.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn id(s: &str) -> AgentId {
        AgentId::parse(s).unwrap()
    }

    fn ping(from: &str, to: Address) -> Event {
        Event::new("Ping", Address::Agent(id(from)), to)
    }

    async fn recv(inbox: &mut Inbox) -> Event {
        tokio::time::timeout(Duration::from_secs(1), inbox.recv())
            .await
            .expect("timed out")
            .expect("inbox closed")
    }

    #[tokio::test]
    async fn test_unicast_delivery_in_order() {
        let bus = EventBus::new(BusConfig::default());
        let mut inbox = bus.register_agent(id("a"), "trader").unwrap();

        for i in 0..5 {
            bus.dispatch(ping("b", Address::Agent(id("a"))).with_field("n", i))
                .unwrap();
        }
        for i in 0..5 {
            assert_eq!(recv(&mut inbox).await.field("n"), Some(&i.into()));
        }
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_and_type_addressing() {
        let bus = EventBus::new(BusConfig::default());
        let mut a = bus.register_agent(id("a"), "buyer").unwrap();
        let mut b = bus.register_agent(id("b"), "seller").unwrap();
        let mut env = bus.attach_env().unwrap();

        bus.dispatch(ping("x", Address::All)).unwrap();
        assert_eq!(recv(&mut a).await.kind().as_str(), "Ping");
        assert_eq!(recv(&mut b).await.kind().as_str(), "Ping");
        assert_eq!(recv(&mut env).await.kind().as_str(), "Ping");

        bus.dispatch(ping("x", Address::Type("seller".into())).with_field("t", 1))
            .unwrap();
        assert_eq!(recv(&mut b).await.field("t"), Some(&1.into()));
        assert!(a.try_recv().is_none());
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn test_stopped_agent_is_silently_skipped() {
        let bus = EventBus::new(BusConfig::default());
        let inbox = bus.register_agent(id("a"), "t").unwrap();
        bus.mark_stopped(&id("a"));
        drop(inbox);

        bus.dispatch(ping("b", Address::Agent(id("a")))).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = bus.stats();
        assert_eq!(stats.dropped_stopped, 1);
        assert_eq!(stats.dropped_no_route, 0);
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let bus = EventBus::new(BusConfig::default());
        let _inbox = bus.register_agent(id("a"), "t").unwrap();
        assert!(matches!(
            bus.register_agent(id("a"), "t"),
            Err(MeshError::AgentAlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_holds_events_until_resume() {
        let bus = EventBus::new(BusConfig::default());
        let mut inbox = bus.register_agent(id("a"), "t").unwrap();

        bus.pause();
        bus.dispatch(ping("b", Address::Agent(id("a")))).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(inbox.try_recv().is_none());
        assert!(!bus.is_empty());

        bus.resume();
        recv(&mut inbox).await;
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn test_termination_bypasses_pause() {
        let bus = EventBus::new(BusConfig::default());
        let mut inbox = bus.register_agent(id("a"), "t").unwrap();

        bus.pause();
        bus.dispatch(Event::new(
            EventKind::TERMINATION,
            Address::Env,
            Address::Agent(id("a")),
        ))
        .unwrap();
        assert!(recv(&mut inbox).await.is(&EventKind::TERMINATION));
    }

    struct CountingRelay(AtomicUsize);

    #[async_trait]
    impl EventRelay for CountingRelay {
        async fn relay(&self, _event: Event) -> MeshResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unknown_target_goes_to_relay() {
        let bus = EventBus::new(BusConfig::default());
        let relay = Arc::new(CountingRelay(AtomicUsize::new(0)));
        bus.set_relay(relay.clone());

        bus.dispatch(ping("a", Address::Agent(id("elsewhere")))).unwrap();
        // remote-origin events are not forwarded again on a worker bus
        bus.dispatch_remote(ping("a", Address::Agent(id("elsewhere"))))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(relay.0.load(Ordering::SeqCst), 1);
        let stats = bus.stats();
        assert_eq!(stats.relayed, 1);
        assert_eq!(stats.dropped_no_route, 1);
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn test_no_route_without_relay() {
        let bus = EventBus::new(BusConfig::default());
        bus.dispatch(ping("a", Address::Agent(id("ghost")))).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.stats().dropped_no_route, 1);
    }

    #[tokio::test]
    async fn test_activity_guard_blocks_quiescence() {
        let bus = EventBus::new(BusConfig::default());
        let guard = bus.activity_guard();
        assert!(bus.is_empty());
        assert!(!bus.is_quiescent());
        drop(guard);
        assert!(bus.is_quiescent());
    }

    #[tokio::test]
    async fn test_dropped_inbox_releases_pending() {
        let bus = EventBus::new(BusConfig::default());
        let inbox = bus.register_agent(id("a"), "t").unwrap();
        bus.dispatch(ping("b", Address::Agent(id("a")))).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.pending(), 1);

        bus.mark_stopped(&id("a"));
        drop(inbox);
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_fails() {
        let bus = EventBus::new(BusConfig::default());
        bus.shutdown();
        assert!(matches!(
            bus.dispatch(ping("a", Address::Env)),
            Err(MeshError::BusClosed)
        ));
    }
}
