//! The simulation environment: authoritative state machine, round and timed
//! progression, environment data, and step-boundary persistence.

use chrono::{DateTime, Utc};
use colony_core::{
    Address, AgentId, DecisionRecord, EndReport, Event, EventEnvelope, EventKind, Profile,
    StartSignal, TerminationNotice,
};
use colony_mesh::{EventBus, EventTap, Inbox, ScheduleSpec, Scheduler, answer_data_event};
use colony_observability::RuntimeMetrics;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, Notify, RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{PersistenceBuffer, TrailEntry};
use crate::config::{SimulationConfig, SimulationMode};
use crate::error::{EnvError, EnvResult};
use crate::probe::{ActivityProbe, BusProbe, ControlBroadcaster};
use crate::state::SimulationState;
use crate::trail::{InMemoryTrailStore, TrailStore};

/// Summary handed back once a simulation reaches a terminal state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub trail_id: String,
    pub final_state: SimulationState,
    pub started_at: Option<DateTime<Utc>>,
    pub steps_completed: u64,
    pub run_ms: u64,
    pub paused_ms: u64,
    pub events_dispatched: u64,
    pub reason: Option<String>,
}

/// Events dispatched since the last step boundary
#[derive(Default)]
struct StepRecorder {
    events: Mutex<Vec<EventEnvelope>>,
}

impl StepRecorder {
    fn drain(&self) -> Vec<EventEnvelope> {
        self.events
            .lock()
            .map(|mut events| std::mem::take(&mut *events))
            .unwrap_or_default()
    }
}

impl EventTap for StepRecorder {
    fn observe(&self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(EventEnvelope::from(event));
        }
    }
}

struct StepProgress {
    step: u64,
    reported: HashSet<AgentId>,
    started: Instant,
    events_at_start: u64,
}

#[derive(Default)]
struct Timing {
    started_at: Option<Instant>,
    started_wall: Option<DateTime<Utc>>,
    paused_since: Option<Instant>,
    paused_total: Duration,
    finished_at: Option<Instant>,
}

impl Timing {
    fn end_pause(&mut self) {
        if let Some(since) = self.paused_since.take() {
            self.paused_total += since.elapsed();
        }
    }

    fn paused(&self) -> Duration {
        self.paused_total + self.paused_since.map(|s| s.elapsed()).unwrap_or_default()
    }

    fn run(&self) -> Duration {
        let Some(started) = self.started_at else {
            return Duration::ZERO;
        };
        let end = self.finished_at.unwrap_or_else(Instant::now);
        end.saturating_duration_since(started)
            .saturating_sub(self.paused())
    }
}

enum RoundEnd {
    Reported,
    Idle { missing: Vec<AgentId> },
    Cancelled,
}

struct EnvInner {
    config: SimulationConfig,
    bus: EventBus,
    profile: Arc<RwLock<Profile>>,
    state: watch::Sender<SimulationState>,
    finished: watch::Sender<bool>,
    probe: Arc<dyn ActivityProbe>,
    broadcaster: Option<Arc<dyn ControlBroadcaster>>,
    metrics: Option<Arc<RuntimeMetrics>>,
    scheduler: Scheduler,
    persistence: PersistenceBuffer,
    recorder: Arc<StepRecorder>,
    decisions: Mutex<Vec<DecisionRecord>>,
    progress: Mutex<StepProgress>,
    steps_completed: AtomicU64,
    timing: Mutex<Timing>,
    reason: Mutex<Option<String>>,
    end_reported: Notify,
    /// Serializes pause and resume, which both wait on remote peers
    control: AsyncMutex<()>,
    cancel: CancellationToken,
}

pub struct EnvironmentBuilder {
    config: SimulationConfig,
    bus: EventBus,
    profile: Profile,
    probe: Option<Arc<dyn ActivityProbe>>,
    trail: Option<Arc<dyn TrailStore>>,
    broadcaster: Option<Arc<dyn ControlBroadcaster>>,
    metrics: Option<Arc<RuntimeMetrics>>,
}

impl EnvironmentBuilder {
    /// Initial environment data
    pub fn profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    /// Idle detection source; defaults to this process's bus alone
    pub fn probe(mut self, probe: Arc<dyn ActivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Trail persistence; defaults to an in-memory store
    pub fn trail_store(mut self, store: Arc<dyn TrailStore>) -> Self {
        self.trail = Some(store);
        self
    }

    pub fn broadcaster(mut self, broadcaster: Arc<dyn ControlBroadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn metrics(mut self, metrics: Arc<RuntimeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Claim the bus's `ENV` inbox and start serving environment events
    ///
    /// # Errors
    ///
    /// Fails on an invalid config or if another environment owns the bus.
    pub fn build(self) -> EnvResult<SimulationEnvironment> {
        self.config.validate()?;
        let inbox = self.bus.attach_env()?;

        let recorder = Arc::new(StepRecorder::default());
        self.bus.add_tap(recorder.clone());

        let trail = self
            .trail
            .unwrap_or_else(|| Arc::new(InMemoryTrailStore::new()));
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(BusProbe::new(self.bus.clone())));
        let (state, _) = watch::channel(SimulationState::Initialized);
        let (finished, _) = watch::channel(false);

        let inner = Arc::new(EnvInner {
            persistence: PersistenceBuffer::spawn(trail, self.config.trail_id.clone()),
            scheduler: Scheduler::new(self.bus.clone()),
            config: self.config,
            bus: self.bus,
            profile: Arc::new(RwLock::new(self.profile)),
            state,
            finished,
            probe,
            broadcaster: self.broadcaster,
            metrics: self.metrics,
            recorder,
            decisions: Mutex::new(Vec::new()),
            progress: Mutex::new(StepProgress {
                step: 0,
                reported: HashSet::new(),
                started: Instant::now(),
                events_at_start: 0,
            }),
            steps_completed: AtomicU64::new(0),
            timing: Mutex::new(Timing::default()),
            reason: Mutex::new(None),
            end_reported: Notify::new(),
            control: AsyncMutex::new(()),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(serve_inbox(
            Arc::downgrade(&inner),
            inbox,
            inner.cancel.clone(),
        ));
        Ok(SimulationEnvironment { inner })
    }
}

/// Handle to the environment; cheap to clone
#[derive(Clone)]
pub struct SimulationEnvironment {
    inner: Arc<EnvInner>,
}

impl std::fmt::Debug for SimulationEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationEnvironment")
            .field("trail_id", &self.inner.config.trail_id)
            .field("state", &self.state())
            .field("step", &self.current_step())
            .finish()
    }
}

impl SimulationEnvironment {
    pub fn builder(config: SimulationConfig, bus: EventBus) -> EnvironmentBuilder {
        EnvironmentBuilder {
            config,
            bus,
            profile: Profile::new(),
            probe: None,
            trail: None,
            broadcaster: None,
            metrics: None,
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn state(&self) -> SimulationState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SimulationState> {
        self.inner.state.subscribe()
    }

    /// Round or step currently in progress; 0 before the first
    pub fn current_step(&self) -> u64 {
        self.inner.progress.lock().map(|p| p.step).unwrap_or_default()
    }

    pub fn steps_completed(&self) -> u64 {
        self.inner.steps_completed.load(Ordering::Acquire)
    }

    pub async fn get_data(&self, key: &str) -> Option<Value> {
        self.inner.profile.read().await.get(key).cloned()
    }

    pub async fn update_data(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.inner.profile.write().await.update(key, value)
    }

    pub async fn profile_snapshot(&self) -> Value {
        self.inner.profile.read().await.snapshot()
    }

    /// `Initialized -> Running` and begin driving rounds or timed steps
    pub fn start(&self) -> EnvResult<()> {
        self.inner
            .transition_if(SimulationState::Running, |s| s == SimulationState::Initialized)?;
        if let Ok(mut timing) = self.inner.timing.lock() {
            timing.started_at = Some(Instant::now());
            timing.started_wall = Some(Utc::now());
        }
        info!(
            trail_id = %self.inner.config.trail_id,
            mode = ?self.inner.config.mode,
            max_steps = self.inner.config.max_steps,
            "Simulation started"
        );

        let inner = Arc::clone(&self.inner);
        match self.inner.config.mode {
            SimulationMode::Round => tokio::spawn(run_rounds(inner)),
            SimulationMode::Timed { interval } => tokio::spawn(run_timed(inner, interval)),
        };
        Ok(())
    }

    /// Freeze event delivery and timers here and on every remote bus
    pub async fn pause(&self) -> EnvResult<()> {
        let _control = self.inner.control.lock().await;
        self.inner.transition(SimulationState::Paused)?;
        self.inner.bus.pause();
        self.inner.scheduler.pause();
        if let Ok(mut timing) = self.inner.timing.lock() {
            timing.paused_since = Some(Instant::now());
        }
        if let Some(broadcaster) = &self.inner.broadcaster {
            broadcaster.broadcast_pause().await;
        }
        Ok(())
    }

    /// Every bus is released, and its idle clock restarted, before the
    /// state goes back to `Running`; idle checks never see a pre-pause
    /// timestamp.
    pub async fn resume(&self) -> EnvResult<()> {
        let _control = self.inner.control.lock().await;
        let current = self.state();
        if current != SimulationState::Paused {
            return Err(EnvError::InvalidTransition {
                from: current,
                to: SimulationState::Running,
            });
        }
        if let Some(broadcaster) = &self.inner.broadcaster {
            broadcaster.broadcast_resume().await;
        }
        self.inner.bus.resume();
        self.inner.bus.touch();
        self.inner.scheduler.resume();
        if let Ok(mut timing) = self.inner.timing.lock() {
            timing.end_pause();
        }
        self.inner
            .transition_if(SimulationState::Running, |s| s == SimulationState::Paused)?;
        Ok(())
    }

    /// Stop the simulation early. Repeated calls after it finished are no-ops.
    ///
    /// # Errors
    ///
    /// [`EnvError::InvalidTransition`] if the simulation never started.
    pub async fn terminate(&self, reason: &str) -> EnvResult<()> {
        if self.state().is_terminal() {
            debug!(reason, "Simulation already finished, termination ignored");
            return Ok(());
        }
        match self.inner.transition(SimulationState::Terminated) {
            Ok(_) => {}
            Err(_) if self.state().is_terminal() => return Ok(()),
            Err(err) => return Err(err),
        }
        self.inner.finalize(reason).await;
        Ok(())
    }

    /// Move to `Error` after an unrecoverable fault
    pub async fn fail(&self, reason: &str) {
        self.inner.fail(reason).await;
    }

    /// Wait until the simulation has finished and its trail is flushed
    pub async fn wait_finished(&self) -> SimulationReport {
        let mut finished = self.inner.finished.subscribe();
        // sender lives in `inner`, which `self` keeps alive
        let _ = finished.wait_for(|done| *done).await;
        self.report()
    }

    pub fn report(&self) -> SimulationReport {
        let (run, paused, started_at) = self
            .inner
            .timing
            .lock()
            .map(|t| (t.run(), t.paused(), t.started_wall))
            .unwrap_or_default();
        SimulationReport {
            trail_id: self.inner.config.trail_id.clone(),
            final_state: self.state(),
            started_at,
            steps_completed: self.steps_completed(),
            run_ms: millis(run),
            paused_ms: millis(paused),
            events_dispatched: self.inner.bus.stats().dispatched,
            reason: self.inner.reason.lock().ok().and_then(|r| r.clone()),
        }
    }

    async fn handle_event(&self, event: Event) {
        let kind = event.kind().clone();

        if kind == EventKind::PAUSE {
            if let Err(err) = self.pause().await {
                debug!(error = %err, "Pause event ignored");
            }
        } else if kind == EventKind::RESUME {
            if let Err(err) = self.resume().await {
                debug!(error = %err, "Resume event ignored");
            }
        } else if kind == EventKind::TERMINATION {
            let reason = event
                .body::<TerminationNotice>()
                .map(|notice| notice.reason)
                .ok()
                .filter(|reason| !reason.is_empty())
                .unwrap_or_else(|| format!("termination event from {}", event.from()));
            if let Err(err) = self.terminate(&reason).await {
                warn!(error = %err, "Termination event rejected");
            }
        } else if kind == EventKind::DATA_REQUEST || kind == EventKind::DATA_UPDATE {
            match answer_data_event(&Address::Env, &self.inner.profile, &event).await {
                Ok(Some(reply)) => {
                    if let Err(err) = self.inner.bus.dispatch(reply) {
                        warn!(error = %err, "Failed to answer environment data request");
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(from = %event.from(), error = %err, "Malformed data event"),
            }
        } else if kind == EventKind::END {
            match (event.from().as_agent(), event.body::<EndReport>()) {
                (Some(agent), Ok(report)) => self.inner.record_end(agent.clone(), report.step),
                _ => warn!(from = %event.from(), "Malformed end report"),
            }
        } else if kind == EventKind::DECISION {
            match event.body::<DecisionRecord>() {
                Ok(decision) => {
                    if let Ok(mut decisions) = self.inner.decisions.lock() {
                        decisions.push(decision);
                    }
                }
                Err(err) => warn!(from = %event.from(), error = %err, "Malformed decision"),
            }
        } else if kind == EventKind::START {
            // our own start broadcast echoing back through `all`
        } else {
            debug!(%kind, from = %event.from(), "Environment has no handler for event");
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl EnvInner {
    fn state(&self) -> SimulationState {
        *self.state.borrow()
    }

    fn transition(&self, to: SimulationState) -> EnvResult<SimulationState> {
        self.transition_if(to, |_| true)
    }

    fn transition_if(
        &self,
        to: SimulationState,
        guard: impl FnOnce(SimulationState) -> bool,
    ) -> EnvResult<SimulationState> {
        let mut outcome = Err(EnvError::InvalidTransition { from: to, to });
        self.state.send_if_modified(|current| {
            let from = *current;
            if guard(from) && from.can_transition_to(to) {
                *current = to;
                outcome = Ok(from);
                true
            } else {
                outcome = Err(EnvError::InvalidTransition { from, to });
                false
            }
        });
        if let Ok(from) = &outcome {
            info!(%from, %to, trail_id = %self.config.trail_id, "Simulation state changed");
        }
        outcome
    }

    async fn fail(&self, reason: &str) {
        if self.transition(SimulationState::Error).is_ok() {
            error!(reason, "Simulation failed");
            self.finalize(reason).await;
        }
    }

    /// Move to `Completed`, waiting out a pause that raced with the last step
    async fn complete(&self) {
        loop {
            match self.transition(SimulationState::Completed) {
                Ok(_) => break,
                Err(_) if self.state() == SimulationState::Paused => {
                    if !self.wait_while_paused().await {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
        self.finalize("completed").await;
    }

    /// Shared teardown for every terminal state
    async fn finalize(&self, reason: &str) {
        if let Ok(mut slot) = self.reason.lock() {
            slot.get_or_insert_with(|| reason.to_string());
        }
        self.cancel.cancel();
        self.scheduler.stop().await;
        if self.bus.is_paused() {
            self.bus.resume();
        }
        if let Ok(mut timing) = self.timing.lock() {
            timing.end_pause();
        }

        let notice = Event::new(EventKind::TERMINATION, Address::Env, Address::All).with_body(
            &TerminationNotice {
                reason: reason.to_string(),
            },
        );
        match notice {
            Ok(notice) => {
                if let Err(err) = self.bus.dispatch(notice) {
                    warn!(error = %err, "Could not broadcast termination");
                }
            }
            Err(err) => warn!(error = %err, "Could not build termination notice"),
        }
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.broadcast_termination(reason).await;
        }

        if let Ok(mut timing) = self.timing.lock() {
            timing.finished_at = Some(Instant::now());
        }
        self.persistence.flush().await;
        info!(
            state = %self.state(),
            steps = self.steps_completed.load(Ordering::Acquire),
            reason,
            "Simulation finished"
        );
        self.finished.send_replace(true);
    }

    async fn wait_while_paused(&self) -> bool {
        let mut state = self.state.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            resumed = async { state.wait_for(|s| *s != SimulationState::Paused).await.map(|_| ()) } => {
                resumed.is_ok()
            }
        }
    }

    fn begin_step(&self, step: u64) {
        if let Ok(mut progress) = self.progress.lock() {
            progress.step = step;
            progress.reported.clear();
            progress.started = Instant::now();
            progress.events_at_start = self.bus.stats().dispatched;
        }
        info!(step, "Step started");
    }

    fn record_end(&self, agent: AgentId, step: u64) {
        let accepted = match self.progress.lock() {
            Ok(mut progress) if progress.step == step => {
                progress.reported.insert(agent.clone());
                true
            }
            _ => false,
        };
        if accepted {
            debug!(agent_id = %agent, step, "Agent reported end of step");
            self.end_reported.notify_one();
        } else {
            debug!(agent_id = %agent, step, "Stale end report ignored");
        }
    }

    fn all_reported(&self) -> bool {
        let set = &self.config.termination_set;
        !set.is_empty()
            && self
                .progress
                .lock()
                .map(|p| set.iter().all(|agent| p.reported.contains(agent)))
                .unwrap_or(false)
    }

    fn missing_reports(&self) -> Vec<AgentId> {
        let reported: HashSet<AgentId> = self
            .progress
            .lock()
            .map(|p| p.reported.clone())
            .unwrap_or_default();
        self.config
            .termination_set
            .iter()
            .filter(|agent| !reported.contains(*agent))
            .cloned()
            .collect()
    }

    async fn cluster_idle(&self) -> bool {
        let snapshot = self.probe.snapshot().await;
        snapshot.is_quiet() && Duration::from_millis(snapshot.idle_ms) >= self.config.idle_timeout
    }

    async fn wait_round_end(&self) -> RoundEnd {
        loop {
            if !self.wait_while_paused().await {
                return RoundEnd::Cancelled;
            }
            // explicit completion wins over an idle timeout seen at the same check
            if self.all_reported() {
                return RoundEnd::Reported;
            }
            if self.state() == SimulationState::Running && self.cluster_idle().await {
                if self.all_reported() {
                    return RoundEnd::Reported;
                }
                return RoundEnd::Idle {
                    missing: self.missing_reports(),
                };
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return RoundEnd::Cancelled,
                _ = self.end_reported.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    fn broadcast_start(&self, step: u64) -> EnvResult<()> {
        let event = Event::new(
            EventKind::START,
            Address::Env,
            self.config.start_target.clone(),
        )
        .with_body(&StartSignal { step })?;
        self.bus.dispatch(event)?;
        Ok(())
    }

    /// Persist the step's trail through the buffer and count it
    async fn end_step(&self, step: u64) {
        let (duration, events) = self
            .progress
            .lock()
            .map(|p| {
                (
                    p.started.elapsed(),
                    self.bus.stats().dispatched.saturating_sub(p.events_at_start),
                )
            })
            .unwrap_or_default();

        let profile = self.profile.read().await.snapshot();
        self.persistence.push(TrailEntry::State {
            step,
            state: json!({
                "step": step,
                "duration_ms": millis(duration),
                "events": events,
                "environment": profile,
            }),
        });
        for event in self.recorder.drain() {
            self.persistence.push(TrailEntry::Event { step, event });
        }
        let decisions = self
            .decisions
            .lock()
            .map(|mut d| std::mem::take(&mut *d))
            .unwrap_or_default();
        for decision in decisions {
            self.persistence.push(TrailEntry::Decision { step, decision });
        }
        self.persistence.push(TrailEntry::StepCompleted);
        self.persistence.request_flush();

        self.steps_completed.fetch_add(1, Ordering::AcqRel);
        if let Some(metrics) = &self.metrics {
            metrics.record_round_completed();
        }
        info!(step, duration_ms = millis(duration), events, "Step completed");
    }
}

async fn run_rounds(inner: Arc<EnvInner>) {
    for round in 1..=inner.config.max_steps {
        if inner.cancel.is_cancelled() {
            return;
        }
        inner.begin_step(round);
        if let Err(err) = inner.broadcast_start(round) {
            inner.fail(&format!("could not start round {round}: {err}")).await;
            return;
        }

        match inner.wait_round_end().await {
            RoundEnd::Reported => debug!(round, "All tracked agents reported"),
            RoundEnd::Idle { missing } if missing.is_empty() => {
                debug!(round, "Round ended on idle timeout");
            }
            RoundEnd::Idle { missing } => {
                let missing: BTreeSet<String> = missing.iter().map(ToString::to_string).collect();
                warn!(round, ?missing, "Round ended on idle timeout before all agents reported");
            }
            RoundEnd::Cancelled => return,
        }
        inner.end_step(round).await;
    }
    inner.complete().await;
}

async fn run_timed(inner: Arc<EnvInner>, interval: Duration) {
    let Some(mut fired) = inner.scheduler.take_step_notifications() else {
        inner.fail("scheduler notifications already taken").await;
        return;
    };
    let spec = ScheduleSpec::start_events("simulation", interval)
        .with_max_steps(inner.config.max_steps)
        .with_target(inner.config.start_target.clone());
    if let Err(err) = inner.scheduler.schedule(spec) {
        inner.fail(&format!("could not schedule steps: {err}")).await;
        return;
    }

    let mut current = 0u64;
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            step = fired.recv() => {
                let Some(step) = step else { continue };
                if current > 0 {
                    inner.end_step(current).await;
                }
                current = step.step;
                inner.begin_step(current);
            }
            _ = tokio::time::sleep(inner.config.poll_interval) => {
                if inner.state() == SimulationState::Running
                    && inner.scheduler.is_exhausted()
                    && inner.cluster_idle().await
                {
                    break;
                }
            }
        }
    }

    // notifications fired just before exhaustion
    while let Ok(step) = fired.try_recv() {
        if current > 0 {
            inner.end_step(current).await;
        }
        current = step.step;
    }
    if current > 0 {
        inner.end_step(current).await;
    }
    inner.complete().await;
}

async fn serve_inbox(env: Weak<EnvInner>, mut inbox: Inbox, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = inbox.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = env.upgrade() else { break };
        SimulationEnvironment { inner }.handle_event(event).await;
    }
    debug!("Environment inbox closed");
}
