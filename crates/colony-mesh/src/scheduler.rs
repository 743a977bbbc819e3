//! Periodic event emission with pause-aware timing.
//!
//! Each [`ScheduleSpec`] runs as its own task that emits a `StartSignal`
//! bodied event every `interval`. Time spent paused does not count toward
//! the interval: a schedule paused halfway through resumes with the other
//! half still to wait.

use colony_core::{Address, Event, EventKind, StartSignal};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::error::{MeshError, MeshResult};

#[derive(Debug, Clone)]
pub struct ScheduleSpec {
    pub name: String,
    pub interval: Duration,
    /// Stop after this many firings; `None` runs until stopped
    pub max_steps: Option<u64>,
    /// Fire step 1 right away instead of after one interval
    pub fire_immediately: bool,
    pub kind: EventKind,
    pub target: Address,
}

impl ScheduleSpec {
    /// A `StartEvent` to every agent each `interval`
    pub fn start_events(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            max_steps: None,
            fire_immediately: true,
            kind: EventKind::START,
            target: Address::All,
        }
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_target(mut self, target: Address) -> Self {
        self.target = target;
        self
    }

    pub fn with_kind(mut self, kind: impl Into<EventKind>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Wait one full interval before step 1
    pub fn delayed_start(mut self) -> Self {
        self.fire_immediately = false;
        self
    }
}

/// Notification sent after each firing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFired {
    pub schedule: String,
    pub step: u64,
}

#[derive(Default)]
struct Progress {
    fired: AtomicU64,
    scheduled: AtomicUsize,
    completed: AtomicUsize,
}

pub struct Scheduler {
    bus: EventBus,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    progress: Arc<Progress>,
    steps_tx: mpsc::UnboundedSender<StepFired>,
    steps_rx: Mutex<Option<mpsc::UnboundedReceiver<StepFired>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("fired", &self.fired())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl Scheduler {
    pub fn new(bus: EventBus) -> Self {
        let (paused, _) = watch::channel(false);
        let (steps_tx, steps_rx) = mpsc::unbounded_channel();
        Self {
            bus,
            paused,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            progress: Arc::new(Progress::default()),
            steps_tx,
            steps_rx: Mutex::new(Some(steps_rx)),
        }
    }

    /// Start emitting according to `spec`
    ///
    /// # Errors
    ///
    /// [`MeshError::InvalidConfig`] for a zero interval or after [`Scheduler::stop`].
    pub fn schedule(&self, spec: ScheduleSpec) -> MeshResult<()> {
        if spec.interval.is_zero() {
            return Err(MeshError::InvalidConfig(format!(
                "schedule '{}' has a zero interval",
                spec.name
            )));
        }
        if self.cancel.is_cancelled() {
            return Err(MeshError::InvalidConfig("scheduler already stopped".into()));
        }

        info!(
            schedule = %spec.name,
            interval = ?spec.interval,
            max_steps = ?spec.max_steps,
            "Schedule started"
        );
        self.progress.scheduled.fetch_add(1, Ordering::AcqRel);
        let task = tokio::spawn(run_schedule(
            spec,
            self.bus.clone(),
            self.paused.subscribe(),
            self.cancel.clone(),
            Arc::clone(&self.progress),
            self.steps_tx.clone(),
        ));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
        Ok(())
    }

    /// Receiver of [`StepFired`] notifications; `None` after the first call
    pub fn take_step_notifications(&self) -> Option<mpsc::UnboundedReceiver<StepFired>> {
        self.steps_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Total firings across all schedules
    pub fn fired(&self) -> u64 {
        self.progress.fired.load(Ordering::Acquire)
    }

    /// Every schedule has reached its step limit
    pub fn is_exhausted(&self) -> bool {
        let scheduled = self.progress.scheduled.load(Ordering::Acquire);
        scheduled > 0 && self.progress.completed.load(Ordering::Acquire) == scheduled
    }

    /// Cancel all schedules and wait for their tasks
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks = self
            .tasks
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Schedule task failed");
            }
        }
        debug!("Scheduler stopped");
    }
}

async fn run_schedule(
    spec: ScheduleSpec,
    bus: EventBus,
    mut paused: watch::Receiver<bool>,
    cancel: CancellationToken,
    progress: Arc<Progress>,
    steps: mpsc::UnboundedSender<StepFired>,
) {
    let mut step = 0u64;
    let mut first = true;

    loop {
        if spec.max_steps.is_some_and(|max| step >= max) {
            progress.completed.fetch_add(1, Ordering::AcqRel);
            info!(schedule = %spec.name, steps = step, "Schedule exhausted");
            return;
        }

        let wait = if first && spec.fire_immediately {
            Duration::ZERO
        } else {
            spec.interval
        };
        first = false;
        if !wait_active(wait, &mut paused, &cancel).await {
            return;
        }

        step += 1;
        let event = match Event::new(spec.kind.clone(), Address::Env, spec.target.clone())
            .with_body(&StartSignal { step })
        {
            Ok(event) => event,
            Err(err) => {
                warn!(schedule = %spec.name, error = %err, "Could not build scheduled event");
                return;
            }
        };
        if let Err(err) = bus.dispatch(event) {
            warn!(schedule = %spec.name, error = %err, "Scheduled event not dispatched");
            return;
        }

        progress.fired.fetch_add(1, Ordering::AcqRel);
        debug!(schedule = %spec.name, step, "Schedule fired");
        // receiver may be gone; notifications are advisory
        let _ = steps.send(StepFired {
            schedule: spec.name.clone(),
            step,
        });
    }
}

/// Sleep for `remaining` of unpaused time. Returns `false` if cancelled.
async fn wait_active(
    mut remaining: Duration,
    paused: &mut watch::Receiver<bool>,
    cancel: &CancellationToken,
) -> bool {
    loop {
        while *paused.borrow_and_update() {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }

        if remaining.is_zero() {
            return !cancel.is_cancelled();
        }

        let started = Instant::now();
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(remaining) => return true,
            changed = paused.changed() => {
                if changed.is_err() {
                    return false;
                }
                remaining = remaining.saturating_sub(started.elapsed());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use colony_core::AgentId;

    fn setup() -> (EventBus, crate::bus::Inbox) {
        let bus = EventBus::new(BusConfig::default());
        let inbox = bus
            .register_agent(AgentId::parse("a").unwrap(), "t")
            .unwrap();
        (bus, inbox)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_every_interval_until_max_steps() {
        let (bus, mut inbox) = setup();
        let scheduler = Scheduler::new(bus);
        scheduler
            .schedule(ScheduleSpec::start_events("tick", Duration::from_secs(1)).with_max_steps(3))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(scheduler.fired(), 3);
        assert!(scheduler.is_exhausted());

        for expected in 1..=3 {
            let event = inbox.recv().await.unwrap();
            assert_eq!(event.body::<StartSignal>().unwrap().step, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_preserves_remaining_interval() {
        let (bus, _inbox) = setup();
        let scheduler = Scheduler::new(bus);
        scheduler
            .schedule(ScheduleSpec::start_events("tick", Duration::from_secs(10)).delayed_start())
            .unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        scheduler.pause();
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(scheduler.fired(), 0);

        scheduler.resume();
        tokio::time::sleep(Duration::from_millis(5900)).await;
        assert_eq!(scheduler.fired(), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(scheduler.fired(), 1);

        scheduler.stop().await;
        assert!(!scheduler.is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_step_is_immediate_and_notified() {
        let (bus, _inbox) = setup();
        let scheduler = Scheduler::new(bus);
        let mut steps = scheduler.take_step_notifications().unwrap();
        assert!(scheduler.take_step_notifications().is_none());

        scheduler
            .schedule(
                ScheduleSpec::start_events("round", Duration::from_secs(5)).with_max_steps(1),
            )
            .unwrap();

        let fired = steps.recv().await.unwrap();
        assert_eq!(fired, StepFired { schedule: "round".into(), step: 1 });
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let (bus, _inbox) = setup();
        let scheduler = Scheduler::new(bus);
        assert!(
            scheduler
                .schedule(ScheduleSpec::start_events("bad", Duration::ZERO))
                .is_err()
        );
    }
}
