use colony_core::{Address, AgentId, Event, EventKind, Profile, StartSignal, TerminationNotice};
use colony_env::{
    EnvError, InMemoryTrailStore, SimulationConfig, SimulationEnvironment, SimulationMode,
    SimulationState, TrailRecord,
};
use colony_mesh::{
    AgentDefinition, AgentHandle, BusConfig, EventBus, HandlerTable, LocalLockAuthority,
    RuntimeConfig, handler_fn, spawn_agent,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

fn agent_id(id: &str) -> AgentId {
    AgentId::parse(id).unwrap()
}

/// Adds one to the environment's `score` each step, then reports the step done
fn counter_table() -> HandlerTable {
    HandlerTable::builder()
        .on(
            EventKind::START,
            "count",
            handler_fn(|ctx, event: Event| async move {
                let step = event.body::<StartSignal>()?.step;
                ctx.data()
                    .update_with(&Address::Env, "score", json!(0), |v| {
                        json!(v.as_i64().unwrap_or(0) + 1)
                    })
                    .await;
                ctx.record_decision(event.kind(), json!({"step": step}))?;
                Ok(vec![ctx.end_of_step(step)?])
            }),
        )
        .build()
        .unwrap()
}

/// Reacts to starts but never reports
fn silent_table() -> HandlerTable {
    HandlerTable::builder()
        .on(
            EventKind::START,
            "noop",
            handler_fn(|_ctx, _event: Event| async move { Ok(vec![]) }),
        )
        .build()
        .unwrap()
}

fn spawn(bus: &EventBus, id: &str, handlers: HandlerTable) -> AgentHandle {
    spawn_agent(
        AgentDefinition::new(agent_id(id), "counter", handlers),
        bus,
        Arc::new(LocalLockAuthority::new()),
        &RuntimeConfig::default(),
    )
    .unwrap()
}

fn quick_config() -> SimulationConfig {
    SimulationConfig::default()
        .with_idle_timeout(Duration::from_millis(200))
        .with_poll_interval(Duration::from_millis(10))
        .with_trail_id("test-trail")
}

#[tokio::test]
async fn test_round_mode_completes_after_max_steps() {
    let bus = EventBus::new(BusConfig::default());
    let store = Arc::new(InMemoryTrailStore::new());
    let mut profile = Profile::new();
    profile.update("score", json!(0));

    let config = quick_config()
        .with_max_steps(2)
        .with_termination_set([agent_id("a1"), agent_id("a2")]);
    let env = SimulationEnvironment::builder(config, bus.clone())
        .profile(profile)
        .trail_store(store.clone())
        .build()
        .unwrap();

    let a1 = spawn(&bus, "a1", counter_table());
    let a2 = spawn(&bus, "a2", counter_table());

    env.start().unwrap();
    let report = tokio::time::timeout(Duration::from_secs(10), env.wait_finished())
        .await
        .expect("simulation should finish");

    assert_eq!(report.final_state, SimulationState::Completed);
    assert_eq!(report.steps_completed, 2);
    assert_eq!(report.trail_id, "test-trail");
    assert!(report.started_at.is_some());
    assert_eq!(env.get_data("score").await, Some(json!(4)));

    // completion cascades termination to the agents
    tokio::time::timeout(Duration::from_secs(2), a1.stopped())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), a2.stopped())
        .await
        .unwrap();

    let states = store.states();
    assert_eq!(states.len(), 2);
    assert_eq!(states[0].0, 1);
    assert_eq!(states[1].1["environment"]["score"], json!(4));
    assert_eq!(store.step_count("test-trail"), 2);
    assert_eq!(store.decisions().len(), 4);
    assert!(
        store
            .records()
            .iter()
            .any(|r| matches!(r, TrailRecord::Event { step: 1, .. }))
    );
}

#[tokio::test]
async fn test_round_ends_on_idle_when_agent_never_reports() {
    let bus = EventBus::new(BusConfig::default());
    let config = quick_config()
        .with_max_steps(1)
        .with_termination_set([agent_id("quiet"), agent_id("ghost")]);
    let env = SimulationEnvironment::builder(config, bus.clone())
        .build()
        .unwrap();
    let _quiet = spawn(&bus, "quiet", silent_table());

    env.start().unwrap();
    let report = tokio::time::timeout(Duration::from_secs(5), env.wait_finished())
        .await
        .unwrap();
    assert_eq!(report.final_state, SimulationState::Completed);
    assert_eq!(report.steps_completed, 1);
}

#[tokio::test]
async fn test_pause_resume_and_terminate() {
    let bus = EventBus::new(BusConfig::default());
    let config = SimulationConfig::default()
        .with_idle_timeout(Duration::from_secs(60))
        .with_poll_interval(Duration::from_millis(10))
        .with_termination_set([agent_id("slow")]);
    let env = SimulationEnvironment::builder(config, bus.clone())
        .build()
        .unwrap();
    let slow = spawn(&bus, "slow", silent_table());

    assert!(matches!(
        env.pause().await,
        Err(EnvError::InvalidTransition { .. })
    ));
    env.start().unwrap();
    assert!(env.start().is_err());

    env.pause().await.unwrap();
    assert_eq!(env.state(), SimulationState::Paused);
    assert!(bus.is_paused());
    tokio::time::sleep(Duration::from_millis(30)).await;

    env.resume().await.unwrap();
    assert_eq!(env.state(), SimulationState::Running);
    assert!(!bus.is_paused());

    env.terminate("operator request").await.unwrap();
    let report = env.wait_finished().await;
    assert_eq!(report.final_state, SimulationState::Terminated);
    assert_eq!(report.reason.as_deref(), Some("operator request"));
    assert!(report.paused_ms >= 20);

    // repeated termination is a no-op
    env.terminate("again").await.unwrap();
    assert_eq!(env.report().reason.as_deref(), Some("operator request"));

    tokio::time::timeout(Duration::from_secs(2), slow.stopped())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_pause_and_resume_events_restart_the_idle_clock() {
    let bus = EventBus::new(BusConfig::default());
    let config = SimulationConfig::default()
        .with_max_steps(1)
        .with_idle_timeout(Duration::from_millis(300))
        .with_poll_interval(Duration::from_millis(10))
        .with_termination_set([agent_id("slow")]);
    let env = SimulationEnvironment::builder(config, bus.clone())
        .build()
        .unwrap();
    let _slow = spawn(&bus, "slow", silent_table());
    let mut state = env.subscribe_state();

    env.start().unwrap();
    bus.dispatch(Event::new(EventKind::PAUSE, Address::Env, Address::All))
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == SimulationState::Paused),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(bus.is_paused());

    // paused for longer than the idle timeout
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(env.steps_completed(), 0);

    bus.dispatch(Event::new(EventKind::RESUME, Address::Agent(agent_id("slow")), Address::Env))
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == SimulationState::Running),
    )
    .await
    .unwrap()
    .unwrap();

    // the idle window starts over at resume
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(env.steps_completed(), 0);
    assert_eq!(env.state(), SimulationState::Running);

    let report = tokio::time::timeout(Duration::from_secs(3), env.wait_finished())
        .await
        .unwrap();
    assert_eq!(report.final_state, SimulationState::Completed);
    assert_eq!(report.steps_completed, 1);
    assert!(report.paused_ms >= 400, "{report:?}");
}

#[tokio::test]
async fn test_terminate_before_start_is_rejected() {
    let bus = EventBus::new(BusConfig::default());
    let env = SimulationEnvironment::builder(quick_config(), bus)
        .build()
        .unwrap();
    assert!(env.terminate("too early").await.is_err());
    assert_eq!(env.state(), SimulationState::Initialized);
}

#[tokio::test]
async fn test_termination_event_from_agent() {
    let bus = EventBus::new(BusConfig::default());
    let config = SimulationConfig::default()
        .with_idle_timeout(Duration::from_secs(60))
        .with_termination_set([agent_id("slow")]);
    let env = SimulationEnvironment::builder(config, bus.clone())
        .build()
        .unwrap();
    env.start().unwrap();

    let notice = Event::new(
        EventKind::TERMINATION,
        Address::Agent(agent_id("judge")),
        Address::Env,
    )
    .with_body(&TerminationNotice {
        reason: "winner found".into(),
    })
    .unwrap();
    bus.dispatch(notice).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), env.wait_finished())
        .await
        .unwrap();
    assert_eq!(report.final_state, SimulationState::Terminated);
    assert_eq!(report.reason.as_deref(), Some("winner found"));
}

#[tokio::test]
async fn test_timed_mode_runs_until_exhausted_and_idle() {
    let bus = EventBus::new(BusConfig::default());
    let store = Arc::new(InMemoryTrailStore::new());
    let config = quick_config()
        .with_mode(SimulationMode::Timed {
            interval: Duration::from_millis(30),
        })
        .with_max_steps(3)
        .with_idle_timeout(Duration::from_millis(100));
    let env = SimulationEnvironment::builder(config, bus.clone())
        .trail_store(store.clone())
        .build()
        .unwrap();
    let _counter = spawn(&bus, "ticker", counter_table());

    env.start().unwrap();
    let report = tokio::time::timeout(Duration::from_secs(10), env.wait_finished())
        .await
        .unwrap();

    assert_eq!(report.final_state, SimulationState::Completed);
    assert_eq!(report.steps_completed, 3);
    assert_eq!(env.get_data("score").await, Some(json!(3)));
    assert_eq!(store.step_count("test-trail"), 3);
}

#[tokio::test]
async fn test_environment_serves_data_requests() {
    let bus = EventBus::new(BusConfig::default());
    let mut profile = Profile::new();
    profile.update("price", json!(12));
    let env = SimulationEnvironment::builder(quick_config(), bus.clone())
        .profile(profile)
        .build()
        .unwrap();

    let reader = HandlerTable::builder()
        .on(
            "Probe",
            "read",
            handler_fn(|ctx, _event: Event| async move {
                let price = ctx.data().get_data(&Address::Env, "price", Value::Null).await;
                ctx.set("seen", price).await;
                Ok(vec![])
            }),
        )
        .build()
        .unwrap();
    let handle = spawn(&bus, "reader", reader);

    bus.dispatch(Event::new(
        "Probe",
        Address::Env,
        Address::Agent(agent_id("reader")),
    ))
    .unwrap();

    let mut seen = None;
    for _ in 0..100 {
        seen = handle.profile().read().await.get("seen").cloned();
        if seen.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen, Some(json!(12)));

    env.update_data("price", json!(15)).await;
    assert_eq!(env.profile_snapshot().await["price"], json!(15));
}

#[tokio::test]
async fn test_second_environment_on_same_bus_is_rejected() {
    let bus = EventBus::new(BusConfig::default());
    let _first = SimulationEnvironment::builder(quick_config(), bus.clone())
        .build()
        .unwrap();
    assert!(
        SimulationEnvironment::builder(quick_config(), bus)
            .build()
            .is_err()
    );
}
