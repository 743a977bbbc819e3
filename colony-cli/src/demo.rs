//! Demo population used by `colony master`.
//!
//! Every `counter` agent, on each step, bumps the shared `score` in the
//! environment under the distributed lock, greets its neighbour (usually on
//! another worker), records a decision and reports the step finished.

use colony_core::{Address, AgentConfig, AgentId, Event, EventKind, StartSignal};
use colony_mesh::{AgentTypeRegistry, HandlerTable, MeshError, MeshResult, handler_fn};
use serde_json::{Value, json};

pub const AGENT_TYPE: &str = "counter";
const GREETING: &str = "Greeting";

pub fn agent_id(index: usize) -> MeshResult<AgentId> {
    let raw = format!("agent-{index}");
    AgentId::parse(&raw).map_err(|e| MeshError::InvalidConfig(format!("{raw}: {e}")))
}

/// `count` counters, each pointing at the next one as its neighbour
pub fn population(count: usize) -> MeshResult<Vec<AgentConfig>> {
    (1..=count)
        .map(|i| {
            let neighbour = agent_id(i % count + 1)?;
            Ok(AgentConfig::new(agent_id(i)?, AGENT_TYPE)
                .with_profile_field("neighbour", neighbour.to_string())
                .with_profile_field("greetings", 0))
        })
        .collect()
}

pub fn agent_types() -> AgentTypeRegistry {
    AgentTypeRegistry::new().register(AGENT_TYPE, |_config| counter_table())
}

fn counter_table() -> MeshResult<HandlerTable> {
    HandlerTable::builder()
        .on(
            EventKind::START,
            "count",
            handler_fn(|ctx, event: Event| async move {
                let step = event.body::<StartSignal>()?.step;
                let counted = ctx
                    .data()
                    .update_with(&Address::Env, "score", json!(0), |score| {
                        json!(score.as_i64().unwrap_or(0) + 1)
                    })
                    .await;

                let mut out = Vec::new();
                if let Some(Value::String(neighbour)) = ctx.get("neighbour").await {
                    if let Ok(neighbour) = AgentId::parse(&neighbour) {
                        out.push(
                            ctx.event(GREETING, Address::Agent(neighbour))
                                .with_field("step", step),
                        );
                    }
                }
                ctx.record_decision(event.kind(), json!({"step": step, "counted": counted}))?;
                out.push(ctx.end_of_step(step)?);
                Ok(out)
            }),
        )
        .on(
            GREETING,
            "remember",
            handler_fn(|ctx, _event: Event| async move {
                let greetings = ctx.get_or("greetings", json!(0)).await;
                ctx.set("greetings", json!(greetings.as_i64().unwrap_or(0) + 1))
                    .await;
                Ok(vec![])
            }),
        )
        .build()
}
