//! # Colony Mesh
//!
//! Everything that runs inside one Colony process: the [`EventBus`] that
//! routes events between local agents, the environment and remote peers;
//! per-agent runtimes driven by a [`HandlerTable`]; the [`Scheduler`] that
//! emits periodic steps; the [`DataAccess`] request/response protocol; and
//! the [`LockAuthority`] abstraction serializing writes to shared data.
//!
//! ## Example
//!
//! ```no_run
//! use colony_core::{Address, AgentId, Event};
//! use colony_mesh::{
//!     AgentDefinition, AgentHost, AgentTypeRegistry, BusConfig, EventBus, HandlerTable,
//!     LocalLockAuthority, RuntimeConfig, handler_fn,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> colony_mesh::MeshResult<()> {
//! let bus = EventBus::new(BusConfig::default());
//! let host = AgentHost::new(
//!     bus.clone(),
//!     Arc::new(LocalLockAuthority::new()),
//!     Arc::new(AgentTypeRegistry::new()),
//!     RuntimeConfig::default(),
//! );
//!
//! let handlers = HandlerTable::builder()
//!     .on("Ping", "pong", handler_fn(|ctx, event: Event| async move {
//!         Ok(vec![ctx.event("Pong", event.from().clone())])
//!     }))
//!     .build()?;
//! let id = AgentId::parse("echo-1").map_err(|e| colony_core::CoreError::invalid_id("echo-1", e))?;
//! host.spawn(AgentDefinition::new(id.clone(), "echo", handlers))?;
//!
//! bus.dispatch(Event::new("Ping", Address::Env, Address::Agent(id)))?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod data;
pub mod error;
pub mod flow;
pub mod handler;
pub mod host;
pub mod lock;
pub mod runtime;
pub mod scheduler;

pub use bus::{ActivityGuard, BusConfig, BusStats, EventBus, EventRelay, EventTap, Inbox, Origin};
pub use data::{DataAccess, DataAccessConfig, answer_data_event, lock_key};
pub use error::{MeshError, MeshResult};
pub use flow::{EventFlow, FlowEdge, FlowNode};
pub use handler::{
    EventHandler, FnHandler, HandlerError, HandlerResult, HandlerTable, HandlerTableBuilder,
    NamedHandler, handler_fn,
};
pub use host::{AgentFactory, AgentHost, AgentTypeRegistry};
pub use lock::{
    DEFAULT_LEASE, DEFAULT_LOCK_WAIT, LocalLockAuthority, LockAuthority, LockLease, LockRequest,
    with_lock,
};
pub use runtime::{
    AgentContext, AgentDefinition, AgentHandle, AgentStatus, RuntimeConfig, spawn_agent,
};
pub use scheduler::{ScheduleSpec, Scheduler, StepFired};
