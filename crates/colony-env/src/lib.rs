//! # Colony Environment
//!
//! The authoritative simulation environment. It owns the simulation state
//! machine, drives progression in round mode (broadcast `StartEvent`, wait
//! for every tracked agent's `EndEvent` or an idle timeout) or timed mode
//! (scheduler-driven steps until exhausted and idle), serves environment
//! data to agents, and persists a trail at every step boundary through a
//! buffer-then-flush writer.

pub mod buffer;
pub mod config;
pub mod environment;
pub mod error;
pub mod probe;
pub mod state;
pub mod trail;

pub use buffer::{PersistenceBuffer, TrailEntry};
pub use config::{SimulationConfig, SimulationMode};
pub use environment::{EnvironmentBuilder, SimulationEnvironment, SimulationReport};
pub use error::{EnvError, EnvResult};
pub use probe::{ActivityProbe, ActivitySnapshot, BusProbe, ControlBroadcaster};
pub use state::SimulationState;
pub use trail::{InMemoryTrailStore, JsonlTrailStore, TrailRecord, TrailStore};
