//! # Colony
//!
//! Colony runs multi-agent simulations across a cluster of processes. One
//! master owns the simulation environment and the shared lock table; workers
//! host agents. Agents never call each other: they exchange events through
//! an event bus that relays between processes over HTTP/JSON.
//!
//! ## Crates
//!
//! - [`model`]: identifiers, events, profiles, request correlation
//! - [`mesh`]: event bus, agent runtimes, scheduler, data access, locks
//! - [`env`]: the simulation state machine and its trail store
//! - [`node`]: master and worker nodes, allocation, remote relay
//! - [`observability`]: tracing setup and Prometheus metrics
//!
//! ## Quick Start
//!
//! ```no_run
//! use colony::env::SimulationConfig;
//! use colony::node::{MasterConfig, MasterNode};
//! use std::time::Duration;
//!
//! # async fn run() -> colony::node::NodeResult<()> {
//! let master = MasterNode::builder(MasterConfig::default(), SimulationConfig::default())
//!     .build()?;
//! let server = master.spawn(master.bind().await?);
//! master.wait_for_workers(1, Duration::from_secs(30)).await?;
//! let report = master.run_simulation().await?;
//! println!("{}", report.final_state);
//! master.shutdown("done").await;
//! let _ = server.await;
//! # Ok(())
//! # }
//! ```

pub use colony_core as model;
pub use colony_env as env;
pub use colony_mesh as mesh;
pub use colony_node as node;
pub use colony_observability as observability;

pub use colony_core::{Address, AgentConfig, AgentId, Event, EventKind, Profile, WorkerId};
pub use colony_env::{SimulationConfig, SimulationMode, SimulationReport, SimulationState};
pub use colony_mesh::{AgentContext, AgentTypeRegistry, HandlerTable, handler_fn};
pub use colony_node::{MasterConfig, MasterNode, WorkerConfig, WorkerNode};
