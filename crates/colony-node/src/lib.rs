//! # Colony Node
//!
//! The distributed layer of Colony. A [`MasterNode`] owns the simulation
//! environment, the worker registry, the agent-location directory and the
//! lock table; [`WorkerNode`]s host agents. They talk HTTP/JSON: axum on the
//! serving side, reqwest behind a per-peer [`CircuitBreaker`] on the calling
//! side.
//!
//! ```no_run
//! use colony_env::SimulationConfig;
//! use colony_node::{MasterConfig, MasterNode};
//! use std::time::Duration;
//!
//! # async fn example() -> colony_node::NodeResult<()> {
//! let master = MasterNode::builder(MasterConfig::default(), SimulationConfig::default()).build()?;
//! let listener = master.bind().await?;
//! let server = master.spawn(listener);
//!
//! master.wait_for_workers(2, Duration::from_secs(30)).await?;
//! let report = master.run_simulation().await?;
//! println!("finished after {} steps", report.steps_completed);
//!
//! master.shutdown("done").await;
//! let _ = server.await;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod breaker;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod locks;
pub mod master;
pub mod probe;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod shutdown;
pub mod worker;

pub use allocator::{AgentAllocator, AllocationPolicy, AllocationReport, plan_assignments};
pub use breaker::{CircuitBreaker, CircuitState};
pub use client::{Delivery, PeerClient};
pub use config::{
    CircuitBreakerConfig, DEFAULT_MASTER_PORT, DEFAULT_REQUEST_TIMEOUT, MasterConfig,
    RetryPolicy, WorkerConfig,
};
pub use directory::AgentDirectory;
pub use error::{ErrorResponse, NodeError, NodeResult};
pub use locks::RemoteLockAuthority;
pub use master::{MasterBuilder, MasterNode};
pub use probe::{ClusterBroadcaster, ClusterProbe};
pub use registry::{WorkerInfo, WorkerRegistry};
pub use relay::{MasterRelay, WorkerRelay};
pub use shutdown::{cancel_on_signal, shutdown_signal};
pub use worker::WorkerNode;
