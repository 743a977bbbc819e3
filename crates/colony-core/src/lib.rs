//! # Colony Core
//!
//! Shared vocabulary of the Colony simulation runtime: identifiers and
//! routing addresses, the immutable [`Event`] record and its wire
//! [`EventEnvelope`], the bodies of built-in control and data events, agent
//! profiles, and the [`PendingRequests`] correlation table used by the
//! request/response protocol layered on the event bus.
//!
//! ```
//! use colony_core::{Address, AgentId, Event, EventEnvelope};
//!
//! let from = Address::Agent(AgentId::parse("buyer-1").unwrap());
//! let event = Event::new("Bid", from, Address::Env).with_field("price", 10);
//! let wire = EventEnvelope::from(&event);
//! assert_eq!(wire.to_agent_id, "ENV");
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod event;
pub mod ids;
pub mod pending;
pub mod profile;

pub use config::ConfigError;
pub use data::{
    AgentConfig, DataRequest, DataResponse, DataUpdate, DataUpdateResponse, DecisionRecord,
    EndReport, StartSignal, TerminationNotice,
};
pub use error::{CoreError, CoreResult};
pub use event::{Event, EventEnvelope, EventId, EventKind, Payload};
pub use ids::{Address, AgentId, IdValidationError, WorkerId};
pub use pending::{DEFAULT_REQUEST_TTL, PendingRequests};
pub use profile::Profile;
