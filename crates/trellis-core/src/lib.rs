//! # trellis-core
//!
//! Core library for Trellis, a distributed control framework that
//! arbitrates time-bounded reservations of testbed infrastructure across
//! administrative sites.
//!
//! Three actor roles share the one kernel in this crate: the
//! orchestrator embeds user requests, the broker arbitrates tickets
//! against a calendar of delegated capacity, and the authority binds
//! redeemed tickets and provisions substrate. The crate is deterministic
//! by construction: all time is logical cycles under an [`time::ActorClock`],
//! all state transitions go through one table, and replaying the
//! persisted store reproduces the live state.
//!
//! ## Layout
//!
//! - [`model`]: slices, reservations, delegations, peers, state enums
//! - [`time`]: the actor clock and lease terms
//! - [`calendar`]: time- and slice-indexed reservation views
//! - [`graph`]: substrate (ARM/CBM) and request (ASM) graph shapes
//! - [`policy`]: first-fit broker, authority calendar, ticket review
//! - [`protocol`]: message envelopes and the role legality table
//! - [`store`]: the SQLite-backed reservation store
//! - [`kernel`]: the single-tick kernel shared by every role
//! - [`orchestrator`]: the request-graph to reservations walk
//! - [`handler`]: provisioning handler trait and registry
//! - [`authz`]: black-box decision point wrapper
//!
//! ## Example
//!
//! ```rust,no_run
//! use trellis_core::config::ActorConfig;
//! use trellis_core::kernel::{Kernel, KernelConfig};
//! use trellis_core::policy::BrokerFirstFitPolicy;
//! use trellis_core::authz::AllowAll;
//! use trellis_core::store::SqliteStore;
//! use trellis_core::graph::SubstrateGraph;
//! use trellis_core::time::ActorClock;
//!
//! # fn main() -> Result<(), trellis_core::error::CoreError> {
//! let config = ActorConfig::load("broker.toml")?;
//! let clock = ActorClock::from_settings(&config.time)?;
//! let store = SqliteStore::open(&config.database.path)?;
//! let mut kernel = Kernel::new(
//!     KernelConfig::from_actor_config(&config, clock),
//!     Box::new(BrokerFirstFitPolicy::new()),
//!     Box::new(AllowAll),
//!     store,
//!     SubstrateGraph::new("cbm"),
//! );
//! kernel.recover()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod authz;
pub mod calendar;
pub mod config;
pub mod error;
pub mod graph;
pub mod handler;
pub mod kernel;
pub mod model;
pub mod orchestrator;
pub mod policy;
pub mod protocol;
pub mod store;
pub mod time;

/// Prelude for embedders.
pub mod prelude {
    pub use crate::authz::AllowAll;
    pub use crate::config::ActorConfig;
    pub use crate::error::{CoreError, ErrorKind};
    pub use crate::kernel::{Kernel, KernelConfig, KernelEvent, LocalCommand, TickReport};
    pub use crate::model::{ActorRole, Reservation, ReservationState, Slice, SliceState};
    pub use crate::store::SqliteStore;
    pub use crate::time::{ActorClock, Term};
}
