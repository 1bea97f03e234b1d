//! Entities arbitrated by the kernel: slices, reservations, delegations.
//!
//! # Architecture
//!
//! ```text
//! Slice (owner, name, lease window)
//!   └── Reservation (one sliver each)
//!         ├── requested / approved Capacities + components
//!         ├── ReservationState x PendingState
//!         ├── NodeMap into a substrate graph
//!         └── predecessor edges (by id, no lifetime bond)
//! Delegation (authority -> broker capacity grants, per graph node)
//! Peer (static catalog of remote actors)
//! ```
//!
//! Cross-references between entities are ids resolved in the kernel arena,
//! never direct pointers. Entity ids are opaque strings minted from v4
//! uuids; string form keeps them stable across the wire and the store.

mod capacity;
mod delegation;
mod peer;
mod reservation;
mod slice;
mod states;


pub use capacity::{AttachedComponent, Capacities, ComponentSpec};
pub use delegation::{Delegation, NodeDelegation};
pub use peer::{ActorRole, Peer};
pub use reservation::{
    InterfaceSliver, NodeMap, Predecessor, Reservation, ResourceType, SliceOwner,
};
pub use slice::Slice;
pub use states::{DelegationState, PendingState, ReservationState, SliceState, valid_transition};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mints a fresh random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Wraps an existing identifier.
            #[must_use]
            pub fn from_string(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Identifier of a reservation, the unit of arbitration.
    ReservationId
);
id_type!(
    /// Identifier of a slice, the user-level container of reservations.
    SliceId
);
id_type!(
    /// Identifier of a delegation from an authority to a broker.
    DelegationId
);
id_type!(
    /// Globally unique identifier of an actor.
    ActorGuid
);
