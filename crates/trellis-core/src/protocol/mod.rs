//! Message envelopes exchanged between actors.
//!
//! # Architecture
//!
//! ```text
//! Envelope
//!     ├── msg_id          uuid, dedupe key
//!     ├── correlation_id  ties a reply to its request
//!     ├── source_guid / callback_topic / auth_token
//!     └── kind            Ticket | UpdateTicket | Redeem | ...
//! ```
//!
//! The transport is an at-least-once ordered bus between named topics; the
//! wire codec lives outside the core. Payloads are serde-serialized and
//! keyed by `msg_id`. The kernel deduplicates within a bounded window and
//! re-processes replays idempotently keyed by reservation id.

mod dedupe;


pub use dedupe::{DedupeWindow, DEFAULT_DEDUPE_WINDOW};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LastError;
use crate::model::{
    ActorGuid, ActorRole, DelegationId, Reservation, ReservationId, SliceId, SliceOwner,
};
use crate::time::Term;

/// Slice header carried alongside reservation payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceInfo {
    /// Slice identifier.
    pub id: SliceId,
    /// Slice name.
    pub name: String,
    /// Owner of the slice.
    pub owner: SliceOwner,
    /// Request graph id, if the receiver needs it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_id: Option<String>,
}

/// Outcome of a remote operation, carried on update messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    /// `true` when the operation succeeded.
    pub ok: bool,
    /// Failure detail when `ok` is `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<LastError>,
}

impl OperationStatus {
    /// A successful outcome.
    #[must_use]
    pub const fn success() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    /// A failed outcome carrying the error.
    #[must_use]
    pub const fn failed(error: LastError) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}

/// The message kinds of the actor protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum MessageKind {
    /// Orchestrator asks a broker for resources.
    Ticket {
        /// Slice the reservations belong to.
        slice: SliceInfo,
        /// Reservations to arbitrate.
        reservations: Vec<Reservation>,
    },
    /// Broker answers a ticket or extend-ticket request.
    UpdateTicket {
        /// The annotated reservation.
        reservation: Box<Reservation>,
        /// Granted or denied.
        status: OperationStatus,
    },
    /// Orchestrator asks the owning authority to realize a ticket.
    Redeem {
        /// Slice the reservation belongs to.
        slice: SliceInfo,
        /// The ticketed reservation.
        reservation: Box<Reservation>,
    },
    /// Authority reports a lease outcome to orchestrator and broker.
    UpdateLease {
        /// The reservation with merged handler properties.
        reservation: Box<Reservation>,
        /// Provisioned, failed, or closed.
        status: OperationStatus,
    },
    /// Orchestrator asks a broker to extend a ticket.
    ExtendTicket {
        /// Reservation to extend.
        reservation_id: ReservationId,
        /// Requested new exclusive end.
        new_end_ms: i64,
    },
    /// Orchestrator asks an authority to swap in an extended lease.
    ExtendLease {
        /// Reservation to extend.
        reservation_id: ReservationId,
        /// The broker-approved extension.
        term: Term,
    },
    /// Close a reservation wherever it holds state.
    Close {
        /// Reservation to close.
        reservation_id: ReservationId,
    },
    /// Broker claims an advertised delegation from an authority.
    Claim {
        /// Delegation being claimed.
        delegation_id: DelegationId,
    },
    /// Authority takes a delegation back from a broker.
    Reclaim {
        /// Delegation being reclaimed.
        delegation_id: DelegationId,
    },
    /// Resource availability query.
    Query {
        /// Listing detail: 1 is per-node availability, 2 adds holdings.
        level: u8,
    },
    /// Reply to `Query` and `Claim`.
    QueryResponse {
        /// Listing or claimed delegation, serde-encoded.
        payload: serde_json::Value,
        /// Error detail when the query was refused.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<LastError>,
    },
    /// Liveness probe.
    Probe,
}

impl MessageKind {
    /// Returns the kind as a stable identifier for logs and metrics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ticket { .. } => "TICKET",
            Self::UpdateTicket { .. } => "UPDATE_TICKET",
            Self::Redeem { .. } => "REDEEM",
            Self::UpdateLease { .. } => "UPDATE_LEASE",
            Self::ExtendTicket { .. } => "EXTEND_TICKET",
            Self::ExtendLease { .. } => "EXTEND_LEASE",
            Self::Close { .. } => "CLOSE",
            Self::Claim { .. } => "CLAIM",
            Self::Reclaim { .. } => "RECLAIM",
            Self::Query { .. } => "QUERY",
            Self::QueryResponse { .. } => "QUERY_RESPONSE",
            Self::Probe => "PROBE",
        }
    }
}

/// Which message kinds an actor role accepts.
///
/// A kind outside the role's set is dropped with a warning; accepting it
/// would let a confused peer mutate state the role does not own.
#[must_use]
pub fn role_accepts(role: ActorRole, kind: &MessageKind) -> bool {
    use MessageKind as K;
    match role {
        ActorRole::Orchestrator => matches!(
            kind,
            K::UpdateTicket { .. } | K::UpdateLease { .. } | K::QueryResponse { .. } | K::Probe
        ),
        ActorRole::Broker => matches!(
            kind,
            K::Ticket { .. }
                | K::ExtendTicket { .. }
                | K::Close { .. }
                | K::UpdateLease { .. }
                | K::Reclaim { .. }
                | K::Query { .. }
                | K::QueryResponse { .. }
                | K::Probe
        ),
        ActorRole::Authority => matches!(
            kind,
            K::Redeem { .. }
                | K::ExtendLease { .. }
                | K::Close { .. }
                | K::Claim { .. }
                | K::Query { .. }
                | K::QueryResponse { .. }
                | K::Probe
        ),
    }
}

/// A routed protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message id; the dedupe and wire key.
    pub msg_id: Uuid,
    /// Request this message replies to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// Sending actor.
    pub source_guid: ActorGuid,
    /// Topic replies should be produced to.
    pub callback_topic: String,
    /// Bearer token checked by the decision point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// The operation.
    pub kind: MessageKind,
}

impl Envelope {
    /// Creates a request envelope with a fresh message id.
    #[must_use]
    pub fn request(source_guid: ActorGuid, callback_topic: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            msg_id: Uuid::new_v4(),
            correlation_id: None,
            source_guid,
            callback_topic: callback_topic.into(),
            auth_token: None,
            kind,
        }
    }

    /// Creates a reply correlated to `request`.
    #[must_use]
    pub fn reply_to(request: &Envelope, source_guid: ActorGuid, callback_topic: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            msg_id: Uuid::new_v4(),
            correlation_id: Some(request.msg_id),
            source_guid,
            callback_topic: callback_topic.into(),
            auth_token: None,
            kind,
        }
    }

    /// Attaches a bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Serializes the envelope for the wire.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if a payload cannot be encoded.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserializes an envelope from the wire.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed payloads.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
