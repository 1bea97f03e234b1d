//! Events, commands, and per-tick reports of the kernel.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::graph::RequestGraph;
use crate::model::{ActorGuid, DelegationId, Reservation, ReservationId, SliceId, SliceOwner};
use crate::protocol::Envelope;

/// A command submitted by the local embedder (e.g. a REST controller).
#[derive(Debug, Clone)]
pub enum LocalCommand {
    /// Build a slice of reservations from a request graph and demand it.
    CreateSlice {
        /// User-chosen slice name.
        name: String,
        /// Requesting user and project.
        owner: SliceOwner,
        /// The request graph.
        graph: RequestGraph,
        /// Requested exclusive lease end; defaults to 24 hours out.
        end_ms: Option<i64>,
    },
    /// Close a slice and every reservation in it.
    CloseSlice {
        /// Slice to close.
        slice_id: SliceId,
    },
    /// Extend every active reservation of a slice to a later end.
    ExtendSlice {
        /// Slice to extend.
        slice_id: SliceId,
        /// Requested exclusive lease end.
        new_end_ms: i64,
    },
    /// Broker: claim an advertised delegation from an authority.
    ClaimDelegation {
        /// Delegation to claim.
        delegation_id: DelegationId,
        /// Authority holding the delegation.
        authority: ActorGuid,
    },
    /// Authority: take a delegation back from a broker.
    ReclaimDelegation {
        /// Delegation to reclaim.
        delegation_id: DelegationId,
    },
}

/// What a provisioning-pool invocation should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionKind {
    /// Realize the sliver.
    Provision,
    /// Tear the sliver down.
    Teardown,
    /// Recovery probe: ask the handler whether the sliver is gone.
    Probe,
}

/// A handler invocation the daemon's pool should run.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    /// Snapshot of the reservation at dispatch time.
    pub reservation: Reservation,
    /// Operation to perform.
    pub kind: ProvisionKind,
}

/// An event enqueued into the kernel from the outside.
#[derive(Debug)]
pub enum KernelEvent {
    /// A message delivered by the bus consumer.
    Message(Envelope),
    /// A handler invocation finished on the provisioning pool.
    HandlerCompleted {
        /// Reservation the invocation belonged to.
        reservation: ReservationId,
        /// Operation that finished.
        kind: ProvisionKind,
        /// `true` on success; for probes, `true` means the sliver is
        /// still present on the substrate.
        ok: bool,
        /// Handler message, surfaced on failure.
        message: String,
        /// Properties to merge into the reservation.
        properties: BTreeMap<String, String>,
    },
    /// The timer service fired a deadline for an in-flight request.
    TimeoutExpired {
        /// The request's message id.
        correlation: Uuid,
    },
    /// A local embedder command.
    Command(LocalCommand),
}

/// An outbound message with its destination topic.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Topic to produce to.
    pub topic: String,
    /// The message.
    pub envelope: Envelope,
}

/// What one kernel tick did; the daemon acts on the queues it carries.
#[derive(Debug, Default)]
pub struct TickReport {
    /// The tick's cycle.
    pub cycle: u64,
    /// Events drained from the queue.
    pub drained: usize,
    /// Entities persisted by the batch commit.
    pub persisted: usize,
    /// Messages to produce.
    pub outbound: Vec<Outbound>,
    /// Handler invocations to run on the provisioning pool.
    pub provision: Vec<ProvisionRequest>,
}

/// An in-flight remote request awaiting its reply.
#[derive(Debug, Clone)]
pub(crate) struct PendingRpc {
    /// Reservation the request belongs to, if any.
    pub reservation: Option<ReservationId>,
    /// The original request, re-sent on retry with a fresh message id.
    pub envelope: Envelope,
    /// Destination topic.
    pub topic: String,
    /// Cycle at which the request times out.
    pub deadline: u64,
    /// Attempts consumed so far.
    pub attempt: u32,
}
