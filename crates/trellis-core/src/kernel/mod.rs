//! The single-tick actor kernel.
//!
//! # Architecture
//!
//! ```text
//!  bus consumer ──▶ queue ──▶ Kernel::tick(cycle)
//!  timer thread ──▶ queue        │ 1. drain queue (batch cap)
//!  pool workers ──▶ queue        │ 2. calendar-due processing
//!  embedder     ──▶ queue        │ 3. per-slice progression
//!                                │ 4. policy tick + slice recompute
//!                                │ 5. rpc deadline scan
//!                                │ 6. persist dirty batch
//!                                ▼
//!                     TickReport { outbound, provision }
//! ```
//!
//! One thread owns all reservation, slice, calendar, and delegation
//! state; everything else interacts through the queue. The kernel never
//! suspends: every remote operation is a pending sub-state plus a
//! deadline, and replies re-enter as events correlated by message id.
//!
//! # Invariants
//!
//! - Within one tick, reservations of a slice are processed in insertion
//!   order and slices in slice-id order, so two replicas ticking the same
//!   persisted state produce identical transitions.
//! - Holdings added in tick N are visible to allocation queries in tick
//!   N+1; within a tick, later reservations see earlier ones' holdings
//!   through the shared calendar.
//! - An internal error quarantines one reservation; the actor keeps
//!   ticking every other slice.

mod dispatch;
mod events;
mod progress;
mod recovery;

#[cfg(test)]
mod tests;

pub use events::{
    KernelEvent, LocalCommand, Outbound, ProvisionKind, ProvisionRequest, TickReport,
};
pub use recovery::RecoveryReport;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use uuid::Uuid;

use crate::authz::DecisionPoint;
use crate::calendar::ActorCalendar;
use crate::config::{ActorConfig, KernelSettings};
use crate::error::{CoreError, Result};
use crate::graph::SubstrateGraph;
use crate::model::{
    ActorGuid, ActorRole, Delegation, DelegationId, Peer, Reservation, ReservationId, Slice,
    SliceId,
};
use crate::policy::{Policy, PolicyContext, PolicySettings};
use crate::protocol::{DedupeWindow, Envelope};
use crate::store::SqliteStore;
use crate::time::ActorClock;

use events::PendingRpc;

/// Property key under which an authority remembers the orchestrator
/// topic that redeemed a reservation; survives restarts with the
/// properties bag.
pub(crate) const PROP_CALLBACK_TOPIC: &str = "callback_topic";

/// Property keys for a renewal that arrived while the member was still
/// mid-operation: the requested end and the cycle the deferral expires.
pub(crate) const PROP_EXTEND_END: &str = "deferred_extend_end_ms";
pub(crate) const PROP_EXTEND_DEADLINE: &str = "deferred_extend_deadline";

/// All entities owned by one actor, looked up by id.
///
/// Cross-references between entities are ids resolved here, never
/// pointers; the maps are ordered so iteration is deterministic.
#[derive(Debug, Default)]
pub struct ActorState {
    /// Slices by id.
    pub slices: BTreeMap<SliceId, Slice>,
    /// Reservations by id.
    pub reservations: BTreeMap<ReservationId, Reservation>,
    /// Delegations by id.
    pub delegations: BTreeMap<DelegationId, Delegation>,
    /// Slices to persist at the next flush.
    pub dirty_slices: BTreeSet<SliceId>,
    /// Reservations to persist at the next flush.
    pub dirty_reservations: BTreeSet<ReservationId>,
}

impl ActorState {
    /// Inserts a reservation, appending it to its slice in insertion
    /// order, and marks both dirty.
    pub fn insert_reservation(&mut self, mut reservation: Reservation) {
        if let Some(slice) = self.slices.get_mut(&reservation.slice_id) {
            reservation.sequence = slice.reservations.len() as u64;
            slice.add_reservation(reservation.id.clone());
            self.dirty_slices.insert(slice.id.clone());
        }
        self.dirty_reservations.insert(reservation.id.clone());
        self.reservations.insert(reservation.id.clone(), reservation);
    }

    /// Marks a reservation for the next persistence batch.
    pub fn mark_dirty(&mut self, id: &ReservationId) {
        self.dirty_reservations.insert(id.clone());
    }
}

/// Identity and tunables the kernel is built with.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Role of this actor.
    pub role: ActorRole,
    /// This actor's guid.
    pub guid: ActorGuid,
    /// Topic this actor consumes from; peers reply here.
    pub topic: String,
    /// The logical clock.
    pub clock: ActorClock,
    /// Policy tunables.
    pub policy_settings: PolicySettings,
    /// Kernel tunables.
    pub kernel_settings: KernelSettings,
    /// Remote attempts per request.
    pub rpc_retries: u32,
    /// Request deadline in cycles.
    pub rpc_timeout_cycles: u64,
    /// Entities per store transaction.
    pub commit_batch_size: usize,
    /// Static peer catalog.
    pub peers: Vec<Peer>,
}

impl KernelConfig {
    /// Derives the kernel configuration from a parsed actor config.
    #[must_use]
    pub fn from_actor_config(config: &ActorConfig, clock: ActorClock) -> Self {
        let timeout_ms = config.transport.rpc_request_timeout_seconds.saturating_mul(1000);
        let rpc_timeout_cycles =
            (timeout_ms / u64::try_from(clock.cycle_millis()).unwrap_or(1000)).max(1);
        Self {
            role: config.actor.role,
            guid: config.actor.guid.clone(),
            topic: config.actor.topic.clone(),
            clock,
            policy_settings: config.policy.clone(),
            kernel_settings: config.kernel.clone(),
            rpc_retries: config.transport.rpc_retries,
            rpc_timeout_cycles,
            commit_batch_size: config.transport.commit_batch_size,
            peers: config.peers.clone(),
        }
    }
}

/// The deterministic tick kernel shared by all three actor roles.
pub struct Kernel {
    pub(crate) role: ActorRole,
    pub(crate) guid: ActorGuid,
    pub(crate) topic: String,
    pub(crate) clock: ActorClock,
    pub(crate) cycle: u64,
    pub(crate) policy: Box<dyn Policy>,
    pub(crate) authz: Box<dyn DecisionPoint>,
    pub(crate) graph: SubstrateGraph,
    pub(crate) state: ActorState,
    pub(crate) calendar: ActorCalendar,
    pub(crate) store: SqliteStore,
    pub(crate) peers: Vec<Peer>,
    pub(crate) dedupe: DedupeWindow,
    pub(crate) pending_rpcs: BTreeMap<Uuid, PendingRpc>,
    pub(crate) queue: VecDeque<KernelEvent>,
    pub(crate) outbound: Vec<Outbound>,
    pub(crate) provision: Vec<ProvisionRequest>,
    pub(crate) maintenance_sites: BTreeSet<String>,
    pub(crate) policy_settings: PolicySettings,
    pub(crate) kernel_settings: KernelSettings,
    pub(crate) rpc_retries: u32,
    pub(crate) rpc_timeout_cycles: u64,
    pub(crate) commit_batch_size: usize,
}

impl Kernel {
    /// Assembles a kernel.
    ///
    /// The graph is the CBM at a broker, the site ARM at an authority,
    /// and empty at an orchestrator.
    #[must_use]
    pub fn new(
        config: KernelConfig,
        policy: Box<dyn Policy>,
        authz: Box<dyn DecisionPoint>,
        store: SqliteStore,
        graph: SubstrateGraph,
    ) -> Self {
        let dedupe = DedupeWindow::new(config.kernel_settings.dedupe_window);
        Self {
            role: config.role,
            guid: config.guid,
            topic: config.topic,
            clock: config.clock,
            cycle: 0,
            policy,
            authz,
            graph,
            state: ActorState::default(),
            calendar: ActorCalendar::new(),
            store,
            peers: config.peers,
            dedupe,
            pending_rpcs: BTreeMap::new(),
            queue: VecDeque::new(),
            outbound: Vec::new(),
            provision: Vec::new(),
            maintenance_sites: BTreeSet::new(),
            policy_settings: config.policy_settings,
            kernel_settings: config.kernel_settings,
            rpc_retries: config.rpc_retries,
            rpc_timeout_cycles: config.rpc_timeout_cycles,
            commit_batch_size: config.commit_batch_size,
        }
    }

    /// This actor's role.
    #[must_use]
    pub fn role(&self) -> ActorRole {
        self.role
    }

    /// This actor's guid.
    #[must_use]
    pub fn guid(&self) -> &ActorGuid {
        &self.guid
    }

    /// The current cycle.
    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Read access to the arena, for embedders and tests.
    #[must_use]
    pub fn state(&self) -> &ActorState {
        &self.state
    }

    /// Read access to the calendar.
    #[must_use]
    pub fn calendar(&self) -> &ActorCalendar {
        &self.calendar
    }

    /// The store handle, for snapshot reads off the kernel thread.
    #[must_use]
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Marks a site as under or out of maintenance.
    pub fn set_site_maintenance(&mut self, site: &str, maintenance: bool) {
        if maintenance {
            self.maintenance_sites.insert(site.to_string());
        } else {
            self.maintenance_sites.remove(site);
        }
    }

    /// Registers a delegation this actor knows about.
    ///
    /// Authorities advertise their outgoing delegations at boot; brokers
    /// insert claimed delegations when the claim reply arrives.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] if the delegation cannot be persisted.
    pub fn register_delegation(&mut self, delegation: Delegation) -> Result<()> {
        self.store.upsert_delegation(&delegation)?;
        self.state
            .delegations
            .insert(delegation.id.clone(), delegation);
        Ok(())
    }

    /// Enqueues an event for the next tick.
    pub fn submit(&mut self, event: KernelEvent) {
        self.queue.push_back(event);
    }

    /// Returns `true` while the request with this message id awaits its
    /// reply; the timer service only schedules deadlines for these.
    #[must_use]
    pub fn has_pending_rpc(&self, msg_id: &Uuid) -> bool {
        self.pending_rpcs.contains_key(msg_id)
    }

    /// Counts of non-terminal entities, for the metrics exporter.
    #[must_use]
    pub fn gauge_counts(&self) -> (BTreeMap<&'static str, u64>, BTreeMap<&'static str, u64>, u64) {
        let mut reservations: BTreeMap<&'static str, u64> = BTreeMap::new();
        for r in self.state.reservations.values() {
            *reservations.entry(r.state.as_str()).or_default() += 1;
        }
        let mut slices: BTreeMap<&'static str, u64> = BTreeMap::new();
        for s in self.state.slices.values() {
            *slices.entry(s.state.as_str()).or_default() += 1;
        }
        let holdings = self.calendar.holdings().len() as u64;
        (reservations, slices, holdings)
    }

    /// Runs one tick at the given cycle.
    ///
    /// # Errors
    ///
    /// Returns an error only when the store rejects the final batch
    /// commit; everything else is absorbed into per-reservation failures.
    pub fn tick(&mut self, cycle: u64) -> Result<TickReport> {
        self.cycle = cycle;
        let drained = self.drain_queue();
        self.process_due(cycle);
        self.progress_slices(cycle);
        self.policy.tick(cycle);
        self.recompute_slices(cycle);
        self.collect_garbage(cycle)?;
        self.check_rpc_deadlines(cycle);
        let persisted = self.flush_dirty()?;
        Ok(TickReport {
            cycle,
            drained,
            persisted,
            outbound: std::mem::take(&mut self.outbound),
            provision: std::mem::take(&mut self.provision),
        })
    }

    // =========================================================================
    // Internal plumbing shared by dispatch and progress
    // =========================================================================

    /// Splits the kernel into its policy and a policy context.
    ///
    /// The caller removes the reservation under decision from the arena
    /// first, so the context can borrow the rest of the arena immutably
    /// while the policy is borrowed mutably alongside it.
    pub(crate) fn split_policy(&mut self) -> (&mut dyn Policy, PolicyContext<'_>) {
        (
            self.policy.as_mut(),
            PolicyContext {
                cycle: self.cycle,
                clock: &self.clock,
                calendar: &mut self.calendar,
                graph: &self.graph,
                delegations: &self.state.delegations,
                reservations: &self.state.reservations,
                maintenance_sites: &self.maintenance_sites,
                settings: &self.policy_settings,
            },
        )
    }

    /// Queues a fire-and-forget message.
    pub(crate) fn send(&mut self, topic: impl Into<String>, envelope: Envelope) {
        self.outbound.push(Outbound {
            topic: topic.into(),
            envelope,
        });
    }

    /// Queues a request and registers its reply deadline.
    pub(crate) fn send_rpc(
        &mut self,
        topic: impl Into<String>,
        envelope: Envelope,
        reservation: Option<ReservationId>,
    ) {
        let topic = topic.into();
        self.pending_rpcs.insert(
            envelope.msg_id,
            PendingRpc {
                reservation,
                envelope: envelope.clone(),
                topic: topic.clone(),
                deadline: self.cycle + self.rpc_timeout_cycles,
                attempt: 1,
            },
        );
        self.send(topic, envelope);
    }

    /// The broker peer an orchestrator tickets against.
    pub(crate) fn broker_peer(&self) -> Option<&Peer> {
        self.peers.iter().find(|p| p.role == ActorRole::Broker)
    }

    /// The authority peer owning a site.
    pub(crate) fn authority_for_site(&self, site: &str) -> Option<&Peer> {
        self.peers
            .iter()
            .filter(|p| p.role == ActorRole::Authority)
            .find(|p| p.site.as_deref() == Some(site))
            .or_else(|| self.peers.iter().find(|p| p.role == ActorRole::Authority))
    }

    /// Looks up a reservation or reports it missing.
    pub(crate) fn take_reservation(&mut self, id: &ReservationId) -> Result<Reservation> {
        self.state
            .reservations
            .remove(id)
            .ok_or_else(|| CoreError::NotFound {
                entity: "reservation",
                id: id.to_string(),
            })
    }

    /// Returns a removed reservation to the arena and marks it dirty.
    pub(crate) fn put_back(&mut self, reservation: Reservation) {
        self.state.dirty_reservations.insert(reservation.id.clone());
        self.state
            .reservations
            .insert(reservation.id.clone(), reservation);
    }
}
