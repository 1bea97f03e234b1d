//! Allocation policies consulted by the kernel.
//!
//! # Architecture
//!
//! ```text
//! Kernel ── allocate_ticket / bind_redeem / extend / close / tick ──▶ Policy
//!                                                                      │
//!                      PolicyContext: calendar, graph, delegations,────┘
//!                      sibling reservations, site state, settings
//! ```
//!
//! Each role loads one policy module: brokers the first-fit units policy,
//! authorities the calendar policy, orchestrators the ticket-review
//! policy. Policies annotate the reservation in place and report the
//! outcome; the kernel owns all state transitions and message emission.
//!
//! Availability is always computed the same way on both sides of the
//! ticket: the capacity delegated for a node (scaled by the
//! oversubscription factor), minus the capacities of non-terminal
//! reservations whose holdings overlap the requested window.

mod authority;
mod broker;
mod orchestrator;


pub use authority::AuthorityCalendarPolicy;
pub use broker::BrokerFirstFitPolicy;
pub use orchestrator::OrchestratorReviewPolicy;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::calendar::ActorCalendar;
use crate::error::{LastError, Result};
use crate::graph::SubstrateGraph;
use crate::model::{Capacities, Delegation, DelegationId, Reservation, ReservationId};
use crate::time::ActorClock;

/// Tunables every policy receives from the actor config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PolicySettings {
    /// Sites whose first-fit candidate order is shuffled per tick.
    pub random_sites: Vec<String>,
    /// Multiplier applied to delegated capacity before fit checks.
    /// Clamped to at least 1.0.
    pub oversubscription_factor: f64,
    /// Longest lease a policy will approve, in milliseconds.
    pub max_lease_ms: i64,
    /// How many cycles before lease end a renewal may be issued.
    pub renewal_lookahead_cycles: u64,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            random_sites: Vec::new(),
            oversubscription_factor: 1.0,
            // 14 days.
            max_lease_ms: 14 * 24 * 3_600_000,
            renewal_lookahead_cycles: 120,
        }
    }
}

/// Everything a policy may consult while deciding one reservation.
///
/// The reservation under decision is borrowed separately by the caller;
/// `reservations` holds every other reservation in the arena.
pub struct PolicyContext<'a> {
    /// Current kernel cycle.
    pub cycle: u64,
    /// The actor clock, for term-to-cycle projection.
    pub clock: &'a ActorClock,
    /// The actor calendar; policies add and drop holdings.
    pub calendar: &'a mut ActorCalendar,
    /// The substrate graph: CBM at a broker, ARM at an authority.
    pub graph: &'a SubstrateGraph,
    /// Delegations known to this actor.
    pub delegations: &'a BTreeMap<DelegationId, Delegation>,
    /// Every other reservation in the arena, keyed by id.
    pub reservations: &'a BTreeMap<ReservationId, Reservation>,
    /// Sites currently closed to new allocations.
    pub maintenance_sites: &'a BTreeSet<String>,
    /// Policy tunables.
    pub settings: &'a PolicySettings,
}

impl PolicyContext<'_> {
    /// Total capacity delegated for a node across `Delegated`
    /// delegations, scaled by the oversubscription factor. `None` when no
    /// delegation covers the node.
    #[must_use]
    pub fn delegated_capacity(&self, node_id: &str) -> Option<Capacities> {
        let mut total: Option<Capacities> = None;
        for delegation in self.delegations.values() {
            if let Some(grant) = delegation.delegated_for(node_id) {
                let base = total.unwrap_or_default();
                total = Some(base.plus(&grant.capacities));
            }
        }
        total.map(|caps| caps.scaled(self.settings.oversubscription_factor))
    }

    /// Capacities committed on a node over `[start, end)`, excluding the
    /// reservation under decision and anything terminal.
    #[must_use]
    pub fn committed_on(
        &self,
        node_id: &str,
        start_ms: i64,
        end_ms: i64,
        exclude: &ReservationId,
    ) -> Capacities {
        let mut committed = Capacities::default();
        for holder in self
            .calendar
            .holdings()
            .overlapping(node_id, start_ms, end_ms)
        {
            if &holder == exclude {
                continue;
            }
            if let Some(other) = self.reservations.get(&holder) {
                if !other.is_terminal() {
                    committed = committed.plus(&other.effective_capacities());
                }
            }
        }
        committed
    }

    /// Capacity still available on a node over `[start, end)`.
    ///
    /// `None` when no delegation covers the node at all, which callers
    /// must treat the same as zero availability.
    #[must_use]
    pub fn available_on(
        &self,
        node_id: &str,
        start_ms: i64,
        end_ms: i64,
        exclude: &ReservationId,
    ) -> Option<Capacities> {
        let delegated = self.delegated_capacity(node_id)?;
        Some(delegated.minus_saturating(&self.committed_on(node_id, start_ms, end_ms, exclude)))
    }

    /// BDFs attached to non-terminal reservations holding on the node
    /// over `[start, end)`, the busy set for component matching.
    #[must_use]
    pub fn busy_components(
        &self,
        node_id: &str,
        start_ms: i64,
        end_ms: i64,
        exclude: &ReservationId,
    ) -> BTreeSet<String> {
        let mut busy = BTreeSet::new();
        for holder in self
            .calendar
            .holdings()
            .overlapping(node_id, start_ms, end_ms)
        {
            if &holder == exclude {
                continue;
            }
            if let Some(other) = self.reservations.get(&holder) {
                if !other.is_terminal() {
                    for component in &other.assigned {
                        if !component.shared {
                            busy.insert(component.bdf.clone());
                        }
                    }
                }
            }
        }
        busy
    }

    /// VLAN tags in use on a shared component over `[start, end)`.
    #[must_use]
    pub fn busy_vlans(
        &self,
        node_id: &str,
        bdf: &str,
        start_ms: i64,
        end_ms: i64,
        exclude: &ReservationId,
    ) -> BTreeSet<u16> {
        let mut busy = BTreeSet::new();
        for holder in self
            .calendar
            .holdings()
            .overlapping(node_id, start_ms, end_ms)
        {
            if &holder == exclude {
                continue;
            }
            if let Some(other) = self.reservations.get(&holder) {
                if other.is_terminal() {
                    continue;
                }
                for component in &other.assigned {
                    if component.bdf == bdf {
                        if let Some(vlan) = component.vlan {
                            busy.insert(vlan);
                        }
                    }
                }
                for ifs in &other.interfaces {
                    if let Some(vlan) = ifs.vlan {
                        busy.insert(vlan);
                    }
                }
            }
        }
        busy
    }
}

/// Result of a policy decision on one reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOutcome {
    /// Annotations applied; the kernel confirms to the requester.
    Granted,
    /// Redeem accepted; the handler is due at the given cycle.
    Bound {
        /// Cycle at which provisioning should start.
        due: u64,
    },
    /// Refused with the recorded error.
    Denied(LastError),
}

/// The capability set a role's policy module implements.
///
/// Operations a role never performs keep the default refusal so a
/// misrouted message cannot allocate anything.
pub trait Policy: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Broker: annotate and reserve against the calendar, first fit.
    ///
    /// # Errors
    ///
    /// Returns an error only for internal failures; refusals are
    /// reported through [`PolicyOutcome::Denied`].
    fn allocate_ticket(
        &mut self,
        reservation: &mut Reservation,
        ctx: &mut PolicyContext<'_>,
    ) -> Result<PolicyOutcome> {
        let _ = (reservation, ctx);
        Ok(PolicyOutcome::Denied(LastError::new(
            crate::error::ErrorKind::InvalidRequest,
            format!("{} does not allocate tickets", self.name()),
        )))
    }

    /// Authority: verify and bind a redeemed ticket to the local calendar.
    ///
    /// # Errors
    ///
    /// Returns an error only for internal failures.
    fn bind_redeem(
        &mut self,
        reservation: &mut Reservation,
        ctx: &mut PolicyContext<'_>,
    ) -> Result<PolicyOutcome> {
        let _ = (reservation, ctx);
        Ok(PolicyOutcome::Denied(LastError::new(
            crate::error::ErrorKind::InvalidRequest,
            format!("{} does not bind redeems", self.name()),
        )))
    }

    /// Extend an existing grant to a later end.
    ///
    /// # Errors
    ///
    /// Returns an error only for internal failures.
    fn extend(
        &mut self,
        reservation: &mut Reservation,
        new_end_ms: i64,
        ctx: &mut PolicyContext<'_>,
    ) -> Result<PolicyOutcome> {
        let _ = (reservation, new_end_ms, ctx);
        Ok(PolicyOutcome::Denied(LastError::new(
            crate::error::ErrorKind::InvalidRequest,
            format!("{} does not extend", self.name()),
        )))
    }

    /// Release whatever the policy holds for the reservation.
    fn close(&mut self, reservation: &Reservation, ctx: &mut PolicyContext<'_>) {
        if let Some(map) = &reservation.node_map {
            ctx.calendar.remove_holding(&map.node_id, &reservation.id);
        }
        for ifs in &reservation.interfaces {
            if let Some(node) = &ifs.parent_node_id {
                ctx.calendar.remove_holding(node, &reservation.id);
            }
        }
    }

    /// Periodic housekeeping at the end of every kernel tick.
    fn tick(&mut self, cycle: u64) {
        let _ = cycle;
    }
}
