//! Restart recovery: rebuild kernel state from the persisted store.
//!
//! Replaying the persisted entities rebuilds the arena, the calendar
//! views, and the in-flight markers. Reservations caught mid-provision
//! are probed through their handler before the kernel trusts them;
//! requests that died with the process are reset so the per-slice
//! progression re-issues them, which the receiving side absorbs
//! idempotently.

use tracing::{debug, info};

use crate::error::Result;
use crate::model::{ActorRole, PendingState, ReservationState};

use super::events::{ProvisionKind, ProvisionRequest};
use super::Kernel;

/// What a recovery pass rebuilt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Slices rehydrated.
    pub slices: usize,
    /// Reservations rehydrated.
    pub reservations: usize,
    /// Delegations rehydrated.
    pub delegations: usize,
    /// Holdings rebuilt on the calendar.
    pub holdings: usize,
    /// Handler probes issued for reservations caught in `Priming`.
    pub probes: usize,
}

impl Kernel {
    /// Rehydrates the kernel from its store.
    ///
    /// Call once after construction, before the clock starts ticking.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::CoreError::Store`] or
    /// [`crate::error::CoreError::Serialization`] when persisted state
    /// cannot be read back.
    pub fn recover(&mut self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for site in self.store.load_sites()? {
            if site.maintenance {
                self.maintenance_sites.insert(site.name.clone());
            }
        }
        for delegation in self.store.load_delegations()? {
            report.delegations += 1;
            self.state
                .delegations
                .insert(delegation.id.clone(), delegation);
        }
        for slice in self.store.load_slices()? {
            report.slices += 1;
            self.state.slices.insert(slice.id.clone(), slice);
        }

        let reservations = self.store.load_reservations()?;
        for mut reservation in reservations {
            report.reservations += 1;
            let rid = reservation.id.clone();
            let term = reservation.effective_term();
            let start = term.start_cycle(&self.clock);
            let end = term.end_cycle(&self.clock);

            // Holdings exist wherever a broker granted or an authority
            // bound; terminal reservations hold nothing.
            if !reservation.is_terminal()
                && self.role != ActorRole::Orchestrator
                && reservation.approved.is_some()
            {
                if let Some(map) = &reservation.node_map {
                    self.calendar
                        .add_holding(&map.node_id, rid.clone(), term.start_ms, term.end_ms);
                    report.holdings += 1;
                }
                for ifs in &reservation.interfaces {
                    if let Some(node) = &ifs.parent_node_id {
                        self.calendar
                            .add_holding(node, rid.clone(), term.start_ms, term.end_ms);
                        report.holdings += 1;
                    }
                }
            }

            match self.role {
                ActorRole::Authority => {
                    match (reservation.state, reservation.pending) {
                        (ReservationState::Ticketed, PendingState::Priming) => {
                            // Crashed while provisioning was scheduled or
                            // in flight: a safety probe decides whether
                            // the handler side survived.
                            debug!(reservation = %rid, "probing reservation recovered in priming");
                            report.probes += 1;
                            self.provision.push(ProvisionRequest {
                                reservation: reservation.clone(),
                                kind: ProvisionKind::Probe,
                            });
                            self.calendar.add_closing(rid.clone(), end);
                        }
                        (ReservationState::Ticketed, _) => {
                            self.calendar.add_redeeming(rid.clone(), start);
                            self.calendar.add_closing(rid.clone(), end);
                        }
                        (ReservationState::Active, _) => {
                            self.calendar.add_closing(rid.clone(), end);
                        }
                        (ReservationState::ActiveTicketed, PendingState::ExtendingLease) => {
                            let swap = self.clock.cycle(term.new_start_ms).saturating_sub(1);
                            self.calendar.add_pending(rid.clone(), swap);
                            self.calendar.add_closing(rid.clone(), end);
                        }
                        (ReservationState::ActiveTicketed, _) => {
                            self.calendar.add_closing(rid.clone(), end);
                        }
                        (ReservationState::CloseWait, _) => {
                            // Teardown died with the process; run it again.
                            reservation.pending = PendingState::Closing;
                            self.provision.push(ProvisionRequest {
                                reservation: reservation.clone(),
                                kind: ProvisionKind::Teardown,
                            });
                        }
                        _ => {}
                    }
                }
                ActorRole::Broker => {
                    if !reservation.is_terminal() {
                        self.calendar.add_closing(rid.clone(), end);
                    }
                }
                ActorRole::Orchestrator => {
                    // In-flight requests died with the process; clearing
                    // the marker makes the progression re-issue them and
                    // the receiving side replays its original answer.
                    if reservation.pending.is_in_flight()
                        && reservation.pending != PendingState::Priming
                    {
                        reservation.pending = PendingState::None;
                    }
                    // A renewal deferred before the crash is re-parked.
                    if reservation.properties.contains_key(super::PROP_EXTEND_END) {
                        self.calendar.add_renewing(rid.clone(), 0);
                    }
                }
            }

            self.state.reservations.insert(rid, reservation);
        }

        info!(
            slices = report.slices,
            reservations = report.reservations,
            delegations = report.delegations,
            holdings = report.holdings,
            probes = report.probes,
            "recovery complete"
        );
        Ok(report)
    }
}
