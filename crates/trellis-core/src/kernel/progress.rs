//! Tick phases: queue drain, calendar-due work, per-slice progression,
//! deadlines, and the persistence flush.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::calendar::Bucket;
use crate::error::{CoreError, ErrorKind, LastError, Result};
use crate::graph::RequestGraph;
use crate::model::{
    ActorRole, PendingState, Reservation, ReservationId, ReservationState, Slice, SliceId,
    SliceOwner, SliceState,
};
use crate::orchestrator;
use crate::protocol::{Envelope, MessageKind, OperationStatus, SliceInfo};

use super::events::{KernelEvent, LocalCommand, PendingRpc, ProvisionKind, ProvisionRequest};
use super::{Kernel, PROP_CALLBACK_TOPIC, PROP_EXTEND_DEADLINE, PROP_EXTEND_END};

/// Dependency gate verdict for one reservation.
pub(crate) enum PredStatus {
    /// Every predecessor is at or past its target state.
    Satisfied,
    /// Some predecessor has not reached its target yet.
    Waiting,
    /// A predecessor is terminal and will never reach the target.
    Broken(ReservationId),
}

impl Kernel {
    // =========================================================================
    // Queue drain
    // =========================================================================

    pub(crate) fn drain_queue(&mut self) -> usize {
        let cap = self.kernel_settings.event_batch_cap;
        let mut drained = 0;
        while drained < cap {
            let Some(event) = self.queue.pop_front() else {
                break;
            };
            drained += 1;
            if let Err(err) = self.handle_event(event) {
                // One bad event never halts the actor; the failure is
                // recorded on the reservation where one is involved.
                warn!(error = %err, "event quarantined");
            }
        }
        drained
    }

    fn handle_event(&mut self, event: KernelEvent) -> Result<()> {
        match event {
            KernelEvent::Message(envelope) => self.handle_message(envelope),
            KernelEvent::HandlerCompleted {
                reservation,
                kind,
                ok,
                message,
                properties,
            } => self.on_handler_completed(&reservation, kind, ok, &message, properties),
            KernelEvent::TimeoutExpired { correlation } => {
                self.on_timeout(correlation);
                Ok(())
            }
            KernelEvent::Command(command) => self.on_command(command),
        }
    }

    fn on_command(&mut self, command: LocalCommand) -> Result<()> {
        match command {
            LocalCommand::CreateSlice {
                name,
                owner,
                graph,
                end_ms,
            } => self.create_slice(&name, owner, graph, end_ms).map(|_| ()),
            LocalCommand::CloseSlice { slice_id } => self.close_slice(&slice_id),
            LocalCommand::ExtendSlice {
                slice_id,
                new_end_ms,
            } => self.extend_slice(&slice_id, new_end_ms),
            LocalCommand::ClaimDelegation {
                delegation_id,
                authority,
            } => {
                let Some(topic) = self
                    .peers
                    .iter()
                    .find(|p| p.guid == authority)
                    .map(|p| p.topic.clone())
                else {
                    return Err(CoreError::NotFound {
                        entity: "peer",
                        id: authority.to_string(),
                    });
                };
                let envelope = Envelope::request(
                    self.guid.clone(),
                    self.topic.clone(),
                    MessageKind::Claim { delegation_id },
                );
                self.send_rpc(topic, envelope, None);
                Ok(())
            }
            LocalCommand::ReclaimDelegation { delegation_id } => {
                let Some(topic) = self.broker_peer().map(|p| p.topic.clone()) else {
                    return Err(CoreError::NotFound {
                        entity: "peer",
                        id: "broker".to_string(),
                    });
                };
                let envelope = Envelope::request(
                    self.guid.clone(),
                    self.topic.clone(),
                    MessageKind::Reclaim { delegation_id },
                );
                self.send_rpc(topic, envelope, None);
                Ok(())
            }
        }
    }

    // =========================================================================
    // Local slice commands (orchestrator)
    // =========================================================================

    /// Builds a slice of reservations from a request graph and demands it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRequest`] for bad lease bounds, a name
    /// collision with a live slice of the same owner, an invalid request
    /// graph, or a zero-capacity node request.
    pub fn create_slice(
        &mut self,
        name: &str,
        owner: SliceOwner,
        graph: RequestGraph,
        end_ms: Option<i64>,
    ) -> Result<SliceId> {
        let now_ms = self.clock.cycle_start_ms(self.cycle);
        let mut end_ms = end_ms.unwrap_or(now_ms + 24 * 3_600_000);
        if end_ms <= now_ms {
            return Err(CoreError::InvalidRequest(format!(
                "lease end {end_ms} is not after now {now_ms}"
            )));
        }
        let cap_ms = now_ms + self.policy_settings.max_lease_ms;
        if end_ms > cap_ms {
            warn!(requested = end_ms, cap = cap_ms, "slice lease truncated to policy cap");
            end_ms = cap_ms;
        }

        if self
            .state
            .slices
            .values()
            .any(|s| s.owner == owner && s.name == name && !s.state.is_dead())
            || self.store.find_live_slice(&owner, name)?.is_some()
        {
            return Err(CoreError::InvalidRequest(format!(
                "owner already has a live slice named {name}"
            )));
        }

        graph.validate()?;
        for node in &graph.nodes {
            if node.capacities.is_zero() {
                return Err(CoreError::InvalidRequest(format!(
                    "node request {} asks for zero capacity",
                    node.id
                )));
            }
        }

        let term = crate::time::Term::new(now_ms, end_ms)?;
        let mut slice = Slice::new(name, owner.clone(), term);
        slice.graph_id = Some(graph.id.clone());
        slice.last_update_ms = now_ms;
        let slice_id = slice.id.clone();

        let reservations = orchestrator::build_reservations(&slice, &graph, term)?;
        info!(slice = %slice_id, members = reservations.len(), "slice demanded");

        self.state.dirty_slices.insert(slice_id.clone());
        self.state.slices.insert(slice_id.clone(), slice);
        for reservation in reservations {
            self.state.insert_reservation(reservation);
        }
        self.store.bump_slice_count(&owner, 1)?;
        Ok(slice_id)
    }

    /// Closes a slice: every member reservation is cancelled or torn down.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] for an unknown slice.
    pub fn close_slice(&mut self, slice_id: &SliceId) -> Result<()> {
        let Some(slice) = self.state.slices.get_mut(slice_id) else {
            return Err(CoreError::NotFound {
                entity: "slice",
                id: slice_id.to_string(),
            });
        };
        slice.begin_close();
        let members = slice.reservations.clone();
        self.state.dirty_slices.insert(slice_id.clone());

        for rid in members {
            let Some(reservation) = self.state.reservations.get(&rid) else {
                continue;
            };
            if reservation.is_terminal() {
                continue;
            }
            let state = reservation.state;
            let site = reservation.site.clone();
            let mut reservation = self.take_reservation(&rid)?;
            match state {
                ReservationState::Nascent | ReservationState::Unknown => {
                    reservation.pending = PendingState::None;
                    reservation.transition(ReservationState::Closed)?;
                    self.calendar.remove_reservation(&rid);
                }
                ReservationState::Ticketed => {
                    // Ticketed but not yet active: release the broker's
                    // holding and finish locally. A redeem already in
                    // flight is cancelled at the authority as well.
                    let redeeming = reservation.pending == PendingState::Redeeming;
                    reservation.pending = PendingState::None;
                    reservation.transition(ReservationState::Closed)?;
                    self.calendar.remove_reservation(&rid);
                    if let Some(topic) = self.broker_peer().map(|p| p.topic.clone()) {
                        let envelope = Envelope::request(
                            self.guid.clone(),
                            self.topic.clone(),
                            MessageKind::Close {
                                reservation_id: rid.clone(),
                            },
                        );
                        self.send(topic, envelope);
                    }
                    if redeeming {
                        if let Some(topic) =
                            self.authority_for_site(&site).map(|p| p.topic.clone())
                        {
                            let envelope = Envelope::request(
                                self.guid.clone(),
                                self.topic.clone(),
                                MessageKind::Close {
                                    reservation_id: rid.clone(),
                                },
                            );
                            self.send(topic, envelope);
                        }
                    }
                }
                ReservationState::Active
                | ReservationState::ActiveTicketed
                | ReservationState::CloseWait => {
                    reservation.pending = PendingState::Closing;
                    if state != ReservationState::CloseWait {
                        reservation.transition(ReservationState::CloseWait)?;
                    }
                    if let Some(topic) =
                        self.authority_for_site(&site).map(|p| p.topic.clone())
                    {
                        let envelope = Envelope::request(
                            self.guid.clone(),
                            self.topic.clone(),
                            MessageKind::Close {
                                reservation_id: rid.clone(),
                            },
                        );
                        self.send(topic, envelope);
                    }
                }
                ReservationState::Closed | ReservationState::Failed => {}
            }
            self.put_back(reservation);
        }
        Ok(())
    }

    /// Extends every active member of a slice to a later lease end.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] for an unknown slice.
    pub fn extend_slice(&mut self, slice_id: &SliceId, new_end_ms: i64) -> Result<()> {
        let Some(slice) = self.state.slices.get(slice_id) else {
            return Err(CoreError::NotFound {
                entity: "slice",
                id: slice_id.to_string(),
            });
        };
        let members = slice.reservations.clone();
        let Some(broker_topic) = self.broker_peer().map(|p| p.topic.clone()) else {
            return Err(CoreError::NotFound {
                entity: "peer",
                id: "broker".to_string(),
            });
        };
        for rid in members {
            let Some(reservation) = self.state.reservations.get_mut(&rid) else {
                continue;
            };
            if reservation.is_terminal() {
                continue;
            }
            if reservation.state != ReservationState::Active
                || reservation.pending != PendingState::None
            {
                // The member is mid-operation; park the renewal and retry
                // once it settles, bounded by the lookahead window.
                let deadline = self.cycle + self.policy_settings.renewal_lookahead_cycles;
                reservation
                    .properties
                    .insert(PROP_EXTEND_END.to_string(), new_end_ms.to_string());
                reservation
                    .properties
                    .insert(PROP_EXTEND_DEADLINE.to_string(), deadline.to_string());
                self.state.mark_dirty(&rid);
                self.calendar.add_renewing(rid.clone(), self.cycle + 1);
                continue;
            }
            self.issue_extend_ticket(&rid, new_end_ms, &broker_topic);
        }
        Ok(())
    }

    fn issue_extend_ticket(&mut self, rid: &ReservationId, new_end_ms: i64, broker_topic: &str) {
        if let Some(reservation) = self.state.reservations.get_mut(rid) {
            reservation.pending = PendingState::ExtendingTicket;
            self.state.mark_dirty(rid);
        }
        let envelope = Envelope::request(
            self.guid.clone(),
            self.topic.clone(),
            MessageKind::ExtendTicket {
                reservation_id: rid.clone(),
                new_end_ms,
            },
        );
        self.send_rpc(broker_topic.to_string(), envelope, Some(rid.clone()));
    }

    /// Retries a renewal that was requested while the member was busy.
    fn retry_deferred_renewal(&mut self, rid: &ReservationId, cycle: u64) {
        let Some(reservation) = self.state.reservations.get(rid) else {
            return;
        };
        if reservation.is_terminal() {
            return;
        }
        let Some(end_ms) = reservation
            .properties
            .get(PROP_EXTEND_END)
            .and_then(|v| v.parse::<i64>().ok())
        else {
            return;
        };
        let deadline = reservation
            .properties
            .get(PROP_EXTEND_DEADLINE)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(cycle);
        let eligible = reservation.state == ReservationState::Active
            && reservation.pending == PendingState::None;

        if eligible {
            if let Some(reservation) = self.state.reservations.get_mut(rid) {
                reservation.properties.remove(PROP_EXTEND_END);
                reservation.properties.remove(PROP_EXTEND_DEADLINE);
            }
            let Some(broker_topic) = self.broker_peer().map(|p| p.topic.clone()) else {
                return;
            };
            debug!(reservation = %rid, end_ms, "issuing deferred renewal");
            self.issue_extend_ticket(rid, end_ms, &broker_topic);
        } else if cycle >= deadline {
            warn!(reservation = %rid, "deferred renewal expired before the member settled");
            if let Some(reservation) = self.state.reservations.get_mut(rid) {
                reservation.properties.remove(PROP_EXTEND_END);
                reservation.properties.remove(PROP_EXTEND_DEADLINE);
                self.state.mark_dirty(rid);
            }
        } else {
            self.calendar.add_renewing(rid.clone(), cycle + 1);
        }
    }

    // =========================================================================
    // Calendar-due processing
    // =========================================================================

    pub(crate) fn process_due(&mut self, cycle: u64) {
        if self.role == ActorRole::Authority {
            for rid in self.calendar.due_before(Bucket::Redeeming, cycle) {
                self.start_provision(&rid);
            }
            for rid in self.calendar.due_before(Bucket::Pending, cycle) {
                self.apply_lease_swap(&rid);
            }
        }
        if self.role == ActorRole::Orchestrator {
            for rid in self.calendar.due_before(Bucket::Renewing, cycle) {
                self.retry_deferred_renewal(&rid, cycle);
            }
        } else {
            for rid in self.calendar.due_before(Bucket::Closing, cycle) {
                self.close_due(&rid, cycle);
            }
        }
    }

    /// Lease start reached: hand the sliver to its handler.
    fn start_provision(&mut self, rid: &ReservationId) {
        let Some(reservation) = self.state.reservations.get(rid) else {
            return;
        };
        if reservation.state != ReservationState::Ticketed
            || reservation.pending != PendingState::Priming
        {
            return;
        }
        debug!(reservation = %rid, "lease start, provisioning");
        self.provision.push(ProvisionRequest {
            reservation: reservation.clone(),
            kind: ProvisionKind::Provision,
        });
    }

    /// Swap cycle reached for a renewed lease: replace the window.
    fn apply_lease_swap(&mut self, rid: &ReservationId) {
        let Some(reservation) = self.state.reservations.get_mut(rid) else {
            return;
        };
        if reservation.state != ReservationState::ActiveTicketed
            || reservation.pending != PendingState::ExtendingLease
        {
            return;
        }
        let Some(term) = reservation.approved_term else {
            return;
        };
        reservation.term = term;
        reservation.pending = PendingState::None;
        if reservation.transition(ReservationState::Active).is_err() {
            return;
        }
        info!(reservation = %rid, term = %term, "lease window swapped");
        let snapshot = reservation.clone();
        self.state.mark_dirty(rid);
        self.calendar
            .add_closing(rid.clone(), term.end_cycle(&self.clock));
        self.emit_update_lease(&snapshot, OperationStatus::success());
    }

    /// Lease end reached: tear down (authority) or release (broker).
    fn close_due(&mut self, rid: &ReservationId, cycle: u64) {
        let Some(reservation) = self.state.reservations.get(rid) else {
            return;
        };
        if reservation.is_terminal() {
            return;
        }
        // A renewal may have moved the end since this entry was queued.
        let end_cycle = reservation.effective_term().end_cycle(&self.clock);
        if end_cycle > cycle {
            self.calendar.add_closing(rid.clone(), end_cycle);
            return;
        }
        match self.role {
            ActorRole::Authority => {
                let Ok(mut reservation) = self.take_reservation(rid) else {
                    return;
                };
                let had_handler = matches!(
                    reservation.state,
                    ReservationState::Active | ReservationState::ActiveTicketed
                ) || reservation.pending == PendingState::Priming;
                reservation.pending = PendingState::Closing;
                if reservation.transition(ReservationState::CloseWait).is_err() {
                    self.put_back(reservation);
                    return;
                }
                debug!(reservation = %rid, "lease end, tearing down");
                if had_handler {
                    self.provision.push(ProvisionRequest {
                        reservation: reservation.clone(),
                        kind: ProvisionKind::Teardown,
                    });
                    self.put_back(reservation);
                } else {
                    reservation.pending = PendingState::None;
                    let _ = reservation.transition(ReservationState::Closed);
                    self.put_back(reservation);
                    self.release_reservation(rid);
                }
            }
            ActorRole::Broker => {
                let Ok(mut reservation) = self.take_reservation(rid) else {
                    return;
                };
                reservation.pending = PendingState::None;
                let done = match reservation.state {
                    ReservationState::Active | ReservationState::ActiveTicketed => reservation
                        .transition(ReservationState::CloseWait)
                        .and_then(|()| reservation.transition(ReservationState::Closed)),
                    _ => reservation.transition(ReservationState::Closed),
                };
                if let Err(err) = done {
                    warn!(reservation = %rid, error = %err, "close at lease end failed");
                }
                self.put_back(reservation);
                self.release_reservation(rid);
            }
            ActorRole::Orchestrator => {}
        }
    }

    /// Releases holdings and calendar entries for a reservation.
    pub(crate) fn release_reservation(&mut self, rid: &ReservationId) {
        if let Some(reservation) = self.state.reservations.remove(rid) {
            let (policy, mut ctx) = self.split_policy();
            policy.close(&reservation, &mut ctx);
            self.state.reservations.insert(rid.clone(), reservation);
        }
        self.calendar.remove_reservation(rid);
        self.state.mark_dirty(rid);
    }

    // =========================================================================
    // Handler completions (authority)
    // =========================================================================

    fn on_handler_completed(
        &mut self,
        rid: &ReservationId,
        kind: ProvisionKind,
        ok: bool,
        message: &str,
        properties: std::collections::BTreeMap<String, String>,
    ) -> Result<()> {
        let Ok(mut reservation) = self.take_reservation(rid) else {
            return Ok(());
        };
        match kind {
            ProvisionKind::Provision => {
                if reservation.state != ReservationState::Ticketed
                    || reservation.pending != PendingState::Priming
                {
                    // Stale completion, e.g. the slice closed mid-flight.
                    self.put_back(reservation);
                    return Ok(());
                }
                if ok {
                    reservation.properties.extend(properties);
                    reservation.pending = PendingState::None;
                    reservation.transition(ReservationState::Active)?;
                    info!(reservation = %rid, "sliver active");
                    let snapshot = reservation.clone();
                    self.calendar.add_closing(
                        rid.clone(),
                        reservation.effective_term().end_cycle(&self.clock),
                    );
                    self.put_back(reservation);
                    self.emit_update_lease(&snapshot, OperationStatus::success());
                } else {
                    let error = LastError::new(ErrorKind::HandlerFailure, message);
                    reservation.fail(error.clone());
                    let snapshot = reservation.clone();
                    self.put_back(reservation);
                    self.release_reservation(rid);
                    self.emit_update_lease(&snapshot, OperationStatus::failed(error));
                }
            }
            ProvisionKind::Teardown => {
                reservation.pending = PendingState::None;
                let status = if ok {
                    reservation.transition(ReservationState::Closed)?;
                    OperationStatus::success()
                } else {
                    let error = LastError::new(ErrorKind::HandlerFailure, message);
                    reservation.fail(error.clone());
                    OperationStatus::failed(error)
                };
                let snapshot = reservation.clone();
                self.put_back(reservation);
                self.release_reservation(rid);
                self.emit_update_lease(&snapshot, status);
            }
            ProvisionKind::Probe => {
                // `ok` means the sliver is still present on the substrate.
                if ok {
                    debug!(reservation = %rid, "probe found sliver, resuming provision");
                    self.provision.push(ProvisionRequest {
                        reservation: reservation.clone(),
                        kind: ProvisionKind::Provision,
                    });
                    self.put_back(reservation);
                } else {
                    let error = LastError::new(
                        ErrorKind::HandlerFailure,
                        "sliver deleted while the actor was down",
                    );
                    reservation.fail(error.clone());
                    let snapshot = reservation.clone();
                    self.put_back(reservation);
                    self.release_reservation(rid);
                    self.emit_update_lease(&snapshot, OperationStatus::failed(error));
                }
            }
        }
        Ok(())
    }

    /// Sends `UpdateLease` to the orchestrator that redeemed the
    /// reservation and to the broker arbitrating it.
    pub(crate) fn emit_update_lease(&mut self, snapshot: &Reservation, status: OperationStatus) {
        let kind = MessageKind::UpdateLease {
            reservation: Box::new(snapshot.clone()),
            status,
        };
        if let Some(topic) = snapshot.properties.get(PROP_CALLBACK_TOPIC).cloned() {
            let envelope = Envelope::request(self.guid.clone(), self.topic.clone(), kind.clone());
            self.send(topic, envelope);
        }
        if let Some(topic) = self.broker_peer().map(|p| p.topic.clone()) {
            let envelope = Envelope::request(self.guid.clone(), self.topic.clone(), kind);
            self.send(topic, envelope);
        }
    }

    // =========================================================================
    // Per-slice progression (orchestrator)
    // =========================================================================

    pub(crate) fn progress_slices(&mut self, _cycle: u64) {
        if self.role != ActorRole::Orchestrator {
            return;
        }
        let slice_ids: Vec<SliceId> = self.state.slices.keys().cloned().collect();
        for slice_id in slice_ids {
            let members = self
                .state
                .slices
                .get(&slice_id)
                .map(|s| s.reservations.clone())
                .unwrap_or_default();
            for rid in members {
                if let Err(err) = self.progress_one(&rid) {
                    warn!(reservation = %rid, error = %err, "progression quarantined");
                    if let Some(reservation) = self.state.reservations.get_mut(&rid) {
                        reservation.fail(LastError::new(ErrorKind::Internal, err.to_string()));
                        self.state.mark_dirty(&rid);
                    }
                }
            }
        }
    }

    fn progress_one(&mut self, rid: &ReservationId) -> Result<()> {
        let Some(reservation) = self.state.reservations.get(rid) else {
            return Ok(());
        };
        if reservation.is_terminal() || reservation.pending.is_in_flight() {
            return Ok(());
        }
        match reservation.state {
            ReservationState::Nascent => self.progress_ticket(rid),
            ReservationState::Ticketed => self.progress_redeem(rid),
            _ => Ok(()),
        }
    }

    pub(crate) fn predecessor_status(&self, reservation: &Reservation) -> PredStatus {
        for pred in &reservation.predecessors {
            match self.state.reservations.get(&pred.reservation_id) {
                None => return PredStatus::Broken(pred.reservation_id.clone()),
                Some(p) if p.state == ReservationState::Failed => {
                    return PredStatus::Broken(p.id.clone())
                }
                Some(p) if p.state.is_terminal() && !p.state.at_or_past(pred.target) => {
                    return PredStatus::Broken(p.id.clone())
                }
                Some(p) if p.state.at_or_past(pred.target) => {}
                Some(_) => return PredStatus::Waiting,
            }
        }
        PredStatus::Satisfied
    }

    fn progress_ticket(&mut self, rid: &ReservationId) -> Result<()> {
        let reservation = self
            .state
            .reservations
            .get(rid)
            .ok_or_else(|| CoreError::NotFound {
                entity: "reservation",
                id: rid.to_string(),
            })?;
        match self.predecessor_status(reservation) {
            PredStatus::Broken(pred) => {
                self.fail_dependent(rid, &pred);
                Ok(())
            }
            PredStatus::Waiting => {
                if let Some(reservation) = self.state.reservations.get_mut(rid) {
                    if reservation.pending != PendingState::BlockedTicket {
                        debug!(reservation = %rid, "parked until predecessors are ticketed");
                        reservation.pending = PendingState::BlockedTicket;
                        self.state.mark_dirty(rid);
                    }
                }
                Ok(())
            }
            PredStatus::Satisfied => {
                let Some(broker_topic) = self.broker_peer().map(|p| p.topic.clone()) else {
                    return Err(CoreError::Internal("no broker peer configured".to_string()));
                };
                let mut reservation = self.take_reservation(rid)?;
                if reservation.rtype.is_network_service() {
                    orchestrator::adopt_parent_labels(&mut reservation, &self.state.reservations);
                }
                reservation.pending = PendingState::Ticketing;
                let slice_info = self.slice_info(&reservation.slice_id)?;
                let envelope = Envelope::request(
                    self.guid.clone(),
                    self.topic.clone(),
                    MessageKind::Ticket {
                        slice: slice_info,
                        reservations: vec![reservation.clone()],
                    },
                );
                self.put_back(reservation);
                self.send_rpc(broker_topic, envelope, Some(rid.clone()));
                Ok(())
            }
        }
    }

    fn progress_redeem(&mut self, rid: &ReservationId) -> Result<()> {
        let reservation = self
            .state
            .reservations
            .get(rid)
            .ok_or_else(|| CoreError::NotFound {
                entity: "reservation",
                id: rid.to_string(),
            })?;
        match self.predecessor_status(reservation) {
            PredStatus::Broken(pred) => {
                self.fail_dependent(rid, &pred);
                Ok(())
            }
            PredStatus::Waiting => {
                if let Some(reservation) = self.state.reservations.get_mut(rid) {
                    if reservation.pending != PendingState::BlockedRedeem {
                        reservation.pending = PendingState::BlockedRedeem;
                        self.state.mark_dirty(rid);
                    }
                }
                Ok(())
            }
            PredStatus::Satisfied => {
                let site = reservation.site.clone();
                let Some(topic) = self.authority_for_site(&site).map(|p| p.topic.clone()) else {
                    return Err(CoreError::Internal(format!(
                        "no authority peer for site {site}"
                    )));
                };
                let mut reservation = self.take_reservation(rid)?;
                reservation.pending = PendingState::Redeeming;
                let slice_info = self.slice_info(&reservation.slice_id)?;
                let envelope = Envelope::request(
                    self.guid.clone(),
                    self.topic.clone(),
                    MessageKind::Redeem {
                        slice: slice_info,
                        reservation: Box::new(reservation.clone()),
                    },
                );
                self.put_back(reservation);
                self.send_rpc(topic, envelope, Some(rid.clone()));
                Ok(())
            }
        }
    }

    pub(crate) fn fail_dependent(&mut self, rid: &ReservationId, pred: &ReservationId) {
        if let Some(reservation) = self.state.reservations.get_mut(rid) {
            reservation.fail(LastError::new(
                ErrorKind::PredecessorFailed,
                format!("predecessor {pred} failed"),
            ));
            self.state.mark_dirty(rid);
        }
        self.calendar.remove_reservation(rid);
    }

    fn slice_info(&self, slice_id: &SliceId) -> Result<SliceInfo> {
        let slice = self
            .state
            .slices
            .get(slice_id)
            .ok_or_else(|| CoreError::NotFound {
                entity: "slice",
                id: slice_id.to_string(),
            })?;
        Ok(SliceInfo {
            id: slice.id.clone(),
            name: slice.name.clone(),
            owner: slice.owner.clone(),
            graph_id: slice.graph_id.clone(),
        })
    }

    // =========================================================================
    // Deadlines, slice recompute, garbage collection, persistence
    // =========================================================================

    pub(crate) fn on_timeout(&mut self, correlation: Uuid) {
        if let Some(rpc) = self.pending_rpcs.remove(&correlation) {
            self.retry_or_fail(rpc);
        }
    }

    pub(crate) fn check_rpc_deadlines(&mut self, cycle: u64) {
        let due: Vec<Uuid> = self
            .pending_rpcs
            .iter()
            .filter(|(_, rpc)| rpc.deadline <= cycle)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            if let Some(rpc) = self.pending_rpcs.remove(&id) {
                self.retry_or_fail(rpc);
            }
        }
    }

    fn retry_or_fail(&mut self, rpc: PendingRpc) {
        if rpc.attempt < self.rpc_retries {
            // Fixed backoff: the next attempt gets a full fresh deadline.
            let mut envelope = rpc.envelope.clone();
            envelope.msg_id = Uuid::new_v4();
            debug!(
                kind = envelope.kind.name(),
                attempt = rpc.attempt + 1,
                "request timed out, retrying"
            );
            self.pending_rpcs.insert(
                envelope.msg_id,
                PendingRpc {
                    reservation: rpc.reservation,
                    envelope: envelope.clone(),
                    topic: rpc.topic.clone(),
                    deadline: self.cycle + self.rpc_timeout_cycles,
                    attempt: rpc.attempt + 1,
                },
            );
            self.send(rpc.topic, envelope);
            return;
        }
        warn!(kind = rpc.envelope.kind.name(), "request failed after all retries");
        if let Some(rid) = rpc.reservation {
            if let Some(reservation) = self.state.reservations.get_mut(&rid) {
                reservation.fail(LastError::new(
                    ErrorKind::Timeout,
                    format!(
                        "{} not acknowledged within {} attempts",
                        rpc.envelope.kind.name(),
                        rpc.attempt
                    ),
                ));
            }
            self.calendar.remove_reservation(&rid);
            self.state.mark_dirty(&rid);
        }
    }

    pub(crate) fn recompute_slices(&mut self, cycle: u64) {
        let slice_ids: Vec<SliceId> = self.state.slices.keys().cloned().collect();
        for slice_id in slice_ids {
            let Some(slice) = self.state.slices.get(&slice_id) else {
                continue;
            };
            let states: Vec<ReservationState> = slice
                .reservations
                .iter()
                .filter_map(|rid| self.state.reservations.get(rid))
                .map(|r| r.state)
                .collect();
            let before = slice.state;
            let now_ms = self.clock.cycle_start_ms(cycle);
            if let Some(slice) = self.state.slices.get_mut(&slice_id) {
                slice.recompute_state(&states, cycle);
                if slice.state != before {
                    slice.last_update_ms = now_ms;
                    self.state.dirty_slices.insert(slice_id);
                }
            }
        }
    }

    pub(crate) fn collect_garbage(&mut self, cycle: u64) -> Result<()> {
        let grace = self.kernel_settings.grace_cycles;
        let reclaimable: Vec<SliceId> = self
            .state
            .slices
            .values()
            .filter(|s| s.reclaimable(cycle, grace))
            .map(|s| s.id.clone())
            .collect();
        for slice_id in reclaimable {
            let Some(slice) = self.state.slices.remove(&slice_id) else {
                continue;
            };
            info!(slice = %slice_id, "garbage collecting dead slice");
            for rid in &slice.reservations {
                self.state.reservations.remove(rid);
                self.state.dirty_reservations.remove(rid);
                self.calendar.remove_reservation(rid);
            }
            self.state.dirty_slices.remove(&slice_id);
            self.store.remove_slice(&slice_id)?;
            if self.role == ActorRole::Orchestrator {
                self.store.bump_slice_count(&slice.owner, -1)?;
            }
        }
        Ok(())
    }

    pub(crate) fn flush_dirty(&mut self) -> Result<usize> {
        if self.state.dirty_slices.is_empty() && self.state.dirty_reservations.is_empty() {
            return Ok(0);
        }
        let slices: Vec<&Slice> = self
            .state
            .dirty_slices
            .iter()
            .filter_map(|id| self.state.slices.get(id))
            .collect();
        let reservations: Vec<&Reservation> = self
            .state
            .dirty_reservations
            .iter()
            .filter_map(|id| self.state.reservations.get(id))
            .collect();
        let persisted = slices.len() + reservations.len();

        let chunk = self.commit_batch_size.max(1);
        let mut offset = 0;
        while offset < reservations.len() || offset == 0 {
            let upper = (offset + chunk).min(reservations.len());
            let slice_part: &[&Slice] = if offset == 0 { &slices } else { &[] };
            self.store
                .commit_batch(slice_part, &reservations[offset..upper])?;
            if upper >= reservations.len() {
                break;
            }
            offset = upper;
        }

        self.state.dirty_slices.clear();
        self.state.dirty_reservations.clear();
        self.store
            .touch_poas(self.clock.cycle_start_ms(self.cycle))?;
        Ok(persisted)
    }

    /// Recomputes the slice state for every slice; used by tests to
    /// assert the dead-slice invariant.
    #[must_use]
    pub fn slice_state(&self, slice_id: &SliceId) -> Option<SliceState> {
        self.state.slices.get(slice_id).map(|s| s.state)
    }
}
