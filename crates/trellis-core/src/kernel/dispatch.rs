//! Inbound message dispatch.
//!
//! Every message passes the dedupe window, the role legality table, and
//! the decision point before it can touch state. Replays inside the
//! dedupe window are dropped; replays beyond it re-enter the per-kind
//! handlers, which are idempotent keyed on reservation id.

use tracing::{debug, warn};

use crate::authz::{AuthAction, AuthResource};
use crate::error::{CoreError, ErrorKind, LastError, Result};
use crate::graph::{BqmNode, BrokerQueryModel};
use crate::model::{
    ActorRole, Delegation, DelegationId, DelegationState, PendingState, Reservation,
    ReservationId, ReservationState, Slice, SliceState,
};
use crate::policy::{OrchestratorReviewPolicy, PolicyOutcome};
use crate::protocol::{Envelope, MessageKind, OperationStatus, SliceInfo, role_accepts};
use crate::time::Term;

use super::events::{PendingRpc, ProvisionKind, ProvisionRequest};
use super::{Kernel, PROP_CALLBACK_TOPIC};

impl Kernel {
    pub(crate) fn handle_message(&mut self, envelope: Envelope) -> Result<()> {
        if !self.dedupe.observe(envelope.msg_id) {
            debug!(msg = %envelope.msg_id, "duplicate message dropped");
            return Ok(());
        }
        // A reply settles its request before anything else happens, so a
        // late reply and the deadline scan cannot both fire.
        let resolved = envelope
            .correlation_id
            .and_then(|c| self.pending_rpcs.remove(&c));

        if !role_accepts(self.role, &envelope.kind) {
            warn!(
                role = %self.role,
                kind = envelope.kind.name(),
                "message kind not legal for this role, dropped"
            );
            return Ok(());
        }
        if let Some(denied) = self.authorize(&envelope) {
            self.reject(&envelope, denied);
            return Ok(());
        }

        match envelope.kind.clone() {
            MessageKind::Ticket {
                slice,
                reservations,
            } => self.on_ticket(&envelope, slice, reservations),
            MessageKind::UpdateTicket {
                reservation,
                status,
            } => self.on_update_ticket(*reservation, &status),
            MessageKind::Redeem { slice, reservation } => {
                self.on_redeem(&envelope, slice, *reservation)
            }
            MessageKind::UpdateLease {
                reservation,
                status,
            } => match self.role {
                ActorRole::Orchestrator => self.on_update_lease_orchestrator(*reservation, &status),
                ActorRole::Broker => self.on_update_lease_broker(&reservation, &status),
                ActorRole::Authority => Ok(()),
            },
            MessageKind::ExtendTicket {
                reservation_id,
                new_end_ms,
            } => self.on_extend_ticket(&envelope, &reservation_id, new_end_ms),
            MessageKind::ExtendLease {
                reservation_id,
                term,
            } => self.on_extend_lease(&envelope, &reservation_id, term),
            MessageKind::Close { reservation_id } => self.on_close_remote(&reservation_id),
            MessageKind::Claim { delegation_id } => self.on_claim(&envelope, &delegation_id),
            MessageKind::Reclaim { delegation_id } => self.on_reclaim(&envelope, &delegation_id),
            MessageKind::Query { level } => {
                self.on_query(&envelope, level);
                Ok(())
            }
            MessageKind::QueryResponse { payload, error } => {
                self.on_query_response(resolved, &payload, error);
                Ok(())
            }
            MessageKind::Probe => {
                if envelope.correlation_id.is_none() {
                    let reply = Envelope::reply_to(
                        &envelope,
                        self.guid.clone(),
                        self.topic.clone(),
                        MessageKind::Probe,
                    );
                    self.send(envelope.callback_topic.clone(), reply);
                }
                Ok(())
            }
        }
    }

    /// Maps a message onto a decision request; `None` means allowed.
    fn authorize(&self, envelope: &Envelope) -> Option<String> {
        use MessageKind as K;
        let (action, resource) = match &envelope.kind {
            K::Ticket { .. } => (AuthAction::Ticket, AuthResource::Sliver),
            K::Redeem { .. } => (AuthAction::Demand, AuthResource::Sliver),
            K::ExtendTicket { .. } | K::ExtendLease { .. } => {
                (AuthAction::Update, AuthResource::Sliver)
            }
            K::Close { .. } => (AuthAction::Close, AuthResource::Sliver),
            K::Claim { .. } => (AuthAction::Claim, AuthResource::Delegation),
            K::Reclaim { .. } => (AuthAction::Reclaim, AuthResource::Delegation),
            K::Query { .. } => (AuthAction::Query, AuthResource::Resources),
            // Replies and probes are peer traffic, not user commands.
            _ => return None,
        };
        let decision = self
            .authz
            .decide(action, resource, envelope.auth_token.as_deref());
        if decision.allowed {
            None
        } else {
            Some(decision.message)
        }
    }

    /// Applies a guarded transition; an edge the guards should have made
    /// impossible fails the reservation instead of losing it.
    fn transition_or_fail(reservation: &mut Reservation, to: ReservationState) {
        if let Err(err) = reservation.transition(to) {
            reservation.fail(LastError::new(ErrorKind::Internal, err.to_string()));
        }
    }

    /// Rejects a denied command without mutating any state.
    fn reject(&mut self, envelope: &Envelope, message: String) {
        warn!(kind = envelope.kind.name(), %message, "command denied");
        let error = LastError::new(ErrorKind::Unauthorized, message);
        let reply_kind = match &envelope.kind {
            MessageKind::Ticket { reservations, .. } => {
                reservations.first().cloned().map(|mut r| {
                    r.last_error = Some(error.clone());
                    MessageKind::UpdateTicket {
                        reservation: Box::new(r),
                        status: OperationStatus::failed(error.clone()),
                    }
                })
            }
            MessageKind::Redeem { reservation, .. } => {
                let mut r = reservation.clone();
                r.last_error = Some(error.clone());
                Some(MessageKind::UpdateLease {
                    reservation: r,
                    status: OperationStatus::failed(error.clone()),
                })
            }
            MessageKind::Claim { .. }
            | MessageKind::Reclaim { .. }
            | MessageKind::Query { .. } => Some(MessageKind::QueryResponse {
                payload: serde_json::Value::Null,
                error: Some(error.clone()),
            }),
            _ => None,
        };
        if let Some(kind) = reply_kind {
            let reply = Envelope::reply_to(envelope, self.guid.clone(), self.topic.clone(), kind);
            self.send(envelope.callback_topic.clone(), reply);
        }
    }

    // =========================================================================
    // Broker inbound
    // =========================================================================

    fn on_ticket(
        &mut self,
        envelope: &Envelope,
        slice: SliceInfo,
        reservations: Vec<Reservation>,
    ) -> Result<()> {
        self.adopt_slice(&slice);
        for reservation in reservations {
            let rid = reservation.id.clone();

            // Idempotent replay: an already-arbitrated reservation gets
            // its original answer again.
            if let Some(existing) = self.state.reservations.get(&rid) {
                if existing.state.is_ticketed() || existing.is_terminal() {
                    let status = if existing.state == ReservationState::Failed {
                        OperationStatus::failed(existing.last_error.clone().unwrap_or_else(
                            || LastError::new(ErrorKind::InsufficientResources, "refused"),
                        ))
                    } else {
                        OperationStatus::success()
                    };
                    let reply = Envelope::reply_to(
                        envelope,
                        self.guid.clone(),
                        self.topic.clone(),
                        MessageKind::UpdateTicket {
                            reservation: Box::new(existing.clone()),
                            status,
                        },
                    );
                    self.send(envelope.callback_topic.clone(), reply);
                    continue;
                }
            }

            self.adopt_reservation(reservation);
            let mut reservation = self.take_reservation(&rid)?;
            let (policy, mut ctx) = self.split_policy();
            let outcome = policy.allocate_ticket(&mut reservation, &mut ctx)?;
            let status = match outcome {
                PolicyOutcome::Granted => {
                    reservation.pending = PendingState::None;
                    match reservation.transition(ReservationState::Ticketed) {
                        Ok(()) => {
                            let end = reservation.effective_term().end_cycle(&self.clock);
                            self.calendar.add_closing(rid.clone(), end);
                            OperationStatus::success()
                        }
                        Err(err) => {
                            let error = LastError::new(ErrorKind::Internal, err.to_string());
                            reservation.fail(error.clone());
                            OperationStatus::failed(error)
                        }
                    }
                }
                PolicyOutcome::Bound { .. } => {
                    let error = LastError::new(
                        ErrorKind::Internal,
                        "broker policy returned a bind outcome",
                    );
                    reservation.fail(error.clone());
                    OperationStatus::failed(error)
                }
                PolicyOutcome::Denied(error) => {
                    reservation.fail(error.clone());
                    OperationStatus::failed(error)
                }
            };
            let reply = Envelope::reply_to(
                envelope,
                self.guid.clone(),
                self.topic.clone(),
                MessageKind::UpdateTicket {
                    reservation: Box::new(reservation.clone()),
                    status,
                },
            );
            self.put_back(reservation);
            self.send(envelope.callback_topic.clone(), reply);
        }
        Ok(())
    }

    fn on_extend_ticket(
        &mut self,
        envelope: &Envelope,
        rid: &ReservationId,
        new_end_ms: i64,
    ) -> Result<()> {
        let Ok(mut reservation) = self.take_reservation(rid) else {
            warn!(reservation = %rid, "extend for unknown reservation dropped");
            return Ok(());
        };
        let (policy, mut ctx) = self.split_policy();
        let outcome = policy.extend(&mut reservation, new_end_ms, &mut ctx)?;
        let status = match outcome {
            PolicyOutcome::Granted => {
                let end = reservation.effective_term().end_cycle(&self.clock);
                self.calendar.add_closing(rid.clone(), end);
                OperationStatus::success()
            }
            // The original grant stands when an extension is refused.
            PolicyOutcome::Denied(error) => OperationStatus::failed(error),
            PolicyOutcome::Bound { .. } => OperationStatus::failed(LastError::new(
                ErrorKind::Internal,
                "broker policy returned a bind outcome",
            )),
        };
        let reply = Envelope::reply_to(
            envelope,
            self.guid.clone(),
            self.topic.clone(),
            MessageKind::UpdateTicket {
                reservation: Box::new(reservation.clone()),
                status,
            },
        );
        self.put_back(reservation);
        self.send(envelope.callback_topic.clone(), reply);
        Ok(())
    }

    fn on_update_lease_broker(
        &mut self,
        incoming: &Reservation,
        status: &OperationStatus,
    ) -> Result<()> {
        let rid = incoming.id.clone();
        let Some(local) = self.state.reservations.get_mut(&rid) else {
            return Ok(());
        };
        if !status.ok || incoming.state == ReservationState::Failed {
            local.fail(
                status
                    .error
                    .clone()
                    .unwrap_or_else(|| LastError::new(ErrorKind::HandlerFailure, "lease failed")),
            );
            self.release_reservation(&rid);
            return Ok(());
        }
        match incoming.state {
            ReservationState::Closed => {
                local.pending = PendingState::None;
                let _ = match local.state {
                    ReservationState::Active | ReservationState::ActiveTicketed => local
                        .transition(ReservationState::CloseWait)
                        .and_then(|()| local.transition(ReservationState::Closed)),
                    _ => local.transition(ReservationState::Closed),
                };
                self.release_reservation(&rid);
            }
            ReservationState::Active => {
                if local.state == ReservationState::Ticketed {
                    local.transition(ReservationState::Active)?;
                }
                self.state.mark_dirty(&rid);
            }
            _ => {}
        }
        Ok(())
    }

    fn on_reclaim(&mut self, envelope: &Envelope, delegation_id: &DelegationId) -> Result<()> {
        let Some(delegation) = self.state.delegations.get(delegation_id) else {
            self.reply_query_error(envelope, ErrorKind::InvalidRequest, "unknown delegation");
            return Ok(());
        };
        // A delegation with live reservations on its nodes cannot move.
        let in_use = self.state.reservations.values().any(|r| {
            !r.is_terminal()
                && r.node_map
                    .as_ref()
                    .is_some_and(|m| delegation.covers(&m.node_id))
        });
        if in_use {
            self.reply_query_error(
                envelope,
                ErrorKind::InvalidRequest,
                "delegation has active reservations",
            );
            return Ok(());
        }
        let mut delegation = delegation.clone();
        delegation.state = DelegationState::Reclaimed;
        self.store.upsert_delegation(&delegation)?;
        let payload = serde_json::to_value(&delegation)?;
        self.state
            .delegations
            .insert(delegation_id.clone(), delegation);
        let reply = Envelope::reply_to(
            envelope,
            self.guid.clone(),
            self.topic.clone(),
            MessageKind::QueryResponse {
                payload,
                error: None,
            },
        );
        self.send(envelope.callback_topic.clone(), reply);
        Ok(())
    }

    fn on_query(&mut self, envelope: &Envelope, level: u8) {
        let now_ms = self.clock.cycle_start_ms(self.cycle);
        let nobody = ReservationId::from_string("");
        let mut nodes = Vec::new();
        let node_ids: Vec<String> = self.graph.nodes.keys().cloned().collect();
        for node_id in node_ids {
            let (_, ctx) = self.split_policy();
            let Some(delegated) = ctx.delegated_capacity(&node_id) else {
                continue;
            };
            let available =
                delegated.minus_saturating(&ctx.committed_on(&node_id, now_ms, now_ms + 1, &nobody));
            let holdings = (level >= 2)
                .then(|| u32::try_from(ctx.calendar.holdings().count_on(&node_id)).unwrap_or(0));
            let Some((name, site, rtype)) = ctx
                .graph
                .node(&node_id)
                .map(|n| (n.name.clone(), n.site.clone(), n.rtype))
            else {
                continue;
            };
            nodes.push(BqmNode {
                node_id,
                name,
                site,
                rtype,
                delegated,
                available,
                holdings,
            });
        }
        let listing = BrokerQueryModel { nodes };
        let payload = serde_json::to_value(&listing).unwrap_or(serde_json::Value::Null);
        let reply = Envelope::reply_to(
            envelope,
            self.guid.clone(),
            self.topic.clone(),
            MessageKind::QueryResponse {
                payload,
                error: None,
            },
        );
        self.send(envelope.callback_topic.clone(), reply);
    }

    // =========================================================================
    // Authority inbound
    // =========================================================================

    fn on_redeem(
        &mut self,
        envelope: &Envelope,
        slice: SliceInfo,
        reservation: Reservation,
    ) -> Result<()> {
        let rid = reservation.id.clone();

        // Idempotent replay of an already-bound redeem.
        if let Some(existing) = self.state.reservations.get(&rid) {
            if existing.pending == PendingState::Priming || existing.state.is_active() {
                return Ok(());
            }
        }

        self.adopt_slice(&slice);
        let mut reservation = reservation;
        reservation
            .properties
            .insert(PROP_CALLBACK_TOPIC.to_string(), envelope.callback_topic.clone());
        self.adopt_reservation(reservation);

        let mut reservation = self.take_reservation(&rid)?;
        let (policy, mut ctx) = self.split_policy();
        let outcome = policy.bind_redeem(&mut reservation, &mut ctx)?;
        match outcome {
            PolicyOutcome::Bound { due } => {
                reservation.pending = PendingState::Priming;
                let end = reservation.effective_term().end_cycle(&self.clock);
                self.calendar.add_redeeming(rid.clone(), due);
                self.calendar.add_closing(rid.clone(), end);
                self.put_back(reservation);
            }
            PolicyOutcome::Denied(error) => {
                reservation.fail(error.clone());
                let snapshot = reservation.clone();
                self.put_back(reservation);
                self.emit_update_lease(&snapshot, OperationStatus::failed(error));
            }
            PolicyOutcome::Granted => {
                let error =
                    LastError::new(ErrorKind::Internal, "authority policy returned a grant");
                reservation.fail(error.clone());
                let snapshot = reservation.clone();
                self.put_back(reservation);
                self.emit_update_lease(&snapshot, OperationStatus::failed(error));
            }
        }
        Ok(())
    }

    fn on_extend_lease(
        &mut self,
        envelope: &Envelope,
        rid: &ReservationId,
        term: Term,
    ) -> Result<()> {
        let Ok(mut reservation) = self.take_reservation(rid) else {
            warn!(reservation = %rid, "extend lease for unknown reservation dropped");
            return Ok(());
        };
        let (policy, mut ctx) = self.split_policy();
        let outcome = policy.extend(&mut reservation, term.end_ms, &mut ctx)?;
        match outcome {
            PolicyOutcome::Granted => {
                reservation.pending = PendingState::ExtendingLease;
                Self::transition_or_fail(&mut reservation, ReservationState::ActiveTicketed);
                // Swap just before the running lease runs out.
                let swap = self
                    .clock
                    .cycle(reservation.effective_term().new_start_ms)
                    .saturating_sub(1);
                self.calendar.add_pending(rid.clone(), swap.max(self.cycle));
                self.put_back(reservation);
            }
            PolicyOutcome::Denied(error) => {
                // The running lease stands; only the extension failed.
                let snapshot = reservation.clone();
                self.put_back(reservation);
                let reply = Envelope::reply_to(
                    envelope,
                    self.guid.clone(),
                    self.topic.clone(),
                    MessageKind::UpdateLease {
                        reservation: Box::new(snapshot),
                        status: OperationStatus::failed(error),
                    },
                );
                self.send(envelope.callback_topic.clone(), reply);
            }
            PolicyOutcome::Bound { .. } => {
                warn!(reservation = %rid, "authority extend returned a bind outcome");
                self.put_back(reservation);
            }
        }
        Ok(())
    }

    fn on_close_remote(&mut self, rid: &ReservationId) -> Result<()> {
        match self.role {
            ActorRole::Broker => {
                let Ok(mut reservation) = self.take_reservation(rid) else {
                    return Ok(());
                };
                if reservation.is_terminal() {
                    self.put_back(reservation);
                    return Ok(());
                }
                reservation.pending = PendingState::None;
                let _ = match reservation.state {
                    ReservationState::Active | ReservationState::ActiveTicketed => reservation
                        .transition(ReservationState::CloseWait)
                        .and_then(|()| reservation.transition(ReservationState::Closed)),
                    _ => reservation.transition(ReservationState::Closed),
                };
                self.put_back(reservation);
                self.release_reservation(rid);
                Ok(())
            }
            ActorRole::Authority => {
                let Ok(mut reservation) = self.take_reservation(rid) else {
                    return Ok(());
                };
                if reservation.is_terminal()
                    || reservation.state == ReservationState::CloseWait
                {
                    self.put_back(reservation);
                    return Ok(());
                }
                let had_handler = reservation.state.is_active()
                    || reservation.pending == PendingState::Priming;
                reservation.pending = PendingState::Closing;
                if reservation.state == ReservationState::Nascent {
                    reservation.pending = PendingState::None;
                    Self::transition_or_fail(&mut reservation, ReservationState::Closed);
                    self.put_back(reservation);
                    self.release_reservation(rid);
                    return Ok(());
                }
                Self::transition_or_fail(&mut reservation, ReservationState::CloseWait);
                if had_handler {
                    self.provision.push(ProvisionRequest {
                        reservation: reservation.clone(),
                        kind: ProvisionKind::Teardown,
                    });
                    self.put_back(reservation);
                } else {
                    reservation.pending = PendingState::None;
                    Self::transition_or_fail(&mut reservation, ReservationState::Closed);
                    let snapshot = reservation.clone();
                    self.put_back(reservation);
                    self.release_reservation(rid);
                    self.emit_update_lease(&snapshot, OperationStatus::success());
                }
                Ok(())
            }
            ActorRole::Orchestrator => Ok(()),
        }
    }

    fn on_claim(&mut self, envelope: &Envelope, delegation_id: &DelegationId) -> Result<()> {
        let claimable = match self.state.delegations.get(delegation_id) {
            None => {
                self.reply_query_error(envelope, ErrorKind::InvalidRequest, "unknown delegation");
                return Ok(());
            }
            Some(delegation) => !matches!(
                delegation.state,
                DelegationState::Reclaimed | DelegationState::Closed
            ),
        };
        if !claimable {
            self.reply_query_error(envelope, ErrorKind::InvalidRequest, "delegation not claimable");
            return Ok(());
        }
        let Some(delegation) = self.state.delegations.get_mut(delegation_id) else {
            return Ok(());
        };
        delegation.state = DelegationState::Delegated;
        let delegation = delegation.clone();
        self.store.upsert_delegation(&delegation)?;
        let payload = serde_json::to_value(&delegation)?;
        let reply = Envelope::reply_to(
            envelope,
            self.guid.clone(),
            self.topic.clone(),
            MessageKind::QueryResponse {
                payload,
                error: None,
            },
        );
        self.send(envelope.callback_topic.clone(), reply);
        Ok(())
    }

    // =========================================================================
    // Orchestrator inbound
    // =========================================================================

    fn on_update_ticket(
        &mut self,
        incoming: Reservation,
        status: &OperationStatus,
    ) -> Result<()> {
        let rid = incoming.id.clone();
        let Ok(mut local) = self.take_reservation(&rid) else {
            return Ok(());
        };
        match local.pending {
            PendingState::Ticketing => {
                if status.ok {
                    local.approved = incoming.approved;
                    local.approved_term = incoming.approved_term;
                    local.node_map = incoming.node_map.clone();
                    local.assigned = incoming.assigned.clone();
                    local.interfaces = incoming.interfaces.clone();
                    for (key, value) in incoming.properties {
                        local.properties.entry(key).or_insert(value);
                    }
                    match OrchestratorReviewPolicy::review_ticket(&local) {
                        Ok(PolicyOutcome::Granted) => {
                            local.pending = PendingState::None;
                            Self::transition_or_fail(&mut local, ReservationState::Ticketed);
                        }
                        Ok(PolicyOutcome::Denied(error)) => local.fail(error),
                        Ok(PolicyOutcome::Bound { .. }) | Err(_) => local.fail(LastError::new(
                            ErrorKind::Internal,
                            "ticket review produced no verdict",
                        )),
                    }
                } else {
                    local.fail(status.error.clone().unwrap_or_else(|| {
                        LastError::new(ErrorKind::InsufficientResources, "ticket refused")
                    }));
                }
                self.put_back(local);
            }
            PendingState::ExtendingTicket => {
                if status.ok {
                    local.approved_term = incoming.approved_term;
                    local.pending = PendingState::ExtendingLease;
                    Self::transition_or_fail(&mut local, ReservationState::ActiveTicketed);
                    let term = local.effective_term();
                    let site = local.site.clone();
                    self.put_back(local);
                    let Some(topic) =
                        self.authority_for_site(&site).map(|p| p.topic.clone())
                    else {
                        return Err(CoreError::Internal(format!(
                            "no authority peer for site {site}"
                        )));
                    };
                    let envelope = Envelope::request(
                        self.guid.clone(),
                        self.topic.clone(),
                        MessageKind::ExtendLease {
                            reservation_id: rid.clone(),
                            term,
                        },
                    );
                    self.send_rpc(topic, envelope, Some(rid));
                } else {
                    // Extension refused; the running lease stands.
                    local.pending = PendingState::None;
                    local.last_error = status.error.clone();
                    self.put_back(local);
                }
            }
            _ => {
                debug!(reservation = %rid, "stale ticket update ignored");
                self.put_back(local);
            }
        }
        Ok(())
    }

    fn on_update_lease_orchestrator(
        &mut self,
        incoming: Reservation,
        status: &OperationStatus,
    ) -> Result<()> {
        let rid = incoming.id.clone();
        let Ok(mut local) = self.take_reservation(&rid) else {
            return Ok(());
        };
        if !status.ok {
            if matches!(
                local.pending,
                PendingState::ExtendingLease | PendingState::ExtendingTicket
            ) && local.state == ReservationState::ActiveTicketed
            {
                // Failed renewal: fall back to the running lease.
                local.pending = PendingState::None;
                local.last_error = status.error.clone();
                Self::transition_or_fail(&mut local, ReservationState::Active);
            } else {
                local.fail(status.error.clone().unwrap_or_else(|| {
                    LastError::new(ErrorKind::HandlerFailure, "lease failed")
                }));
                self.calendar.remove_reservation(&rid);
            }
            self.put_back(local);
            return Ok(());
        }
        match incoming.state {
            ReservationState::Active => {
                for (key, value) in incoming.properties {
                    local.properties.entry(key).or_insert(value);
                }
                match local.state {
                    ReservationState::Ticketed => {
                        local.pending = PendingState::None;
                        Self::transition_or_fail(&mut local, ReservationState::Active);
                    }
                    ReservationState::ActiveTicketed => {
                        local.term = incoming.term;
                        local.approved_term = incoming.approved_term.or(Some(incoming.term));
                        local.pending = PendingState::None;
                        Self::transition_or_fail(&mut local, ReservationState::Active);
                    }
                    _ => {}
                }
            }
            ReservationState::Closed => {
                local.pending = PendingState::None;
                let _ = match local.state {
                    ReservationState::Active | ReservationState::ActiveTicketed => local
                        .transition(ReservationState::CloseWait)
                        .and_then(|()| local.transition(ReservationState::Closed)),
                    _ => local.transition(ReservationState::Closed),
                };
                self.calendar.remove_reservation(&rid);
            }
            _ => {}
        }
        self.put_back(local);
        Ok(())
    }

    fn on_query_response(
        &mut self,
        resolved: Option<PendingRpc>,
        payload: &serde_json::Value,
        error: Option<LastError>,
    ) {
        let Some(rpc) = resolved else {
            debug!("uncorrelated query response ignored");
            return;
        };
        if let Some(error) = error {
            warn!(kind = rpc.envelope.kind.name(), error = %error, "request refused");
            return;
        }
        match rpc.envelope.kind {
            MessageKind::Claim { .. } => match serde_json::from_value::<Delegation>(payload.clone())
            {
                Ok(delegation) => {
                    debug!(delegation = %delegation.id, "delegation claimed");
                    if let Err(err) = self.register_delegation(delegation) {
                        warn!(error = %err, "claimed delegation could not be stored");
                    }
                }
                Err(err) => warn!(error = %err, "unreadable claim response"),
            },
            MessageKind::Reclaim { delegation_id } => {
                if let Some(delegation) = self.state.delegations.get_mut(&delegation_id) {
                    delegation.state = DelegationState::Reclaimed;
                    let delegation = delegation.clone();
                    if let Err(err) = self.store.upsert_delegation(&delegation) {
                        warn!(error = %err, "reclaimed delegation could not be stored");
                    }
                }
            }
            _ => {}
        }
    }

    // =========================================================================
    // Shared import helpers
    // =========================================================================

    /// Inserts a shadow slice for a remote request if none exists.
    fn adopt_slice(&mut self, info: &SliceInfo) {
        if self.state.slices.contains_key(&info.id) {
            return;
        }
        let term = Term::new(0, i64::MAX).unwrap_or_else(|_| Term {
            start_ms: 0,
            new_start_ms: 0,
            end_ms: i64::MAX,
        });
        let slice = Slice {
            id: info.id.clone(),
            name: info.name.clone(),
            owner: info.owner.clone(),
            state: SliceState::Configuring,
            term,
            graph_id: info.graph_id.clone(),
            reservations: Vec::new(),
            terminal_since: None,
            last_update_ms: self.clock.cycle_start_ms(self.cycle),
        };
        self.state.dirty_slices.insert(slice.id.clone());
        self.state.slices.insert(slice.id.clone(), slice);
    }

    /// Inserts a remote reservation, joining its shadow slice in arrival
    /// order.
    fn adopt_reservation(&mut self, reservation: Reservation) {
        if let Some(slice) = self.state.slices.get_mut(&reservation.slice_id) {
            if !slice.reservations.contains(&reservation.id) {
                slice.add_reservation(reservation.id.clone());
                self.state.dirty_slices.insert(slice.id.clone());
            }
        }
        self.state.dirty_reservations.insert(reservation.id.clone());
        self.state
            .reservations
            .insert(reservation.id.clone(), reservation);
    }

    fn reply_query_error(&mut self, envelope: &Envelope, kind: ErrorKind, message: &str) {
        let reply = Envelope::reply_to(
            envelope,
            self.guid.clone(),
            self.topic.clone(),
            MessageKind::QueryResponse {
                payload: serde_json::Value::Null,
                error: Some(LastError::new(kind, message)),
            },
        );
        self.send(envelope.callback_topic.clone(), reply);
    }
}
