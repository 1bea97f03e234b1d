//! Authority calendar policy: verify, bind, and schedule provisioning.

use tracing::{debug, warn};

use crate::error::{ErrorKind, LastError, Result};
use crate::model::Reservation;

use super::{Policy, PolicyContext, PolicyOutcome};

/// The authority-side policy.
///
/// A redeem arrives already annotated by the broker; the authority
/// re-verifies the claim against its own ARM view before committing
/// substrate. Oversubscription can make the broker's promise stale by
/// the time the redeem lands, so the late conflict check here is the
/// last line of defense.
#[derive(Debug, Default)]
pub struct AuthorityCalendarPolicy;

impl AuthorityCalendarPolicy {
    /// Creates the policy.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Policy for AuthorityCalendarPolicy {
    fn name(&self) -> &'static str {
        "authority-calendar"
    }

    fn bind_redeem(
        &mut self,
        reservation: &mut Reservation,
        ctx: &mut PolicyContext<'_>,
    ) -> Result<PolicyOutcome> {
        let Some(map) = reservation.node_map.clone() else {
            return Ok(PolicyOutcome::Denied(LastError::new(
                ErrorKind::InvalidRequest,
                "redeem carries no node binding",
            )));
        };
        if !ctx.graph.owns(&map.node_id) {
            return Ok(PolicyOutcome::Denied(LastError::new(
                ErrorKind::InvalidRequest,
                format!("node {} is not owned by this authority", map.node_id),
            )));
        }
        let Some(approved) = reservation.approved else {
            return Ok(PolicyOutcome::Denied(LastError::new(
                ErrorKind::InvalidRequest,
                "redeem carries no approved capacities",
            )));
        };
        if !approved.fits_within(&reservation.requested) {
            return Ok(PolicyOutcome::Denied(LastError::new(
                ErrorKind::InvalidRequest,
                "approved capacities exceed the request",
            )));
        }

        let term = reservation.effective_term();
        let available = ctx
            .available_on(&map.node_id, term.start_ms, term.end_ms, &reservation.id)
            .unwrap_or_default();
        if !approved.fits_within(&available) {
            // A late conflict: the broker promised capacity this site no
            // longer has.
            warn!(
                reservation = %reservation.id,
                node = %map.node_id,
                "late conflict on redeem"
            );
            return Ok(PolicyOutcome::Denied(LastError::new(
                ErrorKind::InsufficientResources,
                format!("node {} no longer has {approved}", map.node_id),
            )));
        }

        ctx.calendar
            .add_holding(&map.node_id, reservation.id.clone(), term.start_ms, term.end_ms);
        let due = term.start_cycle(ctx.clock);
        debug!(reservation = %reservation.id, node = %map.node_id, due, "redeem bound");
        Ok(PolicyOutcome::Bound { due })
    }

    fn extend(
        &mut self,
        reservation: &mut Reservation,
        new_end_ms: i64,
        ctx: &mut PolicyContext<'_>,
    ) -> Result<PolicyOutcome> {
        let Some(map) = reservation.node_map.clone() else {
            return Ok(PolicyOutcome::Denied(LastError::new(
                ErrorKind::InvalidRequest,
                "cannot extend an unbound lease",
            )));
        };
        let current = reservation.effective_term();
        let extended = match current.extended_to(new_end_ms) {
            Ok(term) => term,
            Err(err) => {
                return Ok(PolicyOutcome::Denied(LastError::new(
                    ErrorKind::InvalidRequest,
                    err.to_string(),
                )))
            }
        };
        let needed = reservation.effective_capacities();
        let available = ctx
            .available_on(
                &map.node_id,
                extended.new_start_ms,
                extended.end_ms,
                &reservation.id,
            )
            .unwrap_or_default();
        if !needed.fits_within(&available) {
            return Ok(PolicyOutcome::Denied(LastError::new(
                ErrorKind::InsufficientResources,
                format!("node {} cannot carry {needed} past lease end", map.node_id),
            )));
        }

        reservation.approved_term = Some(extended);
        ctx.calendar.add_holding(
            &map.node_id,
            reservation.id.clone(),
            extended.start_ms,
            extended.end_ms,
        );
        debug!(reservation = %reservation.id, term = %extended, "lease extension bound");
        Ok(PolicyOutcome::Granted)
    }
}
