//! Orchestrator ticket-review policy.

use tracing::debug;

use crate::error::{ErrorKind, LastError, Result};
use crate::model::Reservation;

use super::{Policy, PolicyContext, PolicyOutcome};

/// The orchestrator-side policy.
///
/// The orchestrator never allocates substrate itself; it reviews the
/// terms a broker returned before redeeming them, enforcing that the
/// grant stays within what the user asked for.
#[derive(Debug, Default)]
pub struct OrchestratorReviewPolicy;

impl OrchestratorReviewPolicy {
    /// Creates the policy.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Reviews a returned ticket before it is redeemed.
    ///
    /// # Errors
    ///
    /// Never fails; refusals are reported through
    /// [`PolicyOutcome::Denied`].
    pub fn review_ticket(reservation: &Reservation) -> Result<PolicyOutcome> {
        let Some(approved) = reservation.approved else {
            return Ok(PolicyOutcome::Denied(LastError::new(
                ErrorKind::Internal,
                "granted ticket carries no approved capacities",
            )));
        };
        if !approved.fits_within(&reservation.requested) {
            return Ok(PolicyOutcome::Denied(LastError::new(
                ErrorKind::Internal,
                format!(
                    "broker approved {approved} beyond the requested {}",
                    reservation.requested
                ),
            )));
        }
        if reservation.node_map.is_none() {
            return Ok(PolicyOutcome::Denied(LastError::new(
                ErrorKind::Internal,
                "granted ticket carries no node binding",
            )));
        }
        debug!(reservation = %reservation.id, "ticket reviewed");
        Ok(PolicyOutcome::Granted)
    }
}

impl Policy for OrchestratorReviewPolicy {
    fn name(&self) -> &'static str {
        "orchestrator-ticket-review"
    }

    fn allocate_ticket(
        &mut self,
        reservation: &mut Reservation,
        _ctx: &mut PolicyContext<'_>,
    ) -> Result<PolicyOutcome> {
        Self::review_ticket(reservation)
    }
}
