//! State enums and the reservation transition table.
//!
//! # Invariants
//!
//! - No reservation state is reached except via an edge in
//!   [`valid_transition`]; every mutation goes through
//!   [`Reservation::transition`](super::Reservation::transition).
//! - `Closed` and `Failed` are terminal.
//! - Pending sub-states are orthogonal to reservation states and mark an
//!   in-flight remote operation or a parked dependency wait.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    /// Accepted but not yet ticketed.
    Nascent,
    /// Holds a broker ticket.
    Ticketed,
    /// Lease is running on the substrate.
    Active,
    /// Holds a new ticket while the prior lease is still running.
    ActiveTicketed,
    /// Terminal: torn down and released.
    Closed,
    /// Teardown requested, waiting for the handler to finish.
    CloseWait,
    /// Terminal: refused, timed out, or broken.
    Failed,
    /// Recovered from an unreadable record; quarantined.
    Unknown,
}

impl ReservationState {
    /// Returns the state as a stable string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Nascent => "NASCENT",
            Self::Ticketed => "TICKETED",
            Self::Active => "ACTIVE",
            Self::ActiveTicketed => "ACTIVE_TICKETED",
            Self::Closed => "CLOSED",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Failed => "FAILED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Returns `true` for terminal states.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Returns `true` if the reservation holds a valid ticket.
    #[must_use]
    pub const fn is_ticketed(&self) -> bool {
        matches!(self, Self::Ticketed | Self::Active | Self::ActiveTicketed)
    }

    /// Returns `true` while a lease is running on the substrate.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::ActiveTicketed)
    }

    /// Ordering used by the dependency rule: a predecessor satisfies a
    /// target state when it is at or past it on the forward path.
    #[must_use]
    pub const fn at_or_past(&self, target: Self) -> bool {
        rank(*self) >= rank(target) && !self.is_terminal() || matches!((*self, target), (Self::Closed, Self::Closed))
    }
}

const fn rank(state: ReservationState) -> u8 {
    match state {
        ReservationState::Nascent | ReservationState::Unknown => 0,
        ReservationState::Ticketed => 1,
        ReservationState::Active | ReservationState::ActiveTicketed => 2,
        ReservationState::CloseWait => 3,
        ReservationState::Closed | ReservationState::Failed => 4,
    }
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns `true` if the edge `from -> to` appears in the transition table.
///
/// Self-edges are legal everywhere except out of terminal states; they
/// occur when a replayed message re-applies an already-processed result.
#[must_use]
pub const fn valid_transition(from: ReservationState, to: ReservationState) -> bool {
    use ReservationState as S;
    if from.is_terminal() {
        return false;
    }
    if (from as u8) == (to as u8) {
        return true;
    }
    matches!(
        (from, to),
        // Ticket path.
        (S::Nascent, S::Ticketed | S::Failed | S::Closed)
            // Redeem and provision path.
            | (S::Ticketed, S::Active | S::Failed | S::CloseWait | S::Closed)
            // Renewal path.
            | (S::Active, S::ActiveTicketed | S::CloseWait | S::Failed)
            | (S::ActiveTicketed, S::Active | S::CloseWait | S::Failed)
            // Teardown path.
            | (S::CloseWait, S::Closed | S::Failed)
            // Recovery quarantine can resolve anywhere.
            | (S::Unknown, _)
    )
}

/// In-flight operation marker, orthogonal to [`ReservationState`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PendingState {
    /// No operation in flight.
    #[default]
    None,
    /// Ticket request sent to a broker.
    Ticketing,
    /// Redeem sent to an authority.
    Redeeming,
    /// Ticket extension in flight.
    ExtendingTicket,
    /// Lease extension in flight.
    ExtendingLease,
    /// Close in flight.
    Closing,
    /// Handler provisioning in flight at the authority.
    Priming,
    /// Parked on unmet predecessors.
    Blocked,
    /// Parked before ticketing until predecessors are ticketed.
    BlockedTicket,
    /// Parked before redeeming until predecessors are ticketed.
    BlockedRedeem,
}

impl PendingState {
    /// Returns the sub-state as a stable string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Ticketing => "TICKETING",
            Self::Redeeming => "REDEEMING",
            Self::ExtendingTicket => "EXTENDING_TICKET",
            Self::ExtendingLease => "EXTENDING_LEASE",
            Self::Closing => "CLOSING",
            Self::Priming => "PRIMING",
            Self::Blocked => "BLOCKED",
            Self::BlockedTicket => "BLOCKED_TICKET",
            Self::BlockedRedeem => "BLOCKED_REDEEM",
        }
    }

    /// Returns `true` while a remote operation or handler is in flight.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::Ticketing
                | Self::Redeeming
                | Self::ExtendingTicket
                | Self::ExtendingLease
                | Self::Closing
                | Self::Priming
        )
    }

    /// Returns `true` while parked on predecessors.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked | Self::BlockedTicket | Self::BlockedRedeem)
    }
}

impl std::fmt::Display for PendingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a slice, recomputed from its member reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SliceState {
    /// Created, no reservations demanded yet.
    Nascent,
    /// Reservations are being ticketed and redeemed.
    Configuring,
    /// Every reservation is active.
    StableOk,
    /// Some reservations failed while others are active.
    StableError,
    /// A modify or extend is in flight on a stable slice.
    ModifyingOk,
    /// Close requested, teardown in progress.
    Closing,
    /// Every reservation is terminal; eligible for garbage collection.
    Dead,
}

impl SliceState {
    /// Returns the state as a stable string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Nascent => "NASCENT",
            Self::Configuring => "CONFIGURING",
            Self::StableOk => "STABLE_OK",
            Self::StableError => "STABLE_ERROR",
            Self::ModifyingOk => "MODIFYING_OK",
            Self::Closing => "CLOSING",
            Self::Dead => "DEAD",
        }
    }

    /// Returns `true` once the slice can be garbage collected.
    #[must_use]
    pub const fn is_dead(&self) -> bool {
        matches!(self, Self::Dead)
    }
}

impl std::fmt::Display for SliceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DelegationState {
    /// Advertised but not yet claimed by the target broker.
    Nascent,
    /// Claimed; the broker may arbitrate the delegated capacity.
    Delegated,
    /// Taken back by the granting authority.
    Reclaimed,
    /// Terminal.
    Closed,
}

impl DelegationState {
    /// Returns the state as a stable string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Nascent => "NASCENT",
            Self::Delegated => "DELEGATED",
            Self::Reclaimed => "RECLAIMED",
            Self::Closed => "CLOSED",
        }
    }
}

impl std::fmt::Display for DelegationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
