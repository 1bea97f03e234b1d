//! The slice: a named, user-owned container of reservations.

use serde::{Deserialize, Serialize};

use crate::time::Term;

use super::states::{ReservationState, SliceState};
use super::{ReservationId, SliceId, SliceOwner};

/// A named, user-owned container of reservations.
///
/// The slice exclusively owns its reservations; closing the slice cascades
/// to every member. Member ids are kept in insertion order because the
/// kernel processes reservations of one slice in that order on every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    /// Slice identifier.
    pub id: SliceId,
    /// User-chosen name, unique per owner among non-dead slices.
    pub name: String,
    /// Requesting user and project.
    pub owner: SliceOwner,
    /// Lifecycle state, recomputed from member reservations.
    pub state: SliceState,
    /// Overall lease window of the slice.
    pub term: Term,
    /// Request graph backing this slice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_id: Option<String>,
    /// Member reservations in insertion order.
    #[serde(default)]
    pub reservations: Vec<ReservationId>,
    /// Cycle at which every member became terminal, for grace-period GC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_since: Option<u64>,
    /// Last state-change timestamp in epoch milliseconds.
    #[serde(default)]
    pub last_update_ms: i64,
}

impl Slice {
    /// Creates a nascent slice.
    #[must_use]
    pub fn new(name: impl Into<String>, owner: SliceOwner, term: Term) -> Self {
        Self {
            id: SliceId::generate(),
            name: name.into(),
            owner,
            state: SliceState::Nascent,
            term,
            graph_id: None,
            reservations: Vec::new(),
            terminal_since: None,
            last_update_ms: 0,
        }
    }

    /// Appends a member reservation, preserving insertion order.
    pub fn add_reservation(&mut self, id: ReservationId) {
        self.reservations.push(id);
    }

    /// Recomputes the slice state from member reservation states.
    ///
    /// The members are supplied by the caller in insertion order; the
    /// slice does not reach into the arena itself.
    pub fn recompute_state(&mut self, member_states: &[ReservationState], cycle: u64) {
        if matches!(self.state, SliceState::Dead) {
            return;
        }
        let next = Self::derive_state(self.state, member_states);
        if matches!(next, SliceState::Dead) && self.terminal_since.is_none() {
            self.terminal_since = Some(cycle);
        }
        if next != self.state {
            tracing::debug!(slice = %self.id, from = %self.state, to = %next, "slice transition");
            self.state = next;
        }
    }

    fn derive_state(current: SliceState, members: &[ReservationState]) -> SliceState {
        if members.is_empty() {
            return current;
        }
        let all_terminal = members.iter().all(ReservationState::is_terminal);
        let all_closed = members
            .iter()
            .all(|s| matches!(s, ReservationState::Closed));
        let any_failed = members.iter().any(|s| matches!(s, ReservationState::Failed));
        let any_active = members.iter().any(ReservationState::is_active);
        let all_active = members.iter().all(ReservationState::is_active);

        if all_terminal {
            // A slice only dies cleanly: every member closed, or the user
            // closed it after failures. Failures left standing keep the
            // slice visible in StableError for inspection.
            if all_closed || matches!(current, SliceState::Closing) {
                return SliceState::Dead;
            }
            return SliceState::StableError;
        }
        if matches!(current, SliceState::Closing) {
            return SliceState::Closing;
        }
        if any_failed {
            return SliceState::StableError;
        }
        if all_active {
            return SliceState::StableOk;
        }
        if any_active {
            return SliceState::ModifyingOk;
        }
        SliceState::Configuring
    }

    /// Marks the slice as closing; member closes cascade from the kernel.
    pub fn begin_close(&mut self) {
        if !self.state.is_dead() {
            self.state = SliceState::Closing;
        }
    }

    /// Returns `true` once the grace period after death has elapsed.
    #[must_use]
    pub fn reclaimable(&self, cycle: u64, grace_cycles: u64) -> bool {
        self.state.is_dead()
            && self
                .terminal_since
                .is_some_and(|since| cycle.saturating_sub(since) >= grace_cycles)
    }
}
