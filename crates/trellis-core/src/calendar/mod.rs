//! The per-actor calendar: time- and slice-indexed reservation views.
//!
//! # Architecture
//!
//! ```text
//! ActorCalendar
//!     ├── pending    cycle -> reservations to re-examine
//!     ├── redeeming  cycle -> reservations awaiting their lease start
//!     ├── renewing   cycle -> reservations entering the renewal window
//!     ├── closing    cycle -> reservations at or past lease end
//!     └── holdings   node  -> time-ordered committed intervals
//! ```
//!
//! The calendar is an indexing view over the actor's reservations, not a
//! second store: every bucket holds ids, and the kernel resolves them in
//! the arena when a cycle comes due. Intervals are half-open `[start, end)`
//! with the lease end exclusive.

mod holdings;


pub use holdings::{HoldingEntry, Holdings};

use std::collections::{BTreeMap, BTreeSet};

use crate::model::ReservationId;

/// Buckets a reservation can sit in while waiting for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    /// Re-examine at the due cycle.
    Pending,
    /// Start the handler at the lease-start cycle.
    Redeeming,
    /// Consider issuing a renewal at the due cycle.
    Renewing,
    /// Tear down at or past the lease-end cycle.
    Closing,
}

type CycleIndex = BTreeMap<u64, BTreeSet<ReservationId>>;

/// The per-actor calendar.
#[derive(Debug, Default, Clone)]
pub struct ActorCalendar {
    pending: CycleIndex,
    redeeming: CycleIndex,
    renewing: CycleIndex,
    closing: CycleIndex,
    holdings: Holdings,
}

impl ActorCalendar {
    /// Creates an empty calendar.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a reservation for re-examination at `due`.
    pub fn add_pending(&mut self, reservation: ReservationId, due: u64) {
        Self::index_add(&mut self.pending, reservation, due);
    }

    /// Schedules a reservation for handler start at its lease-start cycle.
    pub fn add_redeeming(&mut self, reservation: ReservationId, due: u64) {
        Self::index_add(&mut self.redeeming, reservation, due);
    }

    /// Schedules a reservation for renewal consideration at `due`.
    pub fn add_renewing(&mut self, reservation: ReservationId, due: u64) {
        Self::index_add(&mut self.renewing, reservation, due);
    }

    /// Schedules a reservation for teardown at its lease-end cycle.
    pub fn add_closing(&mut self, reservation: ReservationId, due: u64) {
        Self::index_add(&mut self.closing, reservation, due);
    }

    /// Records a capacity holding of `[start, end)` on a node.
    pub fn add_holding(
        &mut self,
        node_id: &str,
        reservation: ReservationId,
        start_ms: i64,
        end_ms: i64,
    ) {
        self.holdings.add(node_id, reservation, start_ms, end_ms);
    }

    /// Drops a reservation's holding from a node.
    pub fn remove_holding(&mut self, node_id: &str, reservation: &ReservationId) {
        self.holdings.remove(node_id, reservation);
    }

    /// Read access to the holdings index.
    #[must_use]
    pub const fn holdings(&self) -> &Holdings {
        &self.holdings
    }

    /// Drains the reservations due in `bucket` at or before `cycle`.
    ///
    /// Ids are returned in deterministic order: ascending due cycle, then
    /// reservation-id order within a cycle.
    pub fn due_before(&mut self, bucket: Bucket, cycle: u64) -> Vec<ReservationId> {
        let index = self.index_mut(bucket);
        let mut due = Vec::new();
        let keys: Vec<u64> = index.range(..=cycle).map(|(k, _)| *k).collect();
        for key in keys {
            if let Some(set) = index.remove(&key) {
                due.extend(set);
            }
        }
        due
    }

    /// Next due cycle in `bucket`, if any.
    #[must_use]
    pub fn next_due(&self, bucket: Bucket) -> Option<u64> {
        self.index(bucket).keys().next().copied()
    }

    /// Removes a reservation from every bucket and every node's holdings.
    ///
    /// Called when a reservation reaches a terminal state or its slice is
    /// closed; pending work for the slice is dropped wholesale.
    pub fn remove_reservation(&mut self, reservation: &ReservationId) {
        for index in [
            &mut self.pending,
            &mut self.redeeming,
            &mut self.renewing,
            &mut self.closing,
        ] {
            index.values_mut().for_each(|set| {
                set.remove(reservation);
            });
            index.retain(|_, set| !set.is_empty());
        }
        self.holdings.remove_everywhere(reservation);
    }

    fn index(&self, bucket: Bucket) -> &CycleIndex {
        match bucket {
            Bucket::Pending => &self.pending,
            Bucket::Redeeming => &self.redeeming,
            Bucket::Renewing => &self.renewing,
            Bucket::Closing => &self.closing,
        }
    }

    fn index_mut(&mut self, bucket: Bucket) -> &mut CycleIndex {
        match bucket {
            Bucket::Pending => &mut self.pending,
            Bucket::Redeeming => &mut self.redeeming,
            Bucket::Renewing => &mut self.renewing,
            Bucket::Closing => &mut self.closing,
        }
    }

    fn index_add(index: &mut CycleIndex, reservation: ReservationId, due: u64) {
        index.entry(due).or_default().insert(reservation);
    }
}
