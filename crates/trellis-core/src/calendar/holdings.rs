//! Time-ordered capacity holdings per substrate node.

use std::collections::BTreeMap;

use crate::model::ReservationId;

/// One committed interval on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldingEntry {
    /// First millisecond of the holding.
    pub start_ms: i64,
    /// Exclusive end millisecond.
    pub end_ms: i64,
    /// Reservation holding the capacity.
    pub reservation_id: ReservationId,
}

/// The capacity intervals committed on each substrate graph node.
///
/// Entries are kept sorted by `(start, end, reservation)` so interval
/// queries scan a contiguous prefix and stop early. This is the hot path
/// for allocation: every first-fit candidate check runs one
/// [`Holdings::overlapping`] query per node.
#[derive(Debug, Default, Clone)]
pub struct Holdings {
    by_node: BTreeMap<String, Vec<HoldingEntry>>,
}

impl Holdings {
    /// Creates an empty holdings index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a holding of `[start, end)` on a node.
    ///
    /// Re-adding the same reservation on the same node replaces its
    /// interval, keeping the operation idempotent under replay.
    pub fn add(
        &mut self,
        node_id: &str,
        reservation_id: ReservationId,
        start_ms: i64,
        end_ms: i64,
    ) {
        let entries = self.by_node.entry(node_id.to_string()).or_default();
        entries.retain(|e| e.reservation_id != reservation_id);
        let entry = HoldingEntry {
            start_ms,
            end_ms,
            reservation_id,
        };
        let at = entries
            .binary_search_by(|probe| {
                (probe.start_ms, probe.end_ms, &probe.reservation_id).cmp(&(
                    entry.start_ms,
                    entry.end_ms,
                    &entry.reservation_id,
                ))
            })
            .unwrap_or_else(|i| i);
        entries.insert(at, entry);
    }

    /// Drops the reservation's holding from a node.
    pub fn remove(&mut self, node_id: &str, reservation_id: &ReservationId) {
        if let Some(entries) = self.by_node.get_mut(node_id) {
            entries.retain(|e| &e.reservation_id != reservation_id);
            if entries.is_empty() {
                self.by_node.remove(node_id);
            }
        }
    }

    /// Drops the reservation's holdings from every node.
    pub fn remove_everywhere(&mut self, reservation_id: &ReservationId) {
        self.by_node
            .values_mut()
            .for_each(|entries| entries.retain(|e| &e.reservation_id != reservation_id));
        self.by_node.retain(|_, entries| !entries.is_empty());
    }

    /// Reservations whose holding covers the instant `ms` on the node.
    #[must_use]
    pub fn at(&self, node_id: &str, ms: i64) -> Vec<ReservationId> {
        self.overlapping(node_id, ms, ms + 1)
    }

    /// Reservations whose holding overlaps `[start, end)` on the node.
    #[must_use]
    pub fn overlapping(&self, node_id: &str, start_ms: i64, end_ms: i64) -> Vec<ReservationId> {
        let Some(entries) = self.by_node.get(node_id) else {
            return Vec::new();
        };
        entries
            .iter()
            .take_while(|e| e.start_ms < end_ms)
            .filter(|e| e.end_ms > start_ms)
            .map(|e| e.reservation_id.clone())
            .collect()
    }

    /// Total number of holdings on a node.
    #[must_use]
    pub fn count_on(&self, node_id: &str) -> usize {
        self.by_node.get(node_id).map_or(0, Vec::len)
    }

    /// Total number of holdings across all nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_node.values().map(Vec::len).sum()
    }

    /// Returns `true` when no node has any holding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }

    /// Iterates the node ids carrying at least one holding.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.by_node.keys().map(String::as_str)
    }
}
