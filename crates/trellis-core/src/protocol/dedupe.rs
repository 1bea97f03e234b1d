//! Bounded message-id dedupe window.

use std::collections::{HashSet, VecDeque};

use uuid::Uuid;

/// Default number of message ids remembered.
pub const DEFAULT_DEDUPE_WINDOW: usize = 16_384;

/// Remembers recently seen message ids within a bounded window.
///
/// The transport is at-least-once, so the same `msg_id` may be delivered
/// more than once; a replay inside the window is dropped before it
/// reaches the kernel. Replays that outlive the window are handled by
/// idempotent re-processing keyed on reservation id.
#[derive(Debug)]
pub struct DedupeWindow {
    seen: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl DedupeWindow {
    /// Creates a window remembering up to `capacity` ids.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity.min(DEFAULT_DEDUPE_WINDOW)),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Records a message id; returns `true` if it was not seen before.
    pub fn observe(&mut self, msg_id: Uuid) -> bool {
        if self.seen.contains(&msg_id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(msg_id);
        self.seen.insert(msg_id);
        true
    }

    /// Number of ids currently remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` when no ids are remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for DedupeWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUPE_WINDOW)
    }
}
