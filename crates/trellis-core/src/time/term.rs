//! Lease terms over half-open intervals.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

use super::ActorClock;

/// The validity window of a ticket or lease.
///
/// A term covers the half-open interval `[start, end)`; the end
/// millisecond is exclusive. For extended terms `start` is constant while
/// `new_start` and `end` move forward, so `new_start..end` is the window
/// of the latest extension and `start..end` the full history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    /// First millisecond of the original term.
    pub start_ms: i64,
    /// First millisecond of the latest extension.
    pub new_start_ms: i64,
    /// Exclusive end millisecond.
    pub end_ms: i64,
}

impl Term {
    /// Creates a term covering `[start, end)`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRequest`] for zero-length or inverted
    /// windows.
    pub fn new(start_ms: i64, end_ms: i64) -> Result<Self> {
        if end_ms <= start_ms {
            return Err(CoreError::InvalidRequest(format!(
                "lease end {end_ms} must be after lease start {start_ms}"
            )));
        }
        Ok(Self {
            start_ms,
            new_start_ms: start_ms,
            end_ms,
        })
    }

    /// Creates a term from UTC timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRequest`] for zero-length or inverted
    /// windows.
    pub fn from_dates(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        Self::new(start.timestamp_millis(), end.timestamp_millis())
    }

    /// Length of the latest extension window in milliseconds.
    #[must_use]
    pub const fn length_ms(&self) -> i64 {
        self.end_ms - self.new_start_ms
    }

    /// Length of the full `[start, end)` window in milliseconds.
    #[must_use]
    pub const fn full_length_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }

    /// Returns `true` if the term covers the given millisecond.
    #[must_use]
    pub const fn contains_ms(&self, ms: i64) -> bool {
        ms >= self.start_ms && ms < self.end_ms
    }

    /// Returns `true` if the term overlaps `[start, end)`.
    #[must_use]
    pub const fn overlaps(&self, start_ms: i64, end_ms: i64) -> bool {
        self.start_ms < end_ms && start_ms < self.end_ms
    }

    /// Returns `true` if `self` is a well-formed extension of `other`:
    /// same original start, a later end, and a new start inside the old
    /// window or exactly at its end.
    #[must_use]
    pub const fn extends(&self, other: &Term) -> bool {
        self.start_ms == other.start_ms
            && self.end_ms > other.end_ms
            && self.new_start_ms >= other.new_start_ms
            && self.new_start_ms <= other.end_ms
    }

    /// Builds the extension of this term ending at `end_ms`, with the new
    /// start at the old end.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRequest`] if the new end does not move
    /// forward.
    pub fn extended_to(&self, end_ms: i64) -> Result<Self> {
        if end_ms <= self.end_ms {
            return Err(CoreError::InvalidRequest(format!(
                "extension end {end_ms} must be after current end {}",
                self.end_ms
            )));
        }
        Ok(Self {
            start_ms: self.start_ms,
            new_start_ms: self.end_ms,
            end_ms,
        })
    }

    /// First cycle of the latest window under the given clock.
    #[must_use]
    pub fn start_cycle(&self, clock: &ActorClock) -> u64 {
        clock.cycle(self.new_start_ms)
    }

    /// First cycle at or past the exclusive end under the given clock.
    #[must_use]
    pub fn end_cycle(&self, clock: &ActorClock) -> u64 {
        clock.cycle(self.end_ms)
    }

    /// UTC timestamp of the term start.
    #[must_use]
    pub fn start_date(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.start_ms)
            .single()
            .unwrap_or_default()
    }

    /// UTC timestamp of the exclusive term end.
    #[must_use]
    pub fn end_date(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.end_ms)
            .single()
            .unwrap_or_default()
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{} .. {})",
            self.start_date().format("%Y-%m-%d %H:%M:%S"),
            self.end_date().format("%Y-%m-%d %H:%M:%S")
        )
    }
}
