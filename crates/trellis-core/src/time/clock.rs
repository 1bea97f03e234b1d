//! Conversions between wall milliseconds and logical cycles.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Clock configuration as loaded from the actor config.
///
/// With `manual` set, the cycle counter advances only when the harness
/// steps it; otherwise cycles track wall time from `start_time_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClockSettings {
    /// Wall-clock origin of cycle zero, in milliseconds since the epoch.
    #[serde(default)]
    pub start_time_ms: i64,
    /// Length of one cycle in milliseconds.
    #[serde(default = "default_cycle_millis")]
    pub cycle_millis: i64,
    /// First cycle number to emit.
    #[serde(default)]
    pub first_tick: u64,
    /// Manual stepping for test harnesses.
    #[serde(default)]
    pub manual: bool,
}

const fn default_cycle_millis() -> i64 {
    1000
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            start_time_ms: 0,
            cycle_millis: default_cycle_millis(),
            first_tick: 0,
            manual: false,
        }
    }
}

/// Maps wall milliseconds onto logical cycles and back.
///
/// Each actor can have its own notion of how long a cycle is and when time
/// starts; correctness does not depend on the choice. Leases occupy the
/// half-open interval `[start, end)`: the first millisecond of the start
/// cycle through the last millisecond before the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorClock {
    beginning_of_time_ms: i64,
    cycle_millis: i64,
}

impl ActorClock {
    /// Creates a clock with the given origin and cycle length.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Time`] if the origin is negative or the cycle
    /// length is not positive.
    pub fn new(beginning_of_time_ms: i64, cycle_millis: i64) -> Result<Self> {
        if beginning_of_time_ms < 0 || cycle_millis < 1 {
            return Err(CoreError::Time(format!(
                "invalid clock arguments: origin={beginning_of_time_ms} cycle_millis={cycle_millis}"
            )));
        }
        Ok(Self {
            beginning_of_time_ms,
            cycle_millis,
        })
    }

    /// Builds a clock from config settings.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Time`] for invalid settings.
    pub fn from_settings(settings: &ClockSettings) -> Result<Self> {
        Self::new(settings.start_time_ms, settings.cycle_millis)
    }

    /// Returns the wall-clock origin in milliseconds.
    #[must_use]
    pub const fn beginning_of_time_ms(&self) -> i64 {
        self.beginning_of_time_ms
    }

    /// Returns the cycle length in milliseconds.
    #[must_use]
    pub const fn cycle_millis(&self) -> i64 {
        self.cycle_millis
    }

    /// Converts wall milliseconds to the cycle containing them.
    ///
    /// Milliseconds before the beginning of time map to cycle zero.
    #[must_use]
    pub fn cycle(&self, millis: i64) -> u64 {
        if millis <= self.beginning_of_time_ms {
            return 0;
        }
        let difference = millis - self.beginning_of_time_ms;
        u64::try_from(difference / self.cycle_millis).unwrap_or(0)
    }

    /// Converts a UTC timestamp to the cycle containing it.
    #[must_use]
    pub fn cycle_at(&self, when: DateTime<Utc>) -> u64 {
        self.cycle(when.timestamp_millis())
    }

    /// Returns the first millisecond of the given cycle.
    #[must_use]
    pub fn cycle_start_ms(&self, cycle: u64) -> i64 {
        self.beginning_of_time_ms + i64::try_from(cycle).unwrap_or(i64::MAX) * self.cycle_millis
    }

    /// Returns the first millisecond after the given cycle.
    #[must_use]
    pub fn cycle_end_ms(&self, cycle: u64) -> i64 {
        self.cycle_start_ms(cycle) + self.cycle_millis
    }

    /// Converts a cycle to the UTC timestamp of its first millisecond.
    #[must_use]
    pub fn date(&self, cycle: u64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.cycle_start_ms(cycle))
            .single()
            .unwrap_or_default()
    }

    /// Returns the number of whole cycles spanned by a millisecond count.
    #[must_use]
    pub fn convert_millis(&self, millis: i64) -> u64 {
        if millis < 0 {
            return 0;
        }
        u64::try_from(millis / self.cycle_millis).unwrap_or(0)
    }
}
