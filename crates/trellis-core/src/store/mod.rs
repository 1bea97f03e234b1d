//! Durable reservation, slice, and delegation store.
//!
//! The kernel owns the store and flushes dirty entities in one
//! transaction per tick (`commit.batch.size` entities per statement
//! batch). Status queries from outside the kernel read a consistent
//! snapshot through their own connection, never live kernel memory.
//!
//! Rows carry both indexed columns for queries and a serde payload blob
//! that round-trips the full entity, so recovery rebuilds exactly the
//! state that was committed.

mod sqlite;

#[cfg(test)]
mod tests;

pub use sqlite::{SqliteStore, StoreStats};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Administrative record for a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRecord {
    /// Site identifier.
    pub id: String,
    /// Site name used in reservation requests.
    pub name: String,
    /// `true` while the site is under maintenance and closed to new
    /// allocations.
    pub maintenance: bool,
    /// Opaque administrative properties.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl SiteRecord {
    /// Creates an in-service site record.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            maintenance: false,
            properties: BTreeMap::new(),
        }
    }
}

/// A link row of a network-service reservation.
///
/// Rows are derived from the reservation's interface slivers on every
/// commit, one per attached substrate node; the properties blob carries
/// the labels and the peer mapping (`vlan`, `mac`, `peer_ifs`,
/// `peer_ns_id`, `burst_mbits`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    /// Substrate node the link attaches to.
    pub node_id: String,
    /// Network layer, `L2` or `L3`.
    pub layer: String,
    /// Link type, e.g. `L2Bridge`.
    pub link_type: String,
    /// Bandwidth in gigabits per second.
    pub bandwidth_gbps: u32,
    /// Labels and peer mapping of the interface behind this row.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}
