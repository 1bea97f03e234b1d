//! The static peer catalog.

use serde::{Deserialize, Serialize};

use super::ActorGuid;

/// Role an actor plays in the control framework.
///
/// All three roles run the same kernel; the role decides which message
/// kinds are legal and which policy module is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    /// User-facing embedder; builds slices and drives the ticket/redeem flow.
    Orchestrator,
    /// Cluster-wide aggregator; arbitrates tickets against the CBM calendar.
    Broker,
    /// Site-local owner; binds redeems and provisions substrate.
    Authority,
}

impl ActorRole {
    /// Returns the role as the identifier used in config.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Broker => "broker",
            Self::Authority => "authority",
        }
    }
}

impl std::fmt::Display for ActorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A known remote actor, loaded from config at init and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Peer {
    /// Remote actor guid.
    pub guid: ActorGuid,
    /// Remote actor role.
    pub role: ActorRole,
    /// Topic the remote actor consumes from.
    pub topic: String,
    /// Site the peer owns, authorities only; routes redeems.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    /// Delegation advertised to or claimed from this peer, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation: Option<String>,
}
