//! Delegations: signed statements of who may arbitrate which substrate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::states::DelegationState;
use super::{ActorGuid, Capacities, DelegationId};

/// Capacity and label grant for one graph node within a delegation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDelegation {
    /// Delegated capacities on the node.
    pub capacities: Capacities,
    /// VLAN tags delegated on the node's connection points.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vlans: Vec<u16>,
}

/// A statement from an authority that a named broker may arbitrate a
/// subset of that authority's substrate.
///
/// The capacities a broker may grant for a node are bounded by the sum of
/// all `Delegated` delegations covering that node, minus the capacities
/// held by active reservations on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    /// Delegation identifier.
    pub id: DelegationId,
    /// Granting actor.
    pub source: ActorGuid,
    /// Receiving actor.
    pub target: ActorGuid,
    /// Graph whose nodes are covered (an ARM id at the source).
    pub graph_id: String,
    /// Site the delegated substrate belongs to.
    pub site: String,
    /// Lifecycle state.
    pub state: DelegationState,
    /// Per-node grants, keyed by graph node id.
    pub nodes: BTreeMap<String, NodeDelegation>,
}

impl Delegation {
    /// Creates a nascent delegation covering the given nodes.
    #[must_use]
    pub fn new(
        source: ActorGuid,
        target: ActorGuid,
        graph_id: impl Into<String>,
        site: impl Into<String>,
        nodes: BTreeMap<String, NodeDelegation>,
    ) -> Self {
        Self {
            id: DelegationId::generate(),
            source,
            target,
            graph_id: graph_id.into(),
            site: site.into(),
            state: DelegationState::Nascent,
            nodes,
        }
    }

    /// Returns the delegated capacities for a node, when covered and the
    /// delegation is in `Delegated` state.
    #[must_use]
    pub fn delegated_for(&self, node_id: &str) -> Option<&NodeDelegation> {
        if !matches!(self.state, DelegationState::Delegated) {
            return None;
        }
        self.nodes.get(node_id)
    }

    /// Returns `true` if the delegation covers the node at all.
    #[must_use]
    pub fn covers(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }
}
