//! Queryable substrate and request graph models.
//!
//! The full graph information-model library is an external collaborator;
//! this module defines the shapes the core actually queries, with an
//! in-memory implementation used by the daemon's loader and by tests.
//!
//! - [`SubstrateGraph`] is an ARM (one site, owned by an authority) or a
//!   CBM (the union of ARMs delegated to a broker).
//! - [`RequestGraph`] is the user's slice request (ASM).
//! - [`BrokerQueryModel`] is the listing a broker exposes on query.

#[cfg(test)]
pub(crate) mod tests;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{Capacities, ComponentSpec, ResourceType};

/// Inventory record for one attachable component on a substrate node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInventory {
    /// Component name, unique on the node.
    pub name: String,
    /// Component model, matched against [`ComponentSpec::model`].
    pub model: String,
    /// PCI bus/device/function address.
    pub bdf: String,
    /// `true` if multiple reservations may attach via label isolation.
    pub shared: bool,
    /// VLAN tags available on a shared component.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vlan_pool: Vec<u16>,
    /// MAC addresses available on a shared component.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mac_pool: Vec<String>,
}

/// A connection point where network services attach to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPoint {
    /// Connection point identifier.
    pub id: String,
    /// Component the connection point belongs to.
    pub component: String,
    /// VLAN tags delegated on this connection point.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vlan_delegation: Vec<u16>,
}

/// One substrate node in an ARM or CBM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Node identifier, stable across the ARM and every CBM shadow.
    pub id: String,
    /// Human name, e.g. `renc-w1`.
    pub name: String,
    /// Site the node belongs to.
    pub site: String,
    /// Resource type the node can host.
    pub rtype: ResourceType,
    /// Total capacities installed on the node.
    pub total: Capacities,
    /// Attachable components.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentInventory>,
    /// Connection points for network services.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connection_points: Vec<ConnectionPoint>,
}

impl GraphNode {
    /// Looks up a component by name.
    #[must_use]
    pub fn component(&self, name: &str) -> Option<&ComponentInventory> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Components matching a model, used for count-based matching.
    #[must_use]
    pub fn components_of_model(&self, model: &str) -> Vec<&ComponentInventory> {
        self.components.iter().filter(|c| c.model == model).collect()
    }

    /// The connection point attached to the given component.
    #[must_use]
    pub fn connection_point_for(&self, component: &str) -> Option<&ConnectionPoint> {
        self.connection_points.iter().find(|cp| cp.component == component)
    }
}

/// An in-memory substrate graph: an ARM or a CBM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstrateGraph {
    /// Graph identifier, referenced by reservation node maps.
    pub id: String,
    /// Nodes keyed by node id; the map order is the deterministic
    /// iteration order used by first-fit.
    pub nodes: BTreeMap<String, GraphNode>,
}

impl SubstrateGraph {
    /// Creates an empty graph with the given id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nodes: BTreeMap::new(),
        }
    }

    /// Inserts a node, replacing any previous node with the same id.
    pub fn add_node(&mut self, node: GraphNode) {
        self.nodes.insert(node.id.clone(), node);
    }

    /// Merges another graph's nodes into this one, the CBM construction.
    pub fn merge(&mut self, other: &SubstrateGraph) {
        for node in other.nodes.values() {
            self.nodes.insert(node.id.clone(), node.clone());
        }
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&GraphNode> {
        self.nodes.get(node_id)
    }

    /// Returns `true` if the graph contains the node.
    #[must_use]
    pub fn owns(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Node ids of the given type at the given site, in node-id order.
    #[must_use]
    pub fn nodes_by(&self, site: &str, rtype: ResourceType) -> Vec<&GraphNode> {
        self.nodes
            .values()
            .filter(|n| n.site == site && n.rtype == rtype)
            .collect()
    }

    /// Sites covered by the graph, deduplicated and sorted.
    #[must_use]
    pub fn sites(&self) -> Vec<String> {
        let mut sites: Vec<String> = self.nodes.values().map(|n| n.site.clone()).collect();
        sites.sort_unstable();
        sites.dedup();
        sites
    }
}

/// A node sliver request inside a request graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRequest {
    /// Request-graph local id.
    pub id: String,
    /// User-facing sliver name.
    pub name: String,
    /// Requested node type.
    pub rtype: ResourceType,
    /// Target site.
    pub site: String,
    /// Requested capacities.
    pub capacities: Capacities,
    /// Requested components.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentSpec>,
    /// Boot image, node slivers only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// One interface attachment of a network-service request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceRequest {
    /// Request-graph local id.
    pub id: String,
    /// Node request owning the attached NIC.
    pub node_request_id: String,
    /// Component name of the NIC on that node request.
    pub component_name: String,
    /// Requested bandwidth in gigabits per second.
    pub bandwidth_gbps: u32,
    /// Requested burst in megabits.
    pub burst_mbits: u32,
}

/// A network-service request inside a request graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRequest {
    /// Request-graph local id.
    pub id: String,
    /// User-facing service name.
    pub name: String,
    /// Service type, one of the network-service resource types.
    pub rtype: ResourceType,
    /// Site the service is anchored at.
    pub site: String,
    /// Interface attachments.
    pub interfaces: Vec<InterfaceRequest>,
}

/// The user's slice request graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestGraph {
    /// Graph identifier.
    pub id: String,
    /// Requested node slivers.
    #[serde(default)]
    pub nodes: Vec<NodeRequest>,
    /// Requested network services.
    #[serde(default)]
    pub services: Vec<ServiceRequest>,
}

impl RequestGraph {
    /// Validates the request graph schema.
    ///
    /// Checks that node request ids are unique, every interface points at
    /// an existing node request and component name, and service types are
    /// network services.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::CoreError::InvalidRequest`] on the first
    /// violation found.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::CoreError;

        let mut seen = std::collections::BTreeSet::new();
        for node in &self.nodes {
            if !node.rtype.is_node() {
                return Err(CoreError::InvalidRequest(format!(
                    "request node {} has non-node type {}",
                    node.id, node.rtype
                )));
            }
            if !seen.insert(&node.id) {
                return Err(CoreError::InvalidRequest(format!(
                    "duplicate node request id {}",
                    node.id
                )));
            }
        }
        for service in &self.services {
            if !service.rtype.is_network_service() {
                return Err(CoreError::InvalidRequest(format!(
                    "request service {} has non-service type {}",
                    service.id, service.rtype
                )));
            }
            for ifs in &service.interfaces {
                let Some(node) = self.nodes.iter().find(|n| n.id == ifs.node_request_id) else {
                    return Err(CoreError::InvalidRequest(format!(
                        "interface {} references unknown node request {}",
                        ifs.id, ifs.node_request_id
                    )));
                };
                if ifs.component_name.is_empty() {
                    return Err(CoreError::InvalidRequest(format!(
                        "interface {} names no component on node request {}",
                        ifs.id, node.id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Per-node entry of the broker query listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BqmNode {
    /// Substrate node id.
    pub node_id: String,
    /// Node name.
    pub name: String,
    /// Site.
    pub site: String,
    /// Resource type.
    pub rtype: ResourceType,
    /// Capacity delegated to the broker.
    pub delegated: Capacities,
    /// Capacity currently available after active holdings.
    pub available: Capacities,
    /// Number of active holdings, populated at query level 2.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holdings: Option<u32>,
}

/// The resource listing a broker returns on `Query`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerQueryModel {
    /// Per-node availability listing.
    pub nodes: Vec<BqmNode>,
}
