//! The reservation: the unit of arbitration for exactly one sliver.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, LastError, Result};
use crate::time::Term;

use super::states::{PendingState, ReservationState, valid_transition};
use super::{AttachedComponent, Capacities, ComponentSpec, ReservationId, SliceId};

/// Resource type of a sliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ResourceType {
    /// Virtual machine on a worker node.
    Vm,
    /// Container on a worker node.
    Container,
    /// Whole bare-metal worker.
    Baremetal,
    /// Switch port allocation.
    Switch,
    /// Site-to-site layer-2 service.
    L2Sts,
    /// Local layer-2 bridge.
    L2Bridge,
    /// Point-to-point layer-2 service.
    L2Ptp,
    /// Routed IPv4 service.
    FabNetV4,
    /// Routed IPv6 service.
    FabNetV6,
    /// Externally reachable IPv4 service.
    FabNetV4Ext,
    /// Externally reachable IPv6 service.
    FabNetV6Ext,
    /// Layer-3 VPN service.
    L3Vpn,
    /// Port mirroring service.
    PortMirror,
}

impl ResourceType {
    /// Returns the type as the identifier used in config and the store.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Vm => "VM",
            Self::Container => "Container",
            Self::Baremetal => "Baremetal",
            Self::Switch => "Switch",
            Self::L2Sts => "L2STS",
            Self::L2Bridge => "L2Bridge",
            Self::L2Ptp => "L2PTP",
            Self::FabNetV4 => "FABNetv4",
            Self::FabNetV6 => "FABNetv6",
            Self::FabNetV4Ext => "FABNetv4Ext",
            Self::FabNetV6Ext => "FABNetv6Ext",
            Self::L3Vpn => "L3VPN",
            Self::PortMirror => "PortMirror",
        }
    }

    /// Parses the config/store identifier form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "VM" => Some(Self::Vm),
            "Container" => Some(Self::Container),
            "Baremetal" => Some(Self::Baremetal),
            "Switch" => Some(Self::Switch),
            "L2STS" => Some(Self::L2Sts),
            "L2Bridge" => Some(Self::L2Bridge),
            "L2PTP" => Some(Self::L2Ptp),
            "FABNetv4" => Some(Self::FabNetV4),
            "FABNetv6" => Some(Self::FabNetV6),
            "FABNetv4Ext" => Some(Self::FabNetV4Ext),
            "FABNetv6Ext" => Some(Self::FabNetV6Ext),
            "L3VPN" => Some(Self::L3Vpn),
            "PortMirror" => Some(Self::PortMirror),
            _ => None,
        }
    }

    /// Returns `true` for node slivers realized on a single worker.
    #[must_use]
    pub const fn is_node(&self) -> bool {
        matches!(self, Self::Vm | Self::Container | Self::Baremetal | Self::Switch)
    }

    /// Returns `true` for network-service slivers spanning interfaces.
    #[must_use]
    pub const fn is_network_service(&self) -> bool {
        !self.is_node()
    }

    /// Network layer of a service type, recorded on its link rows.
    #[must_use]
    pub const fn layer(&self) -> &'static str {
        match self {
            Self::FabNetV4
            | Self::FabNetV6
            | Self::FabNetV4Ext
            | Self::FabNetV6Ext
            | Self::L3Vpn => "L3",
            _ => "L2",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner of a slice: the requesting user within a project.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SliceOwner {
    /// User identifier.
    pub user: String,
    /// Project identifier.
    pub project: String,
}

impl SliceOwner {
    /// Creates an owner record.
    #[must_use]
    pub fn new(user: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            project: project.into(),
        }
    }
}

/// Binding of a reservation to the authoritative substrate node.
///
/// Set by the broker during allocation, before the authority ever sees
/// the reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMap {
    /// Graph the node lives in (a CBM or ARM id).
    pub graph_id: String,
    /// Node within that graph.
    pub node_id: String,
}

impl NodeMap {
    /// Creates a node binding.
    #[must_use]
    pub fn new(graph_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            graph_id: graph_id.into(),
            node_id: node_id.into(),
        }
    }
}

/// A predecessor edge: this reservation may not advance until the
/// predecessor is at or past the target state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predecessor {
    /// Reservation that must advance first.
    pub reservation_id: ReservationId,
    /// State the predecessor must reach.
    pub target: ReservationState,
}

impl Predecessor {
    /// Creates a predecessor edge with the given target state.
    #[must_use]
    pub fn ticketed(reservation_id: ReservationId) -> Self {
        Self {
            reservation_id,
            target: ReservationState::Ticketed,
        }
    }
}

/// One interface of a network-service sliver.
///
/// Captures the orchestrator-side mapping onto the parent node sliver so
/// the broker can find the peer connection point on the site graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSliver {
    /// Interface identifier within the request graph.
    pub id: String,
    /// Node reservation that owns the attached NIC.
    pub parent_reservation: ReservationId,
    /// Component name of the NIC on the parent node sliver.
    pub parent_component: String,
    /// Substrate node of the parent, known once the parent is ticketed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node_id: Option<String>,
    /// Peer connection point on the site graph, resolved by the broker
    /// through the parent's NIC and recorded on the link rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_ifs: Option<String>,
    /// Peer network service on the site graph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_ns_id: Option<String>,
    /// Requested bandwidth in gigabits per second.
    pub bandwidth_gbps: u32,
    /// Requested burst in megabits.
    pub burst_mbits: u32,
    /// VLAN tag: set by the orchestrator for shared NICs, by the broker
    /// for dedicated NICs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
    /// MAC address, copied from the parent's shared NIC allocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

/// The unit of arbitration for exactly one sliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation identifier.
    pub id: ReservationId,
    /// Owning slice.
    pub slice_id: SliceId,
    /// Sliver resource type.
    pub rtype: ResourceType,
    /// Site the sliver is requested at.
    pub site: String,
    /// Requested capacities.
    pub requested: Capacities,
    /// Requested components by model and count.
    pub components: Vec<ComponentSpec>,
    /// Requested lease window.
    pub term: Term,
    /// Lifecycle state.
    pub state: ReservationState,
    /// In-flight operation marker.
    pub pending: PendingState,
    /// Capacities actually granted by policy, always within `requested`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<Capacities>,
    /// Lease window actually granted by policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_term: Option<Term>,
    /// Components attached by policy, identified by BDF.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assigned: Vec<AttachedComponent>,
    /// Binding to the authoritative substrate node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_map: Option<NodeMap>,
    /// Interfaces, for network-service slivers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<InterfaceSliver>,
    /// Predecessor edges gating this reservation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predecessors: Vec<Predecessor>,
    /// Remote attempts consumed by the current operation.
    #[serde(default)]
    pub retries: u32,
    /// Most recent failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    /// Opaque properties preserved across actors; handlers merge their
    /// output here (assigned IPs, instance ids).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    /// Insertion sequence within the owning slice, drives tick ordering.
    #[serde(default)]
    pub sequence: u64,
}

impl Reservation {
    /// Creates a nascent reservation for a node sliver.
    #[must_use]
    pub fn new(
        slice_id: SliceId,
        rtype: ResourceType,
        site: impl Into<String>,
        requested: Capacities,
        term: Term,
    ) -> Self {
        Self {
            id: ReservationId::generate(),
            slice_id,
            rtype,
            site: site.into(),
            requested,
            components: Vec::new(),
            term,
            state: ReservationState::Nascent,
            pending: PendingState::None,
            approved: None,
            approved_term: None,
            assigned: Vec::new(),
            node_map: None,
            interfaces: Vec::new(),
            predecessors: Vec::new(),
            retries: 0,
            last_error: None,
            properties: BTreeMap::new(),
            sequence: 0,
        }
    }

    /// Moves the reservation to `to`, enforcing the transition table.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalTransition`] for edges not in the table.
    pub fn transition(&mut self, to: ReservationState) -> Result<()> {
        if !valid_transition(self.state, to) {
            return Err(CoreError::IllegalTransition {
                reservation: self.id.to_string(),
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        if self.state != to {
            tracing::debug!(
                reservation = %self.id,
                from = %self.state,
                to = %to,
                "reservation transition"
            );
        }
        self.state = to;
        Ok(())
    }

    /// Fails the reservation, recording the error and clearing pending work.
    pub fn fail(&mut self, error: LastError) {
        tracing::warn!(reservation = %self.id, error = %error, "reservation failed");
        self.last_error = Some(error);
        self.pending = PendingState::None;
        // Failed is reachable from every non-terminal state.
        if !self.state.is_terminal() {
            self.state = ReservationState::Failed;
        }
    }

    /// Returns `true` once the reservation is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The lease window the reservation currently holds: the approved
    /// term when granted, the requested term before that.
    #[must_use]
    pub const fn effective_term(&self) -> Term {
        match self.approved_term {
            Some(term) => term,
            None => self.term,
        }
    }

    /// The capacities counted against holdings: approved when granted.
    #[must_use]
    pub const fn effective_capacities(&self) -> Capacities {
        match self.approved {
            Some(caps) => caps,
            None => self.requested,
        }
    }
}
