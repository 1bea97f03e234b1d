//! The orchestrator slice workflow: request graph to reservations.
//!
//! An accepted create-slice request walks the request graph in two
//! passes. Pass one produces one reservation per network-node request.
//! Pass two produces one reservation per network service, wired to its
//! node reservations through predecessor edges so the kernel holds the
//! service back until VLAN and MAC allocations on shared NICs are known.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{CoreError, Result};
use crate::graph::RequestGraph;
use crate::model::{
    Capacities, InterfaceSliver, Predecessor, Reservation, ReservationId, Slice,
};
use crate::time::Term;

/// Property key carrying the boot image of a node sliver.
pub const PROP_IMAGE: &str = "image";

/// Builds the reservations for a slice from its request graph.
///
/// Reservations come back in demand order: node slivers first, then
/// network services; the caller inserts them in this order so the
/// kernel's per-slice processing respects the dependencies.
///
/// # Errors
///
/// Returns [`CoreError::InvalidRequest`] when a service interface
/// references a node request that produced no reservation.
pub fn build_reservations(
    slice: &Slice,
    request: &RequestGraph,
    term: Term,
) -> Result<Vec<Reservation>> {
    let mut reservations = Vec::new();
    let mut node_reservation_ids: BTreeMap<&str, ReservationId> = BTreeMap::new();

    // Pass one: node slivers.
    for node in &request.nodes {
        let mut reservation = Reservation::new(
            slice.id.clone(),
            node.rtype,
            node.site.clone(),
            node.capacities,
            term,
        );
        reservation.components = node.components.clone();
        if let Some(image) = &node.image {
            reservation
                .properties
                .insert(PROP_IMAGE.to_string(), image.clone());
        }
        debug!(reservation = %reservation.id, name = %node.name, "node sliver demanded");
        node_reservation_ids.insert(node.id.as_str(), reservation.id.clone());
        reservations.push(reservation);
    }

    // Pass two: network-service slivers with predecessor edges.
    for service in &request.services {
        let mut requested = Capacities::default();
        let mut interfaces = Vec::new();
        let mut predecessors = Vec::new();
        for ifs in &service.interfaces {
            let Some(parent_id) = node_reservation_ids.get(ifs.node_request_id.as_str()) else {
                return Err(CoreError::InvalidRequest(format!(
                    "interface {} references node request {} with no reservation",
                    ifs.id, ifs.node_request_id
                )));
            };
            requested.bandwidth_gbps = requested.bandwidth_gbps.max(ifs.bandwidth_gbps);
            interfaces.push(InterfaceSliver {
                id: ifs.id.clone(),
                parent_reservation: parent_id.clone(),
                parent_component: ifs.component_name.clone(),
                parent_node_id: None,
                peer_ifs: None,
                peer_ns_id: Some(service.id.clone()),
                bandwidth_gbps: ifs.bandwidth_gbps,
                burst_mbits: ifs.burst_mbits,
                vlan: None,
                mac: None,
            });
            if !predecessors
                .iter()
                .any(|p: &Predecessor| &p.reservation_id == parent_id)
            {
                predecessors.push(Predecessor::ticketed(parent_id.clone()));
            }
        }

        let mut reservation = Reservation::new(
            slice.id.clone(),
            service.rtype,
            service.site.clone(),
            requested,
            term,
        );
        reservation.interfaces = interfaces;
        reservation.predecessors = predecessors;
        debug!(reservation = %reservation.id, name = %service.name, "network service demanded");
        reservations.push(reservation);
    }

    Ok(reservations)
}

/// Copies shared-NIC labels from ticketed parents onto a network-service
/// reservation before it is ticketed.
///
/// For each interface whose parent carries a shared NIC assignment, the
/// VLAN and MAC chosen by the broker for that NIC are written into the
/// interface sliver, along with the parent's substrate node. Dedicated
/// NICs are left for the broker to label from the connection-point
/// delegation.
pub fn adopt_parent_labels(
    reservation: &mut Reservation,
    arena: &BTreeMap<ReservationId, Reservation>,
) {
    for ifs in &mut reservation.interfaces {
        let Some(parent) = arena.get(&ifs.parent_reservation) else {
            continue;
        };
        if let Some(map) = &parent.node_map {
            ifs.parent_node_id = Some(map.node_id.clone());
        }
        let component = parent
            .assigned
            .iter()
            .find(|c| c.model == ifs.parent_component || c.name == ifs.parent_component);
        if let Some(component) = component {
            if component.shared {
                ifs.vlan = ifs.vlan.or(component.vlan);
                if ifs.mac.is_none() {
                    ifs.mac = component.mac.clone();
                }
            }
        }
    }
}
