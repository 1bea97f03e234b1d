//! First-fit broker policy over capacity and component delegations.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{ErrorKind, LastError, Result};
use crate::graph::GraphNode;
use crate::model::{
    AttachedComponent, NodeMap, Reservation,
};

use super::{Policy, PolicyContext, PolicyOutcome};

/// The broker allocation policy: deterministic first fit over the CBM.
///
/// Candidate nodes are visited in node-id order, except for sites on the
/// `random_sites` list, where the order is shuffled with a seed derived
/// from `(cycle, slice id)`: one slice's retries within a tick stay
/// stable while different slices spread across nodes.
#[derive(Debug, Default)]
pub struct BrokerFirstFitPolicy;

impl BrokerFirstFitPolicy {
    /// Creates the policy.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn shuffle_seed(cycle: u64, slice_id: &str) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(cycle.to_be_bytes());
        hasher.update(slice_id.as_bytes());
        let digest = hasher.finalize();
        u64::from_be_bytes(digest[..8].try_into().unwrap_or_default())
    }

    /// Orders candidate node ids for a reservation.
    fn candidate_order(
        reservation: &Reservation,
        ctx: &PolicyContext<'_>,
    ) -> Vec<String> {
        let mut ids: Vec<String> = ctx
            .graph
            .nodes_by(&reservation.site, reservation.rtype)
            .iter()
            .map(|n| n.id.clone())
            .collect();
        if let Some(map) = &reservation.node_map {
            // A pinned reservation (modify of an existing sliver) only
            // ever lands on its original node.
            ids.retain(|id| id == &map.node_id);
        }
        if ctx.settings.random_sites.iter().any(|s| s == &reservation.site) {
            let seed = Self::shuffle_seed(ctx.cycle, reservation.slice_id.as_str());
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            ids.shuffle(&mut rng);
        }
        ids
    }

    /// Tries to fit the reservation's components on a node, returning the
    /// attachments on success.
    fn fit_components(
        reservation: &Reservation,
        node: &GraphNode,
        ctx: &PolicyContext<'_>,
    ) -> Option<Vec<AttachedComponent>> {
        let term = reservation.term;
        let busy = ctx.busy_components(&node.id, term.start_ms, term.end_ms, &reservation.id);
        let mut attached = Vec::new();
        let mut taken: Vec<&str> = Vec::new();

        for spec in &reservation.components {
            let mut remaining = spec.count;
            for inventory in node.components_of_model(&spec.model) {
                if remaining == 0 {
                    break;
                }
                if taken.contains(&inventory.bdf.as_str()) {
                    continue;
                }
                if !inventory.shared && busy.contains(&inventory.bdf) {
                    continue;
                }
                let (vlan, mac) = if inventory.shared {
                    let used = ctx.busy_vlans(
                        &node.id,
                        &inventory.bdf,
                        term.start_ms,
                        term.end_ms,
                        &reservation.id,
                    );
                    let Some(vlan) = inventory.vlan_pool.iter().find(|v| !used.contains(v)) else {
                        continue;
                    };
                    let mac = inventory
                        .mac_pool
                        .get(used.len() % inventory.mac_pool.len().max(1))
                        .cloned();
                    (Some(*vlan), mac)
                } else {
                    (None, None)
                };
                taken.push(&inventory.bdf);
                attached.push(AttachedComponent {
                    name: inventory.name.clone(),
                    model: inventory.model.clone(),
                    bdf: inventory.bdf.clone(),
                    shared: inventory.shared,
                    vlan,
                    mac,
                });
                remaining -= 1;
            }
            if remaining > 0 {
                return None;
            }
        }
        Some(attached)
    }

    /// Allocates a node sliver: capacity fit plus component fit.
    fn allocate_node(
        &self,
        reservation: &mut Reservation,
        ctx: &mut PolicyContext<'_>,
    ) -> PolicyOutcome {
        let term = reservation.term;
        for node_id in Self::candidate_order(reservation, ctx) {
            let Some(node) = ctx.graph.node(&node_id) else {
                continue;
            };
            let Some(available) =
                ctx.available_on(&node_id, term.start_ms, term.end_ms, &reservation.id)
            else {
                // No live delegation covers the node; a reclaimed
                // delegation leaves its nodes unallocatable.
                continue;
            };
            if !reservation.requested.fits_within(&available) {
                continue;
            }
            let Some(attached) = Self::fit_components(reservation, node, ctx) else {
                continue;
            };

            reservation.node_map = Some(NodeMap::new(ctx.graph.id.clone(), node_id.clone()));
            reservation.approved = Some(reservation.requested);
            reservation.approved_term = Some(term);
            reservation.assigned = attached;
            ctx.calendar
                .add_holding(&node_id, reservation.id.clone(), term.start_ms, term.end_ms);
            debug!(
                reservation = %reservation.id,
                node = %node_id,
                caps = %reservation.requested,
                "ticket granted"
            );
            return PolicyOutcome::Granted;
        }
        PolicyOutcome::Denied(LastError::new(
            ErrorKind::InsufficientResources,
            format!(
                "no {} node at {} satisfies {}",
                reservation.rtype, reservation.site, reservation.requested
            ),
        ))
    }

    /// Allocates a network-service sliver by walking its interfaces.
    ///
    /// Dedicated NICs get a VLAN from the peer connection point's
    /// delegation; shared NICs arrive with the VLAN already chosen by the
    /// orchestrator from the parent node sliver, and the broker only
    /// propagates the mapping.
    fn allocate_service(
        &self,
        reservation: &mut Reservation,
        ctx: &mut PolicyContext<'_>,
    ) -> PolicyOutcome {
        let term = reservation.term;
        let mut anchor_node: Option<String> = None;
        let mut interfaces = std::mem::take(&mut reservation.interfaces);

        for idx in 0..interfaces.len() {
            let ifs_id = interfaces[idx].id.clone();
            let ifs_parent_reservation = interfaces[idx].parent_reservation.clone();
            let ifs_parent_component = interfaces[idx].parent_component.clone();

            let Some(parent) = ctx.reservations.get(&ifs_parent_reservation) else {
                reservation.interfaces = interfaces;
                return PolicyOutcome::Denied(LastError::new(
                    ErrorKind::InvalidRequest,
                    format!("interface {} references unknown parent reservation", ifs_id),
                ));
            };
            let Some(parent_map) = parent.node_map.clone() else {
                reservation.interfaces = interfaces;
                return PolicyOutcome::Denied(LastError::new(
                    ErrorKind::InvalidRequest,
                    format!("parent of interface {} is not ticketed yet", ifs_id),
                ));
            };
            let parent_id = parent.id.clone();
            let ifs = &mut interfaces[idx];
            ifs.parent_node_id = Some(parent_map.node_id.clone());
            anchor_node.get_or_insert_with(|| parent_map.node_id.clone());

            let parent_component = parent
                .assigned
                .iter()
                .find(|c| c.model == ifs_parent_component || c.name == ifs_parent_component)
                .cloned();
            match parent_component {
                Some(component) => {
                    // The peer connection point on the site graph, found
                    // through the parent's NIC.
                    let peer = ctx
                        .graph
                        .node(&parent_map.node_id)
                        .and_then(|n| n.connection_point_for(&component.name));
                    ifs.peer_ifs = peer.map(|cp| cp.id.clone());

                    if component.shared {
                        // Propagate the orchestrator's label choice.
                        if ifs.vlan.is_none() {
                            ifs.vlan = component.vlan;
                        }
                        if ifs.mac.is_none() {
                            ifs.mac = component.mac.clone();
                        }
                    } else {
                        let pool = peer.map(|cp| cp.vlan_delegation.clone()).unwrap_or_default();
                        let used = ctx.busy_vlans(
                            &parent_map.node_id,
                            &component.bdf,
                            term.start_ms,
                            term.end_ms,
                            &reservation.id,
                        );
                        let Some(vlan) = pool.iter().find(|v| !used.contains(v)) else {
                            reservation.interfaces = interfaces;
                            return PolicyOutcome::Denied(LastError::new(
                                ErrorKind::InsufficientResources,
                                format!(
                                    "no VLAN available on connection point of {}",
                                    component.name
                                ),
                            ));
                        };
                        ifs.vlan = Some(*vlan);
                    }
                }
                None => {
                    reservation.interfaces = interfaces;
                    return PolicyOutcome::Denied(LastError::new(
                        ErrorKind::InvalidRequest,
                        format!(
                            "parent reservation {} carries no component {}",
                            parent_id, ifs_parent_component
                        ),
                    ));
                }
            }
        }

        // Charge the service bandwidth on every attached node.
        for ifs in &interfaces {
            if let Some(node) = &ifs.parent_node_id {
                ctx.calendar
                    .add_holding(node, reservation.id.clone(), term.start_ms, term.end_ms);
            }
        }
        reservation.interfaces = interfaces;

        let Some(anchor) = anchor_node else {
            return PolicyOutcome::Denied(LastError::new(
                ErrorKind::InvalidRequest,
                "network service has no interfaces",
            ));
        };
        reservation.node_map = Some(NodeMap::new(ctx.graph.id.clone(), anchor));
        reservation.approved = Some(reservation.requested);
        reservation.approved_term = Some(term);
        debug!(reservation = %reservation.id, "network service ticket granted");
        PolicyOutcome::Granted
    }
}

impl Policy for BrokerFirstFitPolicy {
    fn name(&self) -> &'static str {
        "broker-first-fit"
    }

    fn allocate_ticket(
        &mut self,
        reservation: &mut Reservation,
        ctx: &mut PolicyContext<'_>,
    ) -> Result<PolicyOutcome> {
        // Keyed lookup before computation: re-allocating an annotated
        // reservation yields the original assignment.
        if reservation.approved.is_some() && reservation.node_map.is_some() {
            return Ok(PolicyOutcome::Granted);
        }
        if reservation.rtype.is_node() && reservation.requested.is_zero() {
            return Ok(PolicyOutcome::Denied(LastError::new(
                ErrorKind::InvalidRequest,
                "zero-capacity request",
            )));
        }
        if ctx.maintenance_sites.contains(&reservation.site) {
            warn!(site = %reservation.site, "site under maintenance, refusing ticket");
            return Ok(PolicyOutcome::Denied(LastError::new(
                ErrorKind::InsufficientResources,
                format!("site {} is under maintenance", reservation.site),
            )));
        }
        if reservation.rtype.is_network_service() {
            Ok(self.allocate_service(reservation, ctx))
        } else {
            Ok(self.allocate_node(reservation, ctx))
        }
    }

    fn extend(
        &mut self,
        reservation: &mut Reservation,
        new_end_ms: i64,
        ctx: &mut PolicyContext<'_>,
    ) -> Result<PolicyOutcome> {
        let Some(map) = reservation.node_map.clone() else {
            return Ok(PolicyOutcome::Denied(LastError::new(
                ErrorKind::InvalidRequest,
                "cannot extend an unticketed reservation",
            )));
        };
        let current = reservation.effective_term();

        // Extensions past the policy cap are truncated, not refused.
        let cap_end = current.start_ms + ctx.settings.max_lease_ms;
        let granted_end = if new_end_ms > cap_end {
            warn!(
                reservation = %reservation.id,
                requested = new_end_ms,
                cap = cap_end,
                "extension truncated to policy cap"
            );
            cap_end
        } else {
            new_end_ms
        };
        let extended = match current.extended_to(granted_end) {
            Ok(term) => term,
            Err(err) => {
                return Ok(PolicyOutcome::Denied(LastError::new(
                    ErrorKind::InvalidRequest,
                    err.to_string(),
                )))
            }
        };

        // The same node must carry the approved capacity over the
        // extension window.
        let available = ctx
            .available_on(
                &map.node_id,
                extended.new_start_ms,
                extended.end_ms,
                &reservation.id,
            )
            .unwrap_or_default();
        let needed = reservation.effective_capacities();
        if !needed.fits_within(&available) {
            return Ok(PolicyOutcome::Denied(LastError::new(
                ErrorKind::InsufficientResources,
                format!("node {} cannot carry {needed} past lease end", map.node_id),
            )));
        }

        reservation.approved_term = Some(extended);
        ctx.calendar.add_holding(
            &map.node_id,
            reservation.id.clone(),
            extended.start_ms,
            extended.end_ms,
        );
        debug!(reservation = %reservation.id, term = %extended, "ticket extended");
        Ok(PolicyOutcome::Granted)
    }
}
