//! Tests for the slice workflow graph walk.

use std::collections::BTreeMap;

use crate::model::{
    AttachedComponent, Capacities, ComponentSpec, NodeMap, Reservation, ReservationState,
    ResourceType, Slice, SliceOwner,
};
use crate::graph::{InterfaceRequest, NodeRequest, RequestGraph, ServiceRequest};
use crate::time::Term;

use super::{adopt_parent_labels, build_reservations};

fn term() -> Term {
    Term::new(0, 3_600_000).unwrap()
}

fn slice() -> Slice {
    Slice::new("demo", SliceOwner::new("alice", "proj-1"), term())
}

fn request() -> RequestGraph {
    RequestGraph {
        id: "asm-1".to_string(),
        nodes: vec![
            NodeRequest {
                id: "n1".to_string(),
                name: "vm1".to_string(),
                rtype: ResourceType::Vm,
                site: "RENC".to_string(),
                capacities: Capacities::compute(4, 64, 500),
                components: vec![ComponentSpec::new("SmartNIC-CX6", 1)],
                image: Some("default_centos_9".to_string()),
            },
            NodeRequest {
                id: "n2".to_string(),
                name: "vm2".to_string(),
                rtype: ResourceType::Vm,
                site: "RENC".to_string(),
                capacities: Capacities::compute(2, 32, 100),
                components: vec![ComponentSpec::new("SmartNIC-CX6", 1)],
                image: None,
            },
        ],
        services: vec![ServiceRequest {
            id: "s1".to_string(),
            name: "bridge1".to_string(),
            rtype: ResourceType::L2Bridge,
            site: "RENC".to_string(),
            interfaces: vec![
                InterfaceRequest {
                    id: "i1".to_string(),
                    node_request_id: "n1".to_string(),
                    component_name: "SmartNIC-CX6".to_string(),
                    bandwidth_gbps: 10,
                    burst_mbits: 100,
                },
                InterfaceRequest {
                    id: "i2".to_string(),
                    node_request_id: "n2".to_string(),
                    component_name: "SmartNIC-CX6".to_string(),
                    bandwidth_gbps: 25,
                    burst_mbits: 200,
                },
            ],
        }],
    }
}

#[test]
fn test_two_pass_walk_produces_nodes_then_services() {
    let slice = slice();
    let reservations = build_reservations(&slice, &request(), term()).unwrap();
    assert_eq!(reservations.len(), 3);
    assert!(reservations[0].rtype.is_node());
    assert!(reservations[1].rtype.is_node());
    assert_eq!(reservations[2].rtype, ResourceType::L2Bridge);
    assert_eq!(
        reservations[0].properties.get(super::PROP_IMAGE).unwrap(),
        "default_centos_9"
    );
}

#[test]
fn test_service_predecessors_point_at_node_reservations() {
    let slice = slice();
    let reservations = build_reservations(&slice, &request(), term()).unwrap();
    let bridge = &reservations[2];

    assert_eq!(bridge.predecessors.len(), 2);
    for pred in &bridge.predecessors {
        assert_eq!(pred.target, ReservationState::Ticketed);
        assert!(reservations[..2].iter().any(|r| r.id == pred.reservation_id));
    }
    // Bandwidth is the widest interface request.
    assert_eq!(bridge.requested.bandwidth_gbps, 25);
    assert_eq!(bridge.interfaces[0].burst_mbits, 100);
    assert_eq!(bridge.interfaces[1].burst_mbits, 200);
}

#[test]
fn test_adopt_parent_labels_copies_shared_nic_allocation() {
    let slice = slice();
    let mut reservations = build_reservations(&slice, &request(), term()).unwrap();
    let mut bridge = reservations.pop().unwrap();

    let mut arena: BTreeMap<_, Reservation> = BTreeMap::new();
    for mut parent in reservations {
        parent.node_map = Some(NodeMap::new("cbm-1", "w1"));
        parent.assigned = vec![AttachedComponent {
            name: "nic1".to_string(),
            model: "SmartNIC-CX6".to_string(),
            bdf: "0000:41:00.0".to_string(),
            shared: true,
            vlan: Some(101),
            mac: Some("02:00:00:00:01:00".to_string()),
        }];
        arena.insert(parent.id.clone(), parent);
    }

    adopt_parent_labels(&mut bridge, &arena);
    for ifs in &bridge.interfaces {
        assert_eq!(ifs.vlan, Some(101));
        assert_eq!(ifs.mac.as_deref(), Some("02:00:00:00:01:00"));
        assert_eq!(ifs.parent_node_id.as_deref(), Some("w1"));
    }
}
