//! Tests for the substrate and request graph models.

use crate::model::{Capacities, ComponentSpec, ResourceType};

use super::{
    ComponentInventory, ConnectionPoint, GraphNode, InterfaceRequest, NodeRequest, RequestGraph,
    ServiceRequest, SubstrateGraph,
};

pub(crate) fn worker(id: &str, site: &str) -> GraphNode {
    GraphNode {
        id: id.to_string(),
        name: format!("{site}-{id}"),
        site: site.to_string(),
        rtype: ResourceType::Vm,
        total: Capacities::compute(32, 384, 3000),
        components: vec![
            ComponentInventory {
                name: "nic1".to_string(),
                model: "SmartNIC-CX6".to_string(),
                bdf: "0000:41:00.0".to_string(),
                shared: true,
                vlan_pool: vec![100, 101, 102],
                mac_pool: vec![
                    "02:00:00:00:01:00".to_string(),
                    "02:00:00:00:01:01".to_string(),
                ],
            },
            ComponentInventory {
                name: "gpu1".to_string(),
                model: "GPU-A30".to_string(),
                bdf: "0000:25:00.0".to_string(),
                shared: false,
                vlan_pool: Vec::new(),
                mac_pool: Vec::new(),
            },
        ],
        connection_points: vec![ConnectionPoint {
            id: format!("cp-{id}-nic1"),
            component: "nic1".to_string(),
            vlan_delegation: vec![300, 301, 302],
        }],
    }
}

#[test]
fn test_nodes_by_site_and_type_is_ordered() {
    let mut graph = SubstrateGraph::new("cbm-1");
    graph.add_node(worker("w2", "RENC"));
    graph.add_node(worker("w1", "RENC"));
    graph.add_node(worker("w3", "UKY"));

    let nodes = graph.nodes_by("RENC", ResourceType::Vm);
    let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["w1", "w2"]);
    assert!(graph.nodes_by("RENC", ResourceType::Baremetal).is_empty());
}

#[test]
fn test_cbm_merge_overwrites_shadow_nodes() {
    let mut cbm = SubstrateGraph::new("cbm-1");
    cbm.add_node(worker("w1", "RENC"));

    let mut arm = SubstrateGraph::new("arm-renc");
    let mut updated = worker("w1", "RENC");
    updated.total = Capacities::compute(64, 768, 6000);
    arm.add_node(updated);

    cbm.merge(&arm);
    assert_eq!(cbm.node("w1").unwrap().total.cores, 64);
    assert_eq!(cbm.sites(), vec!["RENC".to_string()]);
}

#[test]
fn test_component_lookup() {
    let node = worker("w1", "RENC");
    assert!(node.component("nic1").unwrap().shared);
    assert_eq!(node.components_of_model("GPU-A30").len(), 1);
    assert!(node.component("nic9").is_none());
}

fn request_graph() -> RequestGraph {
    RequestGraph {
        id: "asm-1".to_string(),
        nodes: vec![NodeRequest {
            id: "n1".to_string(),
            name: "vm1".to_string(),
            rtype: ResourceType::Vm,
            site: "RENC".to_string(),
            capacities: Capacities::compute(4, 64, 500),
            components: vec![ComponentSpec::new("SmartNIC-CX6", 1)],
            image: Some("default_centos_9".to_string()),
        }],
        services: vec![ServiceRequest {
            id: "s1".to_string(),
            name: "bridge1".to_string(),
            rtype: ResourceType::L2Bridge,
            site: "RENC".to_string(),
            interfaces: vec![InterfaceRequest {
                id: "i1".to_string(),
                node_request_id: "n1".to_string(),
                component_name: "SmartNIC-CX6".to_string(),
                bandwidth_gbps: 10,
                burst_mbits: 100,
            }],
        }],
    }
}

#[test]
fn test_request_graph_validates() {
    assert!(request_graph().validate().is_ok());
}

#[test]
fn test_request_graph_rejects_dangling_interface() {
    let mut graph = request_graph();
    graph.services[0].interfaces[0].node_request_id = "n9".to_string();
    assert!(graph.validate().is_err());
}

#[test]
fn test_request_graph_rejects_type_confusion() {
    let mut graph = request_graph();
    graph.nodes[0].rtype = ResourceType::L2Bridge;
    assert!(graph.validate().is_err());

    let mut graph = request_graph();
    graph.services[0].rtype = ResourceType::Vm;
    assert!(graph.validate().is_err());
}

#[test]
fn test_request_graph_rejects_duplicate_node_ids() {
    let mut graph = request_graph();
    let dup = graph.nodes[0].clone();
    graph.nodes.push(dup);
    assert!(graph.validate().is_err());
}
