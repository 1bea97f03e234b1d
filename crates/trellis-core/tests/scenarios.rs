//! End-to-end lifecycle scenarios over a wired three-actor testbed.

mod common;

use std::sync::Arc;

use common::Testbed;

use trellis_core::error::ErrorKind;
use trellis_core::graph::{InterfaceRequest, NodeRequest, RequestGraph, ServiceRequest};
use trellis_core::model::{
    Capacities, ComponentSpec, PendingState, ReservationState, ResourceType, SliceOwner,
    SliceState,
};

fn owner() -> SliceOwner {
    SliceOwner::new("alice", "proj-1")
}

fn vm_graph(cores: u32) -> RequestGraph {
    RequestGraph {
        id: "asm-vm".to_string(),
        nodes: vec![NodeRequest {
            id: "n1".to_string(),
            name: "vm1".to_string(),
            rtype: ResourceType::Vm,
            site: "RENC".to_string(),
            capacities: Capacities::compute(cores, 64, 500),
            components: Vec::new(),
            image: Some("default_centos_9".to_string()),
        }],
        services: Vec::new(),
    }
}

fn vm_bridge_graph() -> RequestGraph {
    RequestGraph {
        id: "asm-bridge".to_string(),
        nodes: vec![NodeRequest {
            id: "n1".to_string(),
            name: "vm1".to_string(),
            rtype: ResourceType::Vm,
            site: "RENC".to_string(),
            capacities: Capacities::compute(4, 64, 500),
            components: vec![ComponentSpec::new("SmartNIC-CX6", 1)],
            image: None,
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

// =============================================================================
// Scenario: single VM through its whole life
// =============================================================================

#[test]
fn test_single_vm_reaches_active_and_closes_at_lease_end() {
    let mut bed = Testbed::new(1);
    let slice_id = bed
        .orchestrator
        .create_slice("single-vm", owner(), vm_graph(4), Some(3_600_000))
        .unwrap();

    // Ticket, redeem, provision.
    bed.run_to(6);
    assert_eq!(
        Testbed::states_of(&bed.orchestrator),
        vec![ReservationState::Active]
    );
    assert_eq!(
        bed.orchestrator.slice_state(&slice_id),
        Some(SliceState::StableOk)
    );
    // The broker reserved on w1; the authority mirrored on bind.
    assert_eq!(bed.broker.calendar().holdings().count_on("w1"), 1);
    assert_eq!(bed.authority.calendar().holdings().count_on("w1"), 1);

    // Handler properties surfaced to the orchestrator.
    let member = bed.orchestrator.state().reservations.values().next().unwrap();
    assert!(member.properties.contains_key("instance_id"));

    // Lease end: teardown runs and every holding drops.
    bed.run_to(3605);
    assert_eq!(
        Testbed::states_of(&bed.orchestrator),
        vec![ReservationState::Closed]
    );
    assert_eq!(Testbed::holdings_of(&bed.broker), 0);
    assert_eq!(Testbed::holdings_of(&bed.authority), 0);

    // Grace elapses and the dead slice is collected everywhere.
    bed.run_to(3680);
    assert!(bed.orchestrator.state().slices.is_empty());
    assert_eq!(bed.orchestrator.store().stats().unwrap().slices, 0);
}

// =============================================================================
// Scenario: insufficient resources
// =============================================================================

#[test]
fn test_ticket_fails_when_capacity_is_held() {
    let mut bed = Testbed::new(1);
    bed.orchestrator
        .create_slice("big", owner(), vm_graph(30), Some(7_200_000))
        .unwrap();
    bed.run_to(6);
    assert_eq!(
        Testbed::states_of(&bed.orchestrator),
        vec![ReservationState::Active]
    );

    // 30 of 32 cores are held; 4 more cannot fit.
    let second = bed
        .orchestrator
        .create_slice("small", owner(), vm_graph(4), Some(3_600_000))
        .unwrap();
    bed.run_to(12);

    let member = bed
        .orchestrator
        .state()
        .slices
        .get(&second)
        .and_then(|s| s.reservations.first())
        .and_then(|rid| bed.orchestrator.state().reservations.get(rid))
        .unwrap();
    assert_eq!(member.state, ReservationState::Failed);
    assert_eq!(
        member.last_error.as_ref().unwrap().kind,
        ErrorKind::InsufficientResources
    );
    assert_eq!(
        bed.orchestrator.slice_state(&second),
        Some(SliceState::StableError)
    );
    // The failed request left nothing behind on the calendar.
    assert_eq!(bed.broker.calendar().holdings().count_on("w1"), 1);
}

// =============================================================================
// Scenario: dependency ordering for a network service
// =============================================================================

#[test]
fn test_bridge_blocks_until_vm_is_ticketed_then_inherits_labels() {
    let mut bed = Testbed::new(1);
    let slice_id = bed
        .orchestrator
        .create_slice("vm-bridge", owner(), vm_bridge_graph(), Some(3_600_000))
        .unwrap();

    // First tick: the VM tickets, the bridge parks on its predecessor.
    bed.run_to(0);
    let states: Vec<(ReservationState, PendingState)> = bed
        .orchestrator
        .state()
        .slices
        .get(&slice_id)
        .unwrap()
        .reservations
        .iter()
        .map(|rid| {
            let r = bed.orchestrator.state().reservations.get(rid).unwrap();
            (r.state, r.pending)
        })
        .collect();
    assert_eq!(states[0], (ReservationState::Nascent, PendingState::Ticketing));
    assert_eq!(
        states[1],
        (ReservationState::Nascent, PendingState::BlockedTicket)
    );

    // Both reach Active in lockstep with the authority.
    bed.run_to(10);
    assert_eq!(
        Testbed::states_of(&bed.orchestrator),
        vec![ReservationState::Active, ReservationState::Active]
    );

    // The bridge interface carries the VLAN and MAC of the VM's shared
    // NIC allocation.
    let slice = bed.orchestrator.state().slices.get(&slice_id).unwrap();
    let vm = bed
        .orchestrator
        .state()
        .reservations
        .get(&slice.reservations[0])
        .unwrap();
    let bridge = bed
        .orchestrator
        .state()
        .reservations
        .get(&slice.reservations[1])
        .unwrap();
    let nic = vm.assigned.iter().find(|c| c.shared).unwrap();
    assert!(nic.vlan.is_some());
    assert_eq!(bridge.interfaces[0].vlan, nic.vlan);
    assert_eq!(bridge.interfaces[0].mac, nic.mac);
    assert_eq!(bridge.interfaces[0].parent_node_id.as_deref(), Some("w1"));

    // The broker resolved the peer connection point through the VM's NIC
    // and the mapping landed in the persisted link rows.
    assert_eq!(bridge.interfaces[0].peer_ifs.as_deref(), Some("cp-w1-nic1"));
    let links = bed.orchestrator.store().load_links(&bridge.id).unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].node_id, "w1");
    assert_eq!(links[0].properties.get("peer_ifs").unwrap(), "cp-w1-nic1");
}

#[test]
fn test_failed_predecessor_fails_the_dependent() {
    let mut bed = Testbed::new(1);

    // Fill the node so the VM ticket is refused.
    bed.orchestrator
        .create_slice("blocker", owner(), vm_graph(30), Some(7_200_000))
        .unwrap();
    bed.run_to(6);

    let doomed = bed
        .orchestrator
        .create_slice("vm-bridge", owner(), vm_bridge_graph(), Some(3_600_000))
        .unwrap();
    bed.run_to(14);

    let slice = bed.orchestrator.state().slices.get(&doomed).unwrap();
    let vm = bed
        .orchestrator
        .state()
        .reservations
        .get(&slice.reservations[0])
        .unwrap();
    let bridge = bed
        .orchestrator
        .state()
        .reservations
        .get(&slice.reservations[1])
        .unwrap();
    // The VM failed on capacity and took the bridge down with it.
    assert_eq!(vm.state, ReservationState::Failed);
    assert_eq!(
        vm.last_error.as_ref().unwrap().kind,
        ErrorKind::InsufficientResources
    );
    assert_eq!(bridge.state, ReservationState::Failed);
    assert_eq!(
        bridge.last_error.as_ref().unwrap().kind,
        ErrorKind::PredecessorFailed
    );
}

// =============================================================================
// Scenario: renewal
// =============================================================================

#[test]
fn test_extend_renews_the_lease_in_place() {
    let mut bed = Testbed::new(1);
    let slice_id = bed
        .orchestrator
        .create_slice("renewable", owner(), vm_graph(4), Some(3_600_000))
        .unwrap();
    bed.run_to(1800);
    assert_eq!(
        Testbed::states_of(&bed.orchestrator),
        vec![ReservationState::Active]
    );

    bed.orchestrator
        .extend_slice(&slice_id, 10_800_000)
        .unwrap();

    // The renewal is in flight: the new ticket exists while the prior
    // lease still runs.
    bed.run_to(1804);
    let member = bed.orchestrator.state().reservations.values().next().unwrap();
    assert_eq!(member.state, ReservationState::ActiveTicketed);

    // Past the old lease end the window was swapped, not torn down.
    bed.run_to(3700);
    let member = bed.orchestrator.state().reservations.values().next().unwrap();
    assert_eq!(member.state, ReservationState::Active);
    assert_eq!(member.effective_term().end_ms, 10_800_000);
    assert_eq!(bed.authority.calendar().holdings().count_on("w1"), 1);

    // The extended lease still ends.
    bed.run_to(10_810);
    assert_eq!(
        Testbed::states_of(&bed.orchestrator),
        vec![ReservationState::Closed]
    );
    assert_eq!(Testbed::holdings_of(&bed.authority), 0);
}

#[test]
fn test_extend_requested_mid_ticketing_is_deferred_then_issued() {
    let mut bed = Testbed::new(1);
    let slice_id = bed
        .orchestrator
        .create_slice("eager", owner(), vm_graph(4), Some(3_600_000))
        .unwrap();

    // The ticket is still in flight when the extension arrives; the
    // renewal parks until the member settles.
    bed.run_to(0);
    bed.orchestrator
        .extend_slice(&slice_id, 10_800_000)
        .unwrap();

    // The deferred renewal was issued once the member went active: the
    // new ticket is held while the original lease still runs.
    bed.run_to(20);
    let member = bed.orchestrator.state().reservations.values().next().unwrap();
    assert_eq!(member.state, ReservationState::ActiveTicketed);
    assert_eq!(member.effective_term().end_ms, 10_800_000);
}

// =============================================================================
// Close semantics
// =============================================================================

#[test]
fn test_create_then_close_leaves_no_holdings() {
    let mut bed = Testbed::new(1);
    let slice_id = bed
        .orchestrator
        .create_slice("short-lived", owner(), vm_graph(4), Some(3_600_000))
        .unwrap();
    bed.run_to(6);
    assert_eq!(bed.broker.calendar().holdings().count_on("w1"), 1);

    bed.orchestrator.close_slice(&slice_id).unwrap();
    bed.run_to(12);

    assert_eq!(
        Testbed::states_of(&bed.orchestrator),
        vec![ReservationState::Closed]
    );
    assert_eq!(Testbed::holdings_of(&bed.broker), 0);
    assert_eq!(Testbed::holdings_of(&bed.authority), 0);
}

#[test]
fn test_close_before_ticket_never_reaches_the_broker() {
    let mut bed = Testbed::new(1);
    let slice_id = bed
        .orchestrator
        .create_slice("aborted", owner(), vm_graph(4), Some(3_600_000))
        .unwrap();
    // Closed before the first tick ever demanded it.
    bed.orchestrator.close_slice(&slice_id).unwrap();
    bed.run_to(5);

    assert_eq!(
        Testbed::states_of(&bed.orchestrator),
        vec![ReservationState::Closed]
    );
    assert!(bed.broker.state().reservations.is_empty());
    assert_eq!(Testbed::holdings_of(&bed.broker), 0);
}

#[test]
fn test_double_close_is_a_no_op() {
    let mut bed = Testbed::new(1);
    let slice_id = bed
        .orchestrator
        .create_slice("twice", owner(), vm_graph(4), Some(3_600_000))
        .unwrap();
    bed.run_to(6);

    bed.orchestrator.close_slice(&slice_id).unwrap();
    bed.run_to(12);
    let states_after_first = Testbed::states_of(&bed.orchestrator);

    bed.orchestrator.close_slice(&slice_id).unwrap();
    bed.run_to(16);
    assert_eq!(Testbed::states_of(&bed.orchestrator), states_after_first);
}

// =============================================================================
// Provision failure
// =============================================================================

#[test]
fn test_handler_failure_surfaces_to_the_orchestrator() {
    let mut bed = Testbed::new(1);
    bed.handlers
        .insert("VM".to_string(), Arc::new(common::FailingHandler));

    bed.orchestrator
        .create_slice("doomed", owner(), vm_graph(4), Some(3_600_000))
        .unwrap();
    bed.run_to(8);

    let member = bed.orchestrator.state().reservations.values().next().unwrap();
    assert_eq!(member.state, ReservationState::Failed);
    let error = member.last_error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::HandlerFailure);
    assert!(error.message.contains("image not found"));
    assert_eq!(Testbed::holdings_of(&bed.authority), 0);
}
