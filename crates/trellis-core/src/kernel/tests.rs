//! Unit tests for kernel plumbing: commands, retries, dedupe, legality.

use crate::authz::{AllowAll, AuthAction, AuthResource, Decision, DecisionPoint};
use crate::config::KernelSettings;
use crate::error::ErrorKind;
use crate::graph::tests::worker;
use crate::graph::{NodeRequest, RequestGraph, SubstrateGraph};
use crate::model::{
    ActorGuid, ActorRole, Capacities, Peer, ReservationState, ResourceType, SliceOwner,
};
use crate::policy::{BrokerFirstFitPolicy, OrchestratorReviewPolicy, PolicySettings};
use crate::protocol::{Envelope, MessageKind, SliceInfo};
use crate::store::SqliteStore;
use crate::time::ActorClock;

use super::{Kernel, KernelConfig, KernelEvent};

fn peers() -> Vec<Peer> {
    vec![
        Peer {
            guid: ActorGuid::from_string("orchestrator-1"),
            role: ActorRole::Orchestrator,
            topic: "t-orc".to_string(),
            site: None,
            delegation: None,
        },
        Peer {
            guid: ActorGuid::from_string("broker-1"),
            role: ActorRole::Broker,
            topic: "t-broker".to_string(),
            site: None,
            delegation: None,
        },
        Peer {
            guid: ActorGuid::from_string("authority-renc"),
            role: ActorRole::Authority,
            topic: "t-auth".to_string(),
            site: Some("RENC".to_string()),
            delegation: None,
        },
    ]
}

fn config(role: ActorRole, topic: &str) -> KernelConfig {
    KernelConfig {
        role,
        guid: ActorGuid::from_string(format!("{role}-test")),
        topic: topic.to_string(),
        clock: ActorClock::new(0, 1000).unwrap(),
        policy_settings: PolicySettings::default(),
        kernel_settings: KernelSettings::default(),
        rpc_retries: 3,
        rpc_timeout_cycles: 5,
        commit_batch_size: 1,
        peers: peers(),
    }
}

fn orchestrator() -> Kernel {
    Kernel::new(
        config(ActorRole::Orchestrator, "t-orc"),
        Box::new(OrchestratorReviewPolicy::new()),
        Box::new(AllowAll),
        SqliteStore::in_memory().unwrap(),
        SubstrateGraph::new("empty"),
    )
}

fn broker() -> Kernel {
    let mut graph = SubstrateGraph::new("cbm-1");
    graph.add_node(worker("w1", "RENC"));
    Kernel::new(
        config(ActorRole::Broker, "t-broker"),
        Box::new(BrokerFirstFitPolicy::new()),
        Box::new(AllowAll),
        SqliteStore::in_memory().unwrap(),
        graph,
    )
}

fn vm_request_graph() -> RequestGraph {
    RequestGraph {
        id: "asm-1".to_string(),
        nodes: vec![NodeRequest {
            id: "n1".to_string(),
            name: "vm1".to_string(),
            rtype: ResourceType::Vm,
            site: "RENC".to_string(),
            capacities: Capacities::compute(4, 64, 500),
            components: Vec::new(),
            image: None,
        }],
        services: Vec::new(),
    }
}

fn owner() -> SliceOwner {
    SliceOwner::new("alice", "proj-1")
}

// =============================================================================
// create_slice validation
// =============================================================================

#[test]
fn test_create_slice_demands_reservations() {
    let mut kernel = orchestrator();
    let slice_id = kernel
        .create_slice("demo", owner(), vm_request_graph(), Some(3_600_000))
        .unwrap();
    assert_eq!(kernel.state().slices.len(), 1);
    assert_eq!(kernel.state().reservations.len(), 1);

    let report = kernel.tick(0).unwrap();
    assert_eq!(report.outbound.len(), 1);
    assert_eq!(report.outbound[0].topic, "t-broker");
    assert_eq!(report.outbound[0].envelope.kind.name(), "TICKET");
    assert!(report.persisted > 0);

    let member = kernel.state().reservations.values().next().unwrap();
    assert_eq!(member.slice_id, slice_id);
    assert_eq!(member.pending, crate::model::PendingState::Ticketing);
}

#[test]
fn test_create_slice_rejects_inverted_lease() {
    let mut kernel = orchestrator();
    let err = kernel
        .create_slice("demo", owner(), vm_request_graph(), Some(-5))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[test]
fn test_create_slice_rejects_name_collision() {
    let mut kernel = orchestrator();
    kernel
        .create_slice("demo", owner(), vm_request_graph(), Some(3_600_000))
        .unwrap();
    let err = kernel
        .create_slice("demo", owner(), vm_request_graph(), Some(3_600_000))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    // A different owner may reuse the name.
    kernel
        .create_slice(
            "demo",
            SliceOwner::new("bob", "proj-2"),
            vm_request_graph(),
            Some(3_600_000),
        )
        .unwrap();
}

#[test]
fn test_create_slice_rejects_zero_capacity() {
    let mut kernel = orchestrator();
    let mut graph = vm_request_graph();
    graph.nodes[0].capacities = Capacities::default();
    let err = kernel
        .create_slice("demo", owner(), graph, Some(3_600_000))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[test]
fn test_create_slice_truncates_to_policy_cap() {
    let mut kernel = orchestrator();
    let cap = kernel.policy_settings.max_lease_ms;
    let slice_id = kernel
        .create_slice("demo", owner(), vm_request_graph(), Some(cap * 10))
        .unwrap();
    let slice = kernel.state().slices.get(&slice_id).unwrap();
    assert_eq!(slice.term.end_ms, cap);
}

#[test]
fn test_slice_count_metric_tracks_creates() {
    let mut kernel = orchestrator();
    kernel
        .create_slice("demo", owner(), vm_request_graph(), Some(3_600_000))
        .unwrap();
    assert_eq!(kernel.store().slice_count(&owner()).unwrap(), 1);
}

// =============================================================================
// Timeout and retry
// =============================================================================

#[test]
fn test_unanswered_ticket_retries_then_fails_with_timeout() {
    let mut kernel = orchestrator();
    kernel
        .create_slice("demo", owner(), vm_request_graph(), Some(3_600_000))
        .unwrap();

    // First tick sends the ticket (attempt 1).
    let report = kernel.tick(0).unwrap();
    assert_eq!(report.outbound.len(), 1);
    let first_msg = report.outbound[0].envelope.msg_id;

    // Nothing comes back; each deadline expiry re-sends with a fresh id.
    let mut resends = Vec::new();
    for cycle in 1..=20 {
        let report = kernel.tick(cycle).unwrap();
        for outbound in report.outbound {
            if outbound.envelope.kind.name() == "TICKET" {
                assert_ne!(outbound.envelope.msg_id, first_msg);
                resends.push(outbound.envelope.msg_id);
            }
        }
    }
    // rpc_retries = 3: attempts 2 and 3 are re-sends, then the failure.
    assert_eq!(resends.len(), 2);

    let member = kernel.state().reservations.values().next().unwrap();
    assert_eq!(member.state, ReservationState::Failed);
    assert_eq!(member.last_error.as_ref().unwrap().kind, ErrorKind::Timeout);
}

#[test]
fn test_timeout_event_is_ignored_after_reply_settled() {
    let mut kernel = orchestrator();
    kernel
        .create_slice("demo", owner(), vm_request_graph(), Some(3_600_000))
        .unwrap();
    let report = kernel.tick(0).unwrap();
    let msg_id = report.outbound[0].envelope.msg_id;

    // The rpc table holds exactly one entry until the timer fires.
    assert_eq!(kernel.pending_rpcs.len(), 1);
    kernel.submit(KernelEvent::TimeoutExpired { correlation: msg_id });
    kernel.tick(1).unwrap();
    // First expiry consumed the entry and re-registered a retry.
    assert_eq!(kernel.pending_rpcs.len(), 1);
    assert!(!kernel.pending_rpcs.contains_key(&msg_id));

    // A stale duplicate expiry for the settled id is a no-op.
    kernel.submit(KernelEvent::TimeoutExpired { correlation: msg_id });
    kernel.tick(2).unwrap();
    assert_eq!(kernel.pending_rpcs.len(), 1);
}

// =============================================================================
// Dedupe and role legality
// =============================================================================

fn ticket_envelope() -> Envelope {
    let reservation = crate::model::Reservation::new(
        crate::model::SliceId::from_string("slice-1"),
        ResourceType::Vm,
        "RENC",
        Capacities::compute(4, 64, 500),
        crate::time::Term::new(0, 3_600_000).unwrap(),
    );
    Envelope::request(
        ActorGuid::from_string("orchestrator-1"),
        "t-orc",
        MessageKind::Ticket {
            slice: SliceInfo {
                id: crate::model::SliceId::from_string("slice-1"),
                name: "demo".to_string(),
                owner: owner(),
                graph_id: None,
            },
            reservations: vec![reservation],
        },
    )
}

#[test]
fn test_duplicate_msg_id_is_processed_once() {
    let mut kernel = broker();
    seed_delegation(&mut kernel);
    let envelope = ticket_envelope();

    kernel.submit(KernelEvent::Message(envelope.clone()));
    kernel.submit(KernelEvent::Message(envelope));
    let report = kernel.tick(0).unwrap();

    let replies: Vec<_> = report
        .outbound
        .iter()
        .filter(|o| o.envelope.kind.name() == "UPDATE_TICKET")
        .collect();
    assert_eq!(replies.len(), 1);
}

#[test]
fn test_replayed_ticket_gets_identical_answer() {
    let mut kernel = broker();
    seed_delegation(&mut kernel);

    let mut first = ticket_envelope();
    kernel.submit(KernelEvent::Message(first.clone()));
    let report = kernel.tick(0).unwrap();
    let MessageKind::UpdateTicket { reservation, .. } = &report.outbound[0].envelope.kind else {
        panic!("expected an update ticket");
    };
    let first_node = reservation.node_map.clone().unwrap();

    // Same reservation, new message id: at-least-once redelivery beyond
    // the dedupe window.
    first.msg_id = uuid::Uuid::new_v4();
    kernel.submit(KernelEvent::Message(first));
    let report = kernel.tick(1).unwrap();
    let MessageKind::UpdateTicket { reservation, status } = &report.outbound[0].envelope.kind
    else {
        panic!("expected an update ticket");
    };
    assert!(status.ok);
    assert_eq!(reservation.node_map.clone().unwrap(), first_node);
    assert_eq!(kernel.calendar().holdings().count_on("w1"), 1);
}

#[test]
fn test_role_rejects_foreign_kind() {
    let mut kernel = broker();
    let envelope = Envelope::request(
        ActorGuid::from_string("orchestrator-1"),
        "t-orc",
        MessageKind::Redeem {
            slice: SliceInfo {
                id: crate::model::SliceId::from_string("slice-1"),
                name: "demo".to_string(),
                owner: owner(),
                graph_id: None,
            },
            reservation: Box::new(crate::model::Reservation::new(
                crate::model::SliceId::from_string("slice-1"),
                ResourceType::Vm,
                "RENC",
                Capacities::compute(4, 64, 500),
                crate::time::Term::new(0, 3_600_000).unwrap(),
            )),
        },
    );
    kernel.submit(KernelEvent::Message(envelope));
    let report = kernel.tick(0).unwrap();
    assert!(report.outbound.is_empty());
    assert!(kernel.state().reservations.is_empty());
}

// =============================================================================
// Authorization
// =============================================================================

struct DenyAll;

impl DecisionPoint for DenyAll {
    fn decide(&self, _: AuthAction, _: AuthResource, _: Option<&str>) -> Decision {
        Decision::deny("closed for maintenance")
    }
}

#[test]
fn test_denied_command_never_mutates_state() {
    let mut graph = SubstrateGraph::new("cbm-1");
    graph.add_node(worker("w1", "RENC"));
    let mut kernel = Kernel::new(
        config(ActorRole::Broker, "t-broker"),
        Box::new(BrokerFirstFitPolicy::new()),
        Box::new(DenyAll),
        SqliteStore::in_memory().unwrap(),
        graph,
    );
    seed_delegation(&mut kernel);

    kernel.submit(KernelEvent::Message(ticket_envelope()));
    let report = kernel.tick(0).unwrap();

    assert!(kernel.state().reservations.is_empty());
    assert!(kernel.calendar().holdings().is_empty());
    let MessageKind::UpdateTicket { status, .. } = &report.outbound[0].envelope.kind else {
        panic!("expected a denial reply");
    };
    assert!(!status.ok);
    assert_eq!(
        status.error.as_ref().unwrap().kind,
        ErrorKind::Unauthorized
    );
}

// =============================================================================
// Helpers
// =============================================================================

pub(crate) fn seed_delegation(kernel: &mut Kernel) {
    use std::collections::BTreeMap;

    use crate::model::{Delegation, DelegationState, NodeDelegation};

    let mut nodes = BTreeMap::new();
    for node in kernel.graph.nodes.values() {
        nodes.insert(
            node.id.clone(),
            NodeDelegation {
                capacities: node.total,
                vlans: Vec::new(),
            },
        );
    }
    let mut delegation = Delegation::new(
        ActorGuid::from_string("authority-renc"),
        kernel.guid().clone(),
        kernel.graph.id.clone(),
        "RENC",
        nodes,
    );
    delegation.state = DelegationState::Delegated;
    kernel.register_delegation(delegation).unwrap();
}
