//! Restart recovery and replay determinism over the wired testbed.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{peers, worker, Testbed, AUTH_TOPIC, ORC_TOPIC};

use trellis_core::authz::AllowAll;
use trellis_core::config::KernelSettings;
use trellis_core::graph::{NodeRequest, RequestGraph, SubstrateGraph};
use trellis_core::kernel::{Kernel, KernelConfig};
use trellis_core::model::{
    ActorGuid, ActorRole, Capacities, PendingState, ReservationState, ResourceType, SliceOwner,
};
use trellis_core::policy::{
    AuthorityCalendarPolicy, OrchestratorReviewPolicy, PolicySettings,
};
use trellis_core::time::ActorClock;

fn owner() -> SliceOwner {
    SliceOwner::new("alice", "proj-1")
}

fn vm_graph() -> RequestGraph {
    RequestGraph {
        id: "asm-vm".to_string(),
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

fn config(role: ActorRole, guid: &str, topic: &str) -> KernelConfig {
    KernelConfig {
        role,
        guid: ActorGuid::from_string(guid),
        topic: topic.to_string(),
        clock: ActorClock::new(0, 1000).unwrap(),
        policy_settings: PolicySettings::default(),
        kernel_settings: KernelSettings {
            grace_cycles: 50,
            ..KernelSettings::default()
        },
        rpc_retries: 5,
        rpc_timeout_cycles: 600,
        commit_batch_size: 1,
        peers: peers(),
    }
}

/// Replaces the testbed authority with a fresh kernel over the same
/// store, as a crash and restart would.
fn restart_authority(bed: &mut Testbed) -> trellis_core::kernel::RecoveryReport {
    let store = bed.authority.store().clone();
    let mut arm = SubstrateGraph::new("arm-renc");
    arm.add_node(worker("w1", "RENC"));
    let mut authority = Kernel::new(
        config(ActorRole::Authority, "authority-renc", AUTH_TOPIC),
        Box::new(AuthorityCalendarPolicy::new()),
        Box::new(AllowAll),
        store,
        arm,
    );
    let report = authority.recover().unwrap();
    bed.authority = authority;
    report
}

// =============================================================================
// Crash while priming
// =============================================================================

#[test]
fn test_restart_in_priming_probes_then_resumes() {
    let mut bed = Testbed::new(1);
    bed.auto_provision = false;
    bed.orchestrator
        .create_slice("interrupted", owner(), vm_graph(), Some(3_600_000))
        .unwrap();

    // Run until the authority handed the sliver to its handler and is
    // waiting for completion.
    bed.run_to(4);
    assert_eq!(bed.held.len(), 1);
    let member = bed.authority.state().reservations.values().next().unwrap();
    assert_eq!(member.state, ReservationState::Ticketed);
    assert_eq!(member.pending, PendingState::Priming);

    // Crash: the in-flight handler invocation is lost with the process.
    bed.held.clear();
    let report = restart_authority(&mut bed);
    assert_eq!(report.reservations, 1);
    assert_eq!(report.probes, 1);
    assert_eq!(report.holdings, 1);

    // The probe finds the sliver still present and provisioning resumes.
    bed.auto_provision = true;
    bed.run_to(10);
    assert_eq!(
        Testbed::states_of(&bed.orchestrator),
        vec![ReservationState::Active]
    );
    assert_eq!(bed.authority.calendar().holdings().count_on("w1"), 1);
}

#[test]
fn test_restart_in_priming_fails_when_sliver_is_gone() {
    let mut bed = Testbed::new(1);
    bed.auto_provision = false;
    bed.orchestrator
        .create_slice("orphaned", owner(), vm_graph(), Some(3_600_000))
        .unwrap();
    bed.run_to(4);
    bed.held.clear();

    restart_authority(&mut bed);
    // The probe reports the sliver deleted while the actor was down.
    bed.handlers
        .insert("VM".to_string(), Arc::new(common::DeletedHandler));
    bed.auto_provision = true;
    bed.run_to(10);

    let member = bed.orchestrator.state().reservations.values().next().unwrap();
    assert_eq!(member.state, ReservationState::Failed);
    assert_eq!(
        member.last_error.as_ref().unwrap().kind,
        trellis_core::error::ErrorKind::HandlerFailure
    );
    assert_eq!(Testbed::holdings_of(&bed.authority), 0);
}

// =============================================================================
// Orchestrator restart mid-request
// =============================================================================

#[test]
fn test_orchestrator_restart_reissues_and_converges() {
    let mut bed = Testbed::new(1);
    bed.orchestrator
        .create_slice("reissued", owner(), vm_graph(), Some(3_600_000))
        .unwrap();

    // The ticket request is in flight when the orchestrator dies.
    bed.run_to(0);
    let store = bed.orchestrator.store().clone();
    let mut orchestrator = Kernel::new(
        config(ActorRole::Orchestrator, "orchestrator-1", ORC_TOPIC),
        Box::new(OrchestratorReviewPolicy::new()),
        Box::new(AllowAll),
        store,
        SubstrateGraph::new("empty"),
    );
    orchestrator.recover().unwrap();
    bed.orchestrator = orchestrator;

    // The re-issued ticket is absorbed idempotently by the broker and
    // the flow completes.
    bed.run_to(10);
    assert_eq!(
        Testbed::states_of(&bed.orchestrator),
        vec![ReservationState::Active]
    );
    assert_eq!(bed.broker.calendar().holdings().count_on("w1"), 1);
}

// =============================================================================
// Replay determinism
// =============================================================================

#[test]
fn test_rehydrated_state_matches_the_live_run() {
    let mut bed = Testbed::new(2);
    bed.orchestrator
        .create_slice("replayed", owner(), vm_graph(), Some(3_600_000))
        .unwrap();
    bed.run_to(10);

    let live: BTreeMap<_, _> = bed
        .authority
        .state()
        .reservations
        .iter()
        .map(|(id, r)| (id.clone(), (r.state, r.pending, r.effective_term())))
        .collect();

    let report = restart_authority(&mut bed);
    assert_eq!(report.reservations, live.len());

    let rehydrated: BTreeMap<_, _> = bed
        .authority
        .state()
        .reservations
        .iter()
        .map(|(id, r)| (id.clone(), (r.state, r.pending, r.effective_term())))
        .collect();
    assert_eq!(rehydrated, live);

    // The rebuilt calendar carries the same holdings.
    assert_eq!(bed.authority.calendar().holdings().count_on("w1"), 1);

    // Ticking continues to the same terminal state as an uninterrupted
    // run would reach.
    bed.run_to(3610);
    assert_eq!(
        Testbed::states_of(&bed.orchestrator),
        vec![ReservationState::Closed]
    );
    assert_eq!(Testbed::holdings_of(&bed.authority), 0);
}
