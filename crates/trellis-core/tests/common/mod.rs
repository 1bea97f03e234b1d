//! Three-actor test harness: wires an orchestrator, a broker, and an
//! authority over an in-process topic router with a manual clock.

use std::collections::BTreeMap;
use std::sync::Arc;

use trellis_core::authz::AllowAll;
use trellis_core::config::KernelSettings;
use trellis_core::graph::{ComponentInventory, ConnectionPoint, GraphNode, SubstrateGraph};
use trellis_core::handler::{Handler, NoopHandler};
use trellis_core::kernel::{
    Kernel, KernelConfig, KernelEvent, ProvisionRequest, TickReport,
};
use trellis_core::model::{
    ActorGuid, ActorRole, Capacities, Delegation, DelegationState, NodeDelegation, Peer,
    ReservationState,
};
use trellis_core::policy::{
    AuthorityCalendarPolicy, BrokerFirstFitPolicy, OrchestratorReviewPolicy, PolicySettings,
};
use trellis_core::store::SqliteStore;
use trellis_core::time::ActorClock;

pub const ORC_TOPIC: &str = "t-orc";
pub const BROKER_TOPIC: &str = "t-broker";
pub const AUTH_TOPIC: &str = "t-auth";

/// One substrate worker with a shared NIC, a GPU, and a dedicated NIC.
pub fn worker(id: &str, site: &str) -> GraphNode {
    GraphNode {
        id: id.to_string(),
        name: format!("{site}-{id}"),
        site: site.to_string(),
        rtype: trellis_core::model::ResourceType::Vm,
        total: Capacities {
            cores: 32,
            ram_gb: 384,
            disk_gb: 3000,
            bandwidth_gbps: 100,
        },
        components: vec![
            ComponentInventory {
                name: "nic1".to_string(),
                model: "SmartNIC-CX6".to_string(),
                bdf: "0000:41:00.0".to_string(),
                shared: true,
                vlan_pool: vec![100, 101, 102, 103],
                mac_pool: vec![
                    "02:00:00:00:01:00".to_string(),
                    "02:00:00:00:01:01".to_string(),
                    "02:00:00:00:01:02".to_string(),
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

pub fn peers() -> Vec<Peer> {
    vec![
        Peer {
            guid: ActorGuid::from_string("orchestrator-1"),
            role: ActorRole::Orchestrator,
            topic: ORC_TOPIC.to_string(),
            site: None,
            delegation: None,
        },
        Peer {
            guid: ActorGuid::from_string("broker-1"),
            role: ActorRole::Broker,
            topic: BROKER_TOPIC.to_string(),
            site: None,
            delegation: None,
        },
        Peer {
            guid: ActorGuid::from_string("authority-renc"),
            role: ActorRole::Authority,
            topic: AUTH_TOPIC.to_string(),
            site: Some("RENC".to_string()),
            delegation: Some("renc-primary".to_string()),
        },
    ]
}

fn kernel_config(role: ActorRole, guid: &str, topic: &str) -> KernelConfig {
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

/// The wired testbed.
pub struct Testbed {
    pub orchestrator: Kernel,
    pub broker: Kernel,
    pub authority: Kernel,
    pub handlers: BTreeMap<String, Arc<dyn Handler>>,
    /// `false` holds completions back, simulating a slow substrate.
    pub auto_provision: bool,
    /// Provision requests held back while `auto_provision` is off.
    pub held: Vec<ProvisionRequest>,
    next_cycle: u64,
}

impl Testbed {
    /// Builds a testbed with `workers` substrate nodes at RENC, fully
    /// delegated to the broker.
    pub fn new(workers: usize) -> Self {
        let mut arm = SubstrateGraph::new("arm-renc");
        let mut cbm = SubstrateGraph::new("arm-renc");
        for n in 1..=workers {
            arm.add_node(worker(&format!("w{n}"), "RENC"));
            cbm.add_node(worker(&format!("w{n}"), "RENC"));
        }

        let mut nodes = BTreeMap::new();
        for node in arm.nodes.values() {
            nodes.insert(
                node.id.clone(),
                NodeDelegation {
                    capacities: node.total,
                    vlans: vec![200, 201, 202],
                },
            );
        }
        let mut delegation = Delegation::new(
            ActorGuid::from_string("authority-renc"),
            ActorGuid::from_string("broker-1"),
            "arm-renc",
            "RENC",
            nodes,
        );
        delegation.state = DelegationState::Delegated;

        let orchestrator = Kernel::new(
            kernel_config(ActorRole::Orchestrator, "orchestrator-1", ORC_TOPIC),
            Box::new(OrchestratorReviewPolicy::new()),
            Box::new(AllowAll),
            SqliteStore::in_memory().unwrap(),
            SubstrateGraph::new("empty"),
        );
        let mut broker = Kernel::new(
            kernel_config(ActorRole::Broker, "broker-1", BROKER_TOPIC),
            Box::new(BrokerFirstFitPolicy::new()),
            Box::new(AllowAll),
            SqliteStore::in_memory().unwrap(),
            cbm,
        );
        let mut authority = Kernel::new(
            kernel_config(ActorRole::Authority, "authority-renc", AUTH_TOPIC),
            Box::new(AuthorityCalendarPolicy::new()),
            Box::new(AllowAll),
            SqliteStore::in_memory().unwrap(),
            arm,
        );
        broker.register_delegation(delegation.clone()).unwrap();
        authority.register_delegation(delegation).unwrap();

        let mut handlers: BTreeMap<String, Arc<dyn Handler>> = BTreeMap::new();
        handlers.insert("VM".to_string(), Arc::new(NoopHandler));
        handlers.insert("L2Bridge".to_string(), Arc::new(NoopHandler));

        Self {
            orchestrator,
            broker,
            authority,
            handlers,
            auto_provision: true,
            held: Vec::new(),
            next_cycle: 0,
        }
    }

    /// Ticks all three actors once at the given cycle and routes their
    /// output.
    pub fn tick(&mut self, cycle: u64) {
        let report = self.orchestrator.tick(cycle).unwrap();
        self.route(report);
        let report = self.broker.tick(cycle).unwrap();
        self.route(report);
        let report = self.authority.tick(cycle).unwrap();
        self.route(report);
    }

    /// Ticks every cycle up to and including `cycle`.
    pub fn run_to(&mut self, cycle: u64) {
        while self.next_cycle <= cycle {
            let current = self.next_cycle;
            self.tick(current);
            self.next_cycle = current + 1;
        }
    }

    fn route(&mut self, report: TickReport) {
        for outbound in report.outbound {
            let envelope = outbound.envelope;
            match outbound.topic.as_str() {
                ORC_TOPIC => self.orchestrator.submit(KernelEvent::Message(envelope)),
                BROKER_TOPIC => self.broker.submit(KernelEvent::Message(envelope)),
                AUTH_TOPIC => self.authority.submit(KernelEvent::Message(envelope)),
                // Unroutable topics model a dead peer.
                _ => {}
            }
        }
        for request in report.provision {
            if self.auto_provision {
                self.complete_provision(request);
            } else {
                self.held.push(request);
            }
        }
    }

    /// Runs one provision request through its handler and feeds the
    /// completion back to the authority.
    pub fn complete_provision(&mut self, request: ProvisionRequest) {
        let rtype = request.reservation.rtype.as_str();
        let Some(handler) = self.handlers.get(rtype).cloned() else {
            panic!("no handler for {rtype}");
        };
        let (ok, message, properties) = match request.kind {
            trellis_core::kernel::ProvisionKind::Provision => {
                let outcome = handler.provision(&request.reservation);
                (outcome.ok, outcome.message, outcome.properties)
            }
            trellis_core::kernel::ProvisionKind::Teardown => {
                let outcome = handler.teardown(&request.reservation);
                (outcome.ok, outcome.message, outcome.properties)
            }
            trellis_core::kernel::ProvisionKind::Probe => {
                let present = !handler.is_deleted(&request.reservation);
                (present, String::new(), BTreeMap::new())
            }
        };
        self.authority.submit(KernelEvent::HandlerCompleted {
            reservation: request.reservation.id.clone(),
            kind: request.kind,
            ok,
            message,
            properties,
        });
    }

    /// States of a kernel's reservations, in slice insertion order.
    pub fn states_of(kernel: &Kernel) -> Vec<ReservationState> {
        let mut states = Vec::new();
        for slice in kernel.state().slices.values() {
            for rid in &slice.reservations {
                if let Some(r) = kernel.state().reservations.get(rid) {
                    states.push(r.state);
                }
            }
        }
        states
    }

    /// Total holdings across all nodes at a kernel.
    pub fn holdings_of(kernel: &Kernel) -> usize {
        kernel.calendar().holdings().len()
    }
}

/// A handler whose provision always fails.
pub struct FailingHandler;

impl Handler for FailingHandler {
    fn provision(&self, _: &trellis_core::model::Reservation) -> trellis_core::handler::HandlerOutcome {
        trellis_core::handler::HandlerOutcome::failure("image not found on site")
    }

    fn teardown(&self, _: &trellis_core::model::Reservation) -> trellis_core::handler::HandlerOutcome {
        trellis_core::handler::HandlerOutcome::success()
    }
}

/// A handler whose recovery probe reports the sliver as deleted.
pub struct DeletedHandler;

impl Handler for DeletedHandler {
    fn provision(&self, _: &trellis_core::model::Reservation) -> trellis_core::handler::HandlerOutcome {
        trellis_core::handler::HandlerOutcome::success()
    }

    fn teardown(&self, _: &trellis_core::model::Reservation) -> trellis_core::handler::HandlerOutcome {
        trellis_core::handler::HandlerOutcome::success()
    }

    fn is_deleted(&self, _: &trellis_core::model::Reservation) -> bool {
        true
    }
}
