//! The actor runtime: wires the kernel to the bus, timer, and pool.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use trellis_core::authz::AllowAll;
use trellis_core::config::ActorConfig;
use trellis_core::graph::SubstrateGraph;
use trellis_core::handler::{HandlerRegistry, NoopHandler};
use trellis_core::kernel::{Kernel, KernelConfig, KernelEvent, TickReport};
use trellis_core::model::ActorRole;
use trellis_core::policy::{
    AuthorityCalendarPolicy, BrokerFirstFitPolicy, OrchestratorReviewPolicy, Policy,
};
use trellis_core::protocol::Envelope;
use trellis_core::store::SqliteStore;
use trellis_core::time::ActorClock;

use crate::bus::{publish_with_retry, MessageBus};
use crate::metrics::ActorMetrics;
use crate::provision::ProvisionPool;
use crate::timer::TimerService;

/// Fixed backoff between producer retries.
const PUBLISH_BACKOFF: Duration = Duration::from_millis(500);

/// Selects the policy module for a role, as `actor.type` dictates.
#[must_use]
pub fn policy_for_role(role: ActorRole) -> Box<dyn Policy> {
    match role {
        ActorRole::Orchestrator => Box::new(OrchestratorReviewPolicy::new()),
        ActorRole::Broker => Box::new(BrokerFirstFitPolicy::new()),
        ActorRole::Authority => Box::new(AuthorityCalendarPolicy::new()),
    }
}

/// Resolves an `actor.policy` name from the compile-time registry of
/// policy modules; an unknown name falls back to the role default.
#[must_use]
pub fn policy_by_name(name: Option<&str>, role: ActorRole) -> Box<dyn Policy> {
    match name {
        Some("broker-first-fit") => Box::new(BrokerFirstFitPolicy::new()),
        Some("authority-calendar") => Box::new(AuthorityCalendarPolicy::new()),
        Some("orchestrator-ticket-review") => Box::new(OrchestratorReviewPolicy::new()),
        Some(other) => {
            warn!(policy = other, "unknown policy name, using the role default");
            policy_for_role(role)
        }
        None => policy_for_role(role),
    }
}

/// Builds the handler registry from the `actor.resources` config map.
///
/// The registry of implementations is fixed at compile time; the config
/// decides which resource types bind to which implementation key.
#[must_use]
pub fn build_registry(resources: &std::collections::BTreeMap<String, String>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for (rtype, key) in resources {
        match key.as_str() {
            "noop" => registry.register(rtype.clone(), Arc::new(NoopHandler)),
            other => warn!(rtype = %rtype, key = other, "unknown handler key, skipped"),
        }
    }
    registry
}

/// One runnable actor: kernel plus its I/O machinery.
pub struct ActorRuntime {
    kernel: Kernel,
    bus: Arc<dyn MessageBus>,
    pool: ProvisionPool,
    timer: TimerService,
    metrics: Arc<ActorMetrics>,
    events_tx: mpsc::UnboundedSender<KernelEvent>,
    events_rx: mpsc::UnboundedReceiver<KernelEvent>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    cycle_millis: u64,
    manual: bool,
    manual_cycle: u64,
    rpc_timeout: Duration,
    publish_retries: u32,
    clock: ActorClock,
}

impl ActorRuntime {
    /// Assembles an actor from its parsed config.
    ///
    /// # Errors
    ///
    /// Fails when the clock settings are invalid or recovery cannot read
    /// the store back.
    pub fn build(
        config: &ActorConfig,
        store: SqliteStore,
        graph: SubstrateGraph,
        bus: Arc<dyn MessageBus>,
        metrics: Arc<ActorMetrics>,
    ) -> anyhow::Result<Self> {
        let clock = ActorClock::from_settings(&config.time).context("invalid clock settings")?;
        let mut kernel = Kernel::new(
            KernelConfig::from_actor_config(config, clock),
            policy_by_name(config.actor.policy.as_deref(), config.actor.role),
            Box::new(AllowAll),
            store,
            graph,
        );
        let report = kernel.recover().context("recovery failed")?;
        info!(
            slices = report.slices,
            reservations = report.reservations,
            "actor state rehydrated"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inbound = bus.subscribe(&config.actor.topic);
        let pool = ProvisionPool::new(
            build_registry(&config.actor.resources),
            config.kernel.provision_pool_size,
            events_tx.clone(),
        );
        let timer = TimerService::new(events_tx.clone());

        #[allow(clippy::cast_sign_loss)]
        let cycle_millis = config.time.cycle_millis.max(1) as u64;
        Ok(Self {
            kernel,
            bus,
            pool,
            timer,
            metrics,
            events_tx,
            events_rx,
            inbound,
            cycle_millis,
            manual: config.time.manual,
            manual_cycle: config.time.first_tick,
            rpc_timeout: Duration::from_secs(config.transport.rpc_request_timeout_seconds),
            publish_retries: config.transport.rpc_retries,
            clock,
        })
    }

    /// A handle embedders use to submit local commands.
    #[must_use]
    pub fn command_handle(&self) -> mpsc::UnboundedSender<KernelEvent> {
        self.events_tx.clone()
    }

    /// Runs the actor loop until `shutdown` flips to `true`.
    ///
    /// # Errors
    ///
    /// Returns an error when a kernel tick cannot commit its batch.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(Duration::from_millis(self.cycle_millis));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(role = %self.kernel.role(), "actor loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let cycle = self.next_cycle();
                    let report = self.kernel.tick(cycle)?;
                    self.apply_report(report).await;
                }
                Some(envelope) = self.inbound.recv() => {
                    self.metrics
                        .messages_total
                        .with_label_values(&["in", envelope.kind.name()])
                        .inc();
                    self.kernel.submit(KernelEvent::Message(envelope));
                }
                Some(event) = self.events_rx.recv() => {
                    self.kernel.submit(event);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Final tick drains queues and commits the last batch before the
        // process goes away.
        let cycle = self.next_cycle();
        let report = self.kernel.tick(cycle)?;
        self.apply_report(report).await;
        info!("actor loop stopped");
        Ok(())
    }

    fn next_cycle(&mut self) -> u64 {
        if self.manual {
            let cycle = self.manual_cycle;
            self.manual_cycle += 1;
            cycle
        } else {
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
                .unwrap_or_default();
            self.clock.cycle(now_ms)
        }
    }

    async fn apply_report(&mut self, report: TickReport) {
        self.metrics.ticks_total.inc();
        self.metrics
            .queue_drained_total
            .inc_by(report.drained as u64);

        for outbound in report.outbound {
            self.metrics
                .messages_total
                .with_label_values(&["out", outbound.envelope.kind.name()])
                .inc();
            // Requests the kernel is waiting on also get a wall-clock
            // deadline so expiry is prompt in real-time mode.
            if self.kernel.has_pending_rpc(&outbound.envelope.msg_id) {
                self.timer
                    .schedule(outbound.envelope.msg_id, self.rpc_timeout);
            }
            publish_with_retry(
                self.bus.as_ref(),
                &outbound.topic,
                &outbound.envelope,
                self.publish_retries,
                PUBLISH_BACKOFF,
            )
            .await;
        }

        for request in report.provision {
            self.metrics
                .provision_dispatched_total
                .with_label_values(&[match request.kind {
                    trellis_core::kernel::ProvisionKind::Provision => "provision",
                    trellis_core::kernel::ProvisionKind::Teardown => "teardown",
                    trellis_core::kernel::ProvisionKind::Probe => "probe",
                }])
                .inc();
            self.pool.dispatch(request);
        }

        let (reservations, slices, holdings) = self.kernel.gauge_counts();
        for (state, count) in reservations {
            #[allow(clippy::cast_precision_loss)]
            self.metrics
                .reservations
                .with_label_values(&[state])
                .set(count as f64);
        }
        for (state, count) in slices {
            #[allow(clippy::cast_precision_loss)]
            self.metrics
                .slices
                .with_label_values(&[state])
                .set(count as f64);
        }
        #[allow(clippy::cast_precision_loss)]
        self.metrics.holdings.set(holdings as f64);
    }
}
