//! Bounded provisioning pool for handler invocations.
//!
//! Handlers may block on substrate APIs or subprocess I/O, so they run
//! on blocking worker slots gated by a semaphore, never on the kernel
//! thread. Completions re-enter the kernel queue as events.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use trellis_core::handler::HandlerRegistry;
use trellis_core::kernel::{KernelEvent, ProvisionKind, ProvisionRequest};

/// Runs handler invocations with bounded concurrency.
#[derive(Clone)]
pub struct ProvisionPool {
    registry: HandlerRegistry,
    slots: Arc<Semaphore>,
    events: mpsc::UnboundedSender<KernelEvent>,
}

impl ProvisionPool {
    /// Creates a pool with `size` concurrent slots.
    #[must_use]
    pub fn new(
        registry: HandlerRegistry,
        size: usize,
        events: mpsc::UnboundedSender<KernelEvent>,
    ) -> Self {
        Self {
            registry,
            slots: Arc::new(Semaphore::new(size.max(1))),
            events,
        }
    }

    /// Dispatches one handler invocation.
    ///
    /// A missing handler completes immediately as a failure so the
    /// kernel can fail the reservation instead of waiting forever.
    pub fn dispatch(&self, request: ProvisionRequest) {
        let rtype = request.reservation.rtype.as_str();
        let Some(handler) = self.registry.get(rtype) else {
            warn!(rtype, "no handler registered");
            let _ = self.events.send(KernelEvent::HandlerCompleted {
                reservation: request.reservation.id.clone(),
                kind: request.kind,
                ok: false,
                message: format!("no handler registered for {rtype}"),
                properties: std::collections::BTreeMap::new(),
            });
            return;
        };

        let slots = Arc::clone(&self.slots);
        let events = self.events.clone();
        tokio::spawn(async move {
            let Ok(_permit) = slots.acquire_owned().await else {
                return;
            };
            let rid = request.reservation.id.clone();
            let kind = request.kind;
            debug!(reservation = %rid, ?kind, "handler invocation started");
            let outcome = tokio::task::spawn_blocking(move || match kind {
                ProvisionKind::Provision => {
                    let outcome = handler.provision(&request.reservation);
                    (outcome.ok, outcome.message, outcome.properties)
                }
                ProvisionKind::Teardown => {
                    let outcome = handler.teardown(&request.reservation);
                    (outcome.ok, outcome.message, outcome.properties)
                }
                ProvisionKind::Probe => {
                    let present = !handler.is_deleted(&request.reservation);
                    (present, String::new(), std::collections::BTreeMap::new())
                }
            })
            .await;

            let (ok, message, properties) = match outcome {
                Ok(result) => result,
                Err(err) => (
                    false,
                    format!("handler panicked: {err}"),
                    std::collections::BTreeMap::new(),
                ),
            };
            let _ = events.send(KernelEvent::HandlerCompleted {
                reservation: rid,
                kind,
                ok,
                message,
                properties,
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use trellis_core::handler::{HandlerRegistry, NoopHandler};
    use trellis_core::kernel::{KernelEvent, ProvisionKind, ProvisionRequest};
    use trellis_core::model::{Capacities, Reservation, ResourceType, SliceId};
    use trellis_core::time::Term;

    use super::ProvisionPool;

    fn reservation() -> Reservation {
        Reservation::new(
            SliceId::from_string("slice-1"),
            ResourceType::Vm,
            "RENC",
            Capacities::compute(4, 64, 500),
            Term::new(0, 3_600_000).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_provision_completion_reenters_queue() {
        let mut registry = HandlerRegistry::new();
        registry.register("VM", Arc::new(NoopHandler));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = ProvisionPool::new(registry, 2, tx);

        pool.dispatch(ProvisionRequest {
            reservation: reservation(),
            kind: ProvisionKind::Provision,
        });

        let Some(KernelEvent::HandlerCompleted { ok, properties, .. }) = rx.recv().await else {
            panic!("expected a completion event");
        };
        assert!(ok);
        assert!(properties.contains_key("instance_id"));
    }

    #[tokio::test]
    async fn test_missing_handler_fails_fast() {
        let registry = HandlerRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = ProvisionPool::new(registry, 2, tx);

        pool.dispatch(ProvisionRequest {
            reservation: reservation(),
            kind: ProvisionKind::Provision,
        });

        let Some(KernelEvent::HandlerCompleted { ok, message, .. }) = rx.recv().await else {
            panic!("expected a completion event");
        };
        assert!(!ok);
        assert!(message.contains("no handler"));
    }
}
