//! Substrate provisioning handlers and their registry.
//!
//! Handlers are the substrate-specific drivers invoked by an authority
//! after a reservation is redeemed: provision at lease start, teardown at
//! close, and a deletion probe used during crash recovery. Drivers
//! themselves are external; the core ships the trait, a compile-time
//! registry keyed by resource-type strings, and a no-op implementation
//! for tests and dry runs.
//!
//! Handlers run on the daemon's bounded provisioning pool, never on the
//! kernel thread; the kernel only sees completion events.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::model::Reservation;

/// Result of a provision or teardown invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    /// `true` when the sliver was provisioned or torn down.
    pub ok: bool,
    /// Free-form failure detail when `ok` is `false`.
    pub message: String,
    /// Properties to merge into the reservation, e.g. assigned IPs or an
    /// instance id.
    pub properties: BTreeMap<String, String>,
}

impl HandlerOutcome {
    /// A successful outcome with no extra properties.
    #[must_use]
    pub fn success() -> Self {
        Self {
            ok: true,
            message: String::new(),
            properties: BTreeMap::new(),
        }
    }

    /// A successful outcome carrying handler properties.
    #[must_use]
    pub fn success_with(properties: BTreeMap<String, String>) -> Self {
        Self {
            ok: true,
            message: String::new(),
            properties,
        }
    }

    /// A failed outcome with the handler's message.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            properties: BTreeMap::new(),
        }
    }
}

/// A substrate driver for one resource type.
///
/// Implementations may block; they are always called off the kernel
/// thread.
pub trait Handler: Send + Sync {
    /// Realizes the sliver on the substrate.
    fn provision(&self, reservation: &Reservation) -> HandlerOutcome;

    /// Tears the sliver down.
    fn teardown(&self, reservation: &Reservation) -> HandlerOutcome;

    /// Recovery probe: `true` if the substrate no longer carries the
    /// sliver, so a reservation recovered mid-provision must be failed.
    fn is_deleted(&self, reservation: &Reservation) -> bool {
        let _ = reservation;
        false
    }
}

/// Registry mapping resource-type strings to handler implementations.
///
/// Populated at boot from the `actor.resources` config section; the
/// config maps type strings to registry keys, so swapping a driver is a
/// config change, not a code change.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a resource-type string.
    pub fn register(&mut self, rtype: impl Into<String>, handler: Arc<dyn Handler>) {
        let rtype = rtype.into();
        debug!(rtype = %rtype, "handler registered");
        self.handlers.insert(rtype, handler);
    }

    /// Looks up the handler for a resource type.
    #[must_use]
    pub fn get(&self, rtype: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(rtype).cloned()
    }

    /// Registered resource-type strings.
    #[must_use]
    pub fn types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}

/// Handler that succeeds immediately, for tests and dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl Handler for NoopHandler {
    fn provision(&self, reservation: &Reservation) -> HandlerOutcome {
        let mut properties = BTreeMap::new();
        properties.insert(
            "instance_id".to_string(),
            format!("noop-{}", reservation.id),
        );
        HandlerOutcome::success_with(properties)
    }

    fn teardown(&self, _reservation: &Reservation) -> HandlerOutcome {
        HandlerOutcome::success()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::model::{Capacities, Reservation, ResourceType, SliceId};
    use crate::time::Term;

    use super::{Handler, HandlerRegistry, NoopHandler};

    fn reservation() -> Reservation {
        Reservation::new(
            SliceId::from_string("slice-1"),
            ResourceType::Vm,
            "RENC",
            Capacities::compute(4, 64, 500),
            Term::new(0, 3_600_000).unwrap(),
        )
    }

    #[test]
    fn test_registry_lookup_by_type_string() {
        let mut registry = HandlerRegistry::new();
        registry.register("VM", Arc::new(NoopHandler));
        assert!(registry.get("VM").is_some());
        assert!(registry.get("Baremetal").is_none());
        assert_eq!(registry.types(), vec!["VM"]);
    }

    #[test]
    fn test_noop_handler_reports_instance_id() {
        let reservation = reservation();
        let outcome = NoopHandler.provision(&reservation);
        assert!(outcome.ok);
        assert!(outcome.properties.contains_key("instance_id"));
        assert!(!NoopHandler.is_deleted(&reservation));
    }
}
