//! Prometheus metrics for actor health observability.
//!
//! The daemon exposes the following families at `/metrics`:
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `trellis_ticks_total` | Counter | |
//! | `trellis_queue_drained_total` | Counter | |
//! | `trellis_messages_total` | Counter | `direction`, `kind` |
//! | `trellis_reservations` | Gauge | `state` |
//! | `trellis_slices` | Gauge | `state` |
//! | `trellis_holdings` | Gauge | |
//! | `trellis_provision_dispatched_total` | Counter | `kind` |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, IntCounter, Opts, Registry, TextEncoder};
use thiserror::Error;
use tracing::info;

/// Errors from metrics registration or encoding.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetricsError {
    /// Prometheus registration failed.
    #[error("metrics registration failed: {0}")]
    Registration(#[from] prometheus::Error),
}

/// The actor's metric families.
pub struct ActorMetrics {
    registry: Registry,
    /// Kernel ticks executed.
    pub ticks_total: IntCounter,
    /// Events drained from the kernel queue.
    pub queue_drained_total: IntCounter,
    /// Messages by direction (`in`/`out`) and kind.
    pub messages_total: CounterVec,
    /// Reservations currently held, by state.
    pub reservations: GaugeVec,
    /// Slices currently held, by state.
    pub slices: GaugeVec,
    /// Calendar holdings across all nodes.
    pub holdings: Gauge,
    /// Handler invocations dispatched, by kind.
    pub provision_dispatched_total: CounterVec,
}

impl ActorMetrics {
    /// Creates and registers the metric families.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] when a family cannot be registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let ticks_total =
            IntCounter::with_opts(Opts::new("trellis_ticks_total", "Kernel ticks executed"))?;
        let queue_drained_total = IntCounter::with_opts(Opts::new(
            "trellis_queue_drained_total",
            "Events drained from the kernel queue",
        ))?;
        let messages_total = CounterVec::new(
            Opts::new("trellis_messages_total", "Protocol messages by direction"),
            &["direction", "kind"],
        )?;
        let reservations = GaugeVec::new(
            Opts::new("trellis_reservations", "Reservations by state"),
            &["state"],
        )?;
        let slices = GaugeVec::new(Opts::new("trellis_slices", "Slices by state"), &["state"])?;
        let holdings = Gauge::with_opts(Opts::new(
            "trellis_holdings",
            "Calendar holdings across all nodes",
        ))?;
        let provision_dispatched_total = CounterVec::new(
            Opts::new(
                "trellis_provision_dispatched_total",
                "Handler invocations dispatched",
            ),
            &["kind"],
        )?;

        registry.register(Box::new(ticks_total.clone()))?;
        registry.register(Box::new(queue_drained_total.clone()))?;
        registry.register(Box::new(messages_total.clone()))?;
        registry.register(Box::new(reservations.clone()))?;
        registry.register(Box::new(slices.clone()))?;
        registry.register(Box::new(holdings.clone()))?;
        registry.register(Box::new(provision_dispatched_total.clone()))?;

        Ok(Self {
            registry,
            ticks_total,
            queue_drained_total,
            messages_total,
            reservations,
            slices,
            holdings,
            provision_dispatched_total,
        })
    }

    /// Renders the registry in the Prometheus text format.
    #[must_use]
    pub fn encode_text(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Serves `/metrics` and `/healthz` on the given port.
///
/// # Errors
///
/// Returns an I/O error when the listener cannot bind.
pub async fn serve(metrics: Arc<ActorMetrics>, port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics);
                async move { metrics.encode_text() }
            }),
        )
        .route("/healthz", get(|| async { "ok" }));
    info!(%addr, "metrics listener started");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::ActorMetrics;

    #[test]
    fn test_families_register_and_encode() {
        let metrics = ActorMetrics::new().unwrap();
        metrics.ticks_total.inc();
        metrics
            .messages_total
            .with_label_values(&["in", "TICKET"])
            .inc();
        metrics.reservations.with_label_values(&["ACTIVE"]).set(3.0);

        let text = metrics.encode_text();
        assert!(text.contains("trellis_ticks_total 1"));
        assert!(text.contains("trellis_messages_total"));
        assert!(text.contains("trellis_reservations"));
    }
}
