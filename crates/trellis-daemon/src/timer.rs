//! Deadline service: fires request timeouts back into the kernel queue.
//!
//! The kernel already scans cycle deadlines on every tick; this service
//! only makes expiry prompt in real-time mode by enqueueing a synthetic
//! failure event the moment the wall-clock deadline passes. Stale
//! expirations for requests that were answered in the meantime are
//! no-ops in the kernel.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;
use uuid::Uuid;

use trellis_core::kernel::KernelEvent;

/// Schedules wall-clock deadlines for in-flight requests.
#[derive(Clone)]
pub struct TimerService {
    events: mpsc::UnboundedSender<KernelEvent>,
}

impl TimerService {
    /// Creates a timer service feeding the given kernel queue.
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<KernelEvent>) -> Self {
        Self { events }
    }

    /// Schedules a timeout for the request with the given message id.
    pub fn schedule(&self, correlation: Uuid, after: Duration) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            trace!(%correlation, "request deadline fired");
            let _ = events.send(KernelEvent::TimeoutExpired { correlation });
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use uuid::Uuid;

    use trellis_core::kernel::KernelEvent;

    use super::TimerService;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_enqueues_timeout_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = TimerService::new(tx);
        let correlation = Uuid::new_v4();

        let handle = timer.schedule(correlation, Duration::from_secs(900));
        tokio::time::advance(Duration::from_secs(901)).await;
        handle.await.unwrap();

        let Some(KernelEvent::TimeoutExpired { correlation: fired }) = rx.recv().await else {
            panic!("expected a timeout event");
        };
        assert_eq!(fired, correlation);
    }
}
