//! The message bus: at-least-once ordered delivery between named topics.
//!
//! The wire transport (Kafka with an Avro registry in production) is an
//! external collaborator; the daemon only depends on this trait. The
//! in-process implementation backs tests and single-host deployments,
//! and preserves the transport's contract: per-topic ordering and
//! at-least-once delivery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use trellis_core::protocol::Envelope;

/// Errors surfaced by bus operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BusError {
    /// The payload exceeds the configured maximum.
    #[error("message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge {
        /// Encoded size.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// The topic has no consumer and the send was dropped.
    #[error("topic {topic} has no consumer")]
    NoConsumer {
        /// Destination topic.
        topic: String,
    },

    /// Payload could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// An ordered, at-least-once bus between named topics.
pub trait MessageBus: Send + Sync {
    /// Publishes an envelope to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] for oversized payloads or a missing topic.
    fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BusError>;

    /// Subscribes to a topic, returning its consumer channel.
    ///
    /// One consumer per topic; a second subscription replaces the first,
    /// matching the single consumer-group model of the wire transport.
    fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Envelope>;
}

/// In-process bus used by tests and single-host deployments.
#[derive(Clone)]
pub struct InMemoryBus {
    topics: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>>,
    message_max_bytes: usize,
}

impl InMemoryBus {
    /// Creates a bus with the given payload limit.
    #[must_use]
    pub fn new(message_max_bytes: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            message_max_bytes,
        }
    }
}

impl MessageBus for InMemoryBus {
    fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BusError> {
        let bytes = envelope.encode()?;
        if bytes.len() > self.message_max_bytes {
            return Err(BusError::MessageTooLarge {
                size: bytes.len(),
                limit: self.message_max_bytes,
            });
        }
        let topics = self.topics.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(sender) = topics.get(topic) else {
            return Err(BusError::NoConsumer {
                topic: topic.to_string(),
            });
        };
        if sender.send(envelope.clone()).is_err() {
            return Err(BusError::NoConsumer {
                topic: topic.to_string(),
            });
        }
        debug!(topic, kind = envelope.kind.name(), "message published");
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self
            .topics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        topics.insert(topic.to_string(), tx);
        rx
    }
}

/// Publishes with bounded retries and fixed backoff.
///
/// Transport errors are retried `retries` times before the message is
/// dropped; the kernel's own request deadline then fails the operation
/// as a timeout.
pub async fn publish_with_retry(
    bus: &dyn MessageBus,
    topic: &str,
    envelope: &Envelope,
    retries: u32,
    backoff: Duration,
) {
    for attempt in 1..=retries.max(1) {
        match bus.publish(topic, envelope) {
            Ok(()) => return,
            Err(err) => {
                warn!(
                    topic,
                    attempt,
                    error = %err,
                    "publish failed"
                );
                if attempt < retries {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
