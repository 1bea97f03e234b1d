//! Error taxonomy shared by every actor role.
//!
//! Every failure that can surface on a reservation is classified by
//! [`ErrorKind`]. The kind decides propagation: transport errors are
//! retried before they surface as timeouts, policy refusals fail the
//! reservation immediately, and internal errors quarantine a single
//! reservation without halting the actor.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of reservation and actor failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorKind {
    /// Malformed request: schema violation, name collision, bad lease bounds.
    InvalidRequest,
    /// Authorization denied by the decision point or an invalid token.
    Unauthorized,
    /// Policy could not satisfy the requested capacities or components.
    InsufficientResources,
    /// A predecessor reservation failed, failing this dependent.
    PredecessorFailed,
    /// An outgoing request exceeded its deadline after all retries.
    Timeout,
    /// A provision or teardown handler returned an error.
    HandlerFailure,
    /// Retryable transport failure.
    TransportError,
    /// Unexpected internal error; the offending event is persisted.
    Internal,
}

impl ErrorKind {
    /// Returns the kind as a stable string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InsufficientResources => "INSUFFICIENT_RESOURCES",
            Self::PredecessorFailed => "PREDECESSOR_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::HandlerFailure => "HANDLER_FAILURE",
            Self::TransportError => "TRANSPORT_ERROR",
            Self::Internal => "INTERNAL",
        }
    }

    /// Returns `true` if the failure may be retried by the producer.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportError)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-visible failure recorded on a reservation under `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Free-form message, copied from the underlying handler when present.
    pub message: String,
}

impl LastError {
    /// Creates a new error record.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for LastError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Errors produced by the core state machine, calendar, and policies.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Request failed validation before touching any state.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The decision point denied the command.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// No node satisfied the requested capacities and components.
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    /// An illegal state transition was attempted.
    #[error("illegal transition for reservation {reservation}: {from} -> {to}")]
    IllegalTransition {
        /// Reservation the transition was attempted on.
        reservation: String,
        /// State the reservation was in.
        from: String,
        /// State the transition targeted.
        to: String,
    },

    /// The referenced entity does not exist in the arena.
    #[error("unknown {entity}: {id}")]
    NotFound {
        /// Entity kind, e.g. `reservation` or `slice`.
        entity: &'static str,
        /// Identifier that failed to resolve.
        id: String,
    },

    /// Persistence layer failure.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Payload serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Clock or term arithmetic failure.
    #[error("time error: {0}")]
    Time(String),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Maps the error onto the reservation failure taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) | Self::Time(_) => ErrorKind::InvalidRequest,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::InsufficientResources(_) => ErrorKind::InsufficientResources,
            Self::IllegalTransition { .. }
            | Self::NotFound { .. }
            | Self::Store(_)
            | Self::Serialization(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Convenience alias used across the core crate.
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
