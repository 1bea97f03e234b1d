//! Black-box authorization wrapper around the external decision point.
//!
//! Every inbound user-origin command is wrapped in a decision request
//! before it can touch state. The decision point itself (an external PDP
//! service) is out of scope; the kernel only sees the trait. A deny never
//! mutates state: the command is rejected with the decision's message.

use serde::{Deserialize, Serialize};

/// Actions submitted to the decision point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthAction {
    /// Resource availability query.
    Query,
    /// Demand new reservations.
    Demand,
    /// Update an existing reservation.
    Update,
    /// Close a slice or reservation.
    Close,
    /// Claim a delegation.
    Claim,
    /// Reclaim a delegation.
    Reclaim,
    /// Request a ticket.
    Ticket,
}

/// Resource classes named in decision requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthResource {
    /// A delegation.
    Delegation,
    /// A user record.
    User,
    /// A slice.
    Slice,
    /// A sliver.
    Sliver,
    /// Aggregate resource listings.
    Resources,
}

/// Outcome of a decision request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// `true` when the command may proceed.
    pub allowed: bool,
    /// Message surfaced to the caller on deny.
    pub message: String,
}

impl Decision {
    /// An allow decision.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            message: String::new(),
        }
    }

    /// A deny decision with the given message.
    #[must_use]
    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            message: message.into(),
        }
    }
}

/// The decision point consulted before user-origin commands.
pub trait DecisionPoint: Send {
    /// Decides whether the command may proceed.
    fn decide(&self, action: AuthAction, resource: AuthResource, token: Option<&str>) -> Decision;
}

/// Decision point used when `pdp.enable` is off: every command proceeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl DecisionPoint for AllowAll {
    fn decide(&self, _action: AuthAction, _resource: AuthResource, _token: Option<&str>) -> Decision {
        Decision::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::{AllowAll, AuthAction, AuthResource, Decision, DecisionPoint};

    #[test]
    fn test_allow_all_always_allows() {
        let pdp = AllowAll;
        let decision = pdp.decide(AuthAction::Ticket, AuthResource::Sliver, None);
        assert!(decision.allowed);
    }

    #[test]
    fn test_deny_carries_message() {
        let decision = Decision::deny("project quota exhausted");
        assert!(!decision.allowed);
        assert_eq!(decision.message, "project quota exhausted");
    }
}
