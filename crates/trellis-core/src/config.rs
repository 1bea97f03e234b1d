//! Actor configuration surface.
//!
//! One TOML file configures an actor: its role and identity, the
//! transport tunables, the logical clock, the store locations, the
//! policy settings, the handler map, and the static peer catalog.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::model::{ActorGuid, ActorRole, Peer};
use crate::policy::PolicySettings;
use crate::time::ClockSettings;

/// Identity and role of this actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActorSettings {
    /// Globally unique actor id.
    pub guid: ActorGuid,
    /// Human-readable actor name.
    pub name: String,
    /// Role: selects accepted message kinds and the policy module.
    #[serde(rename = "type")]
    pub role: ActorRole,
    /// Topic this actor consumes from.
    pub topic: String,
    /// Policy module to load; defaults to the role's standard policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    /// Map from resource-type strings to handler registry keys,
    /// authorities only.
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

/// Transport tunables for the message bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TransportSettings {
    /// Bootstrap servers for the bus.
    pub bootstrap_servers: String,
    /// Consumer group id.
    pub group_id: String,
    /// Largest message accepted, in bytes.
    pub message_max_bytes: usize,
    /// Remote attempts per request before it fails as a timeout.
    pub rpc_retries: u32,
    /// Deadline per remote request, in seconds.
    pub rpc_request_timeout_seconds: u64,
    /// Consumer poll timeout, in milliseconds.
    pub consumer_poll_timeout_ms: u64,
    /// Entities persisted per store transaction.
    pub commit_batch_size: usize,
    /// Offset auto-commit; kept off so replay starts from the last
    /// processed batch.
    pub enable_auto_commit: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            group_id: "trellis".to_string(),
            message_max_bytes: 3 * 1024 * 1024,
            rpc_retries: 5,
            rpc_request_timeout_seconds: 900,
            consumer_poll_timeout_ms: 250,
            commit_batch_size: 1,
            enable_auto_commit: false,
        }
    }
}

/// Store locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DatabaseSettings {
    /// Path of the reservation store; `:memory:` for tests.
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "trellis.db".to_string(),
        }
    }
}

/// Graph store connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GraphStoreSettings {
    /// Graph database URL; empty loads graphs from `model_path` instead.
    pub url: String,
    /// Graph database user.
    pub user: String,
    /// Path of a serialized substrate model loaded at boot.
    pub model_path: String,
}

/// External decision point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PdpSettings {
    /// `false` short-circuits every decision to allow.
    pub enable: bool,
    /// Decision endpoint URL.
    pub url: String,
}

/// Metrics exporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PrometheusSettings {
    /// Port the `/metrics` listener binds; 0 disables the exporter.
    pub port: u16,
}

impl Default for PrometheusSettings {
    fn default() -> Self {
        Self { port: 9090 }
    }
}

/// Kernel tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct KernelSettings {
    /// Events drained from the queue per tick.
    pub event_batch_cap: usize,
    /// Message ids remembered by the dedupe window.
    pub dedupe_window: usize,
    /// Cycles a dead slice lingers before garbage collection.
    pub grace_cycles: u64,
    /// Provisioning pool concurrency, authorities only.
    pub provision_pool_size: usize,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            event_batch_cap: 256,
            dedupe_window: crate::protocol::DEFAULT_DEDUPE_WINDOW,
            grace_cycles: 60,
            provision_pool_size: 4,
        }
    }
}

/// The complete actor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActorConfig {
    /// Identity and role.
    pub actor: ActorSettings,
    /// Transport tunables.
    #[serde(default)]
    pub transport: TransportSettings,
    /// Logical clock.
    #[serde(default)]
    pub time: ClockSettings,
    /// Reservation store.
    #[serde(default)]
    pub database: DatabaseSettings,
    /// Graph store.
    #[serde(default)]
    pub graphdb: GraphStoreSettings,
    /// Decision point.
    #[serde(default)]
    pub pdp: PdpSettings,
    /// Metrics exporter.
    #[serde(default)]
    pub prometheus: PrometheusSettings,
    /// Policy tunables.
    #[serde(default)]
    pub policy: PolicySettings,
    /// Kernel tunables.
    #[serde(default)]
    pub kernel: KernelSettings,
    /// Static peer catalog.
    #[serde(default)]
    pub peers: Vec<Peer>,
}

impl ActorConfig {
    /// Parses a config from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRequest`] for unparseable or invalid
    /// configs.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|err| CoreError::InvalidRequest(format!("config parse error: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config file.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRequest`] if the file cannot be read
    /// or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            CoreError::InvalidRequest(format!(
                "cannot read config {}: {err}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.actor.topic.is_empty() {
            return Err(CoreError::InvalidRequest(
                "actor.topic must not be empty".to_string(),
            ));
        }
        if self.transport.rpc_request_timeout_seconds == 0 {
            return Err(CoreError::InvalidRequest(
                "transport.rpc_request_timeout_seconds must be positive".to_string(),
            ));
        }
        if self.transport.commit_batch_size == 0 {
            return Err(CoreError::InvalidRequest(
                "transport.commit_batch_size must be positive".to_string(),
            ));
        }
        if self.time.cycle_millis < 1 {
            return Err(CoreError::InvalidRequest(
                "time.cycle_millis must be positive".to_string(),
            ));
        }
        if matches!(self.actor.role, ActorRole::Authority) && self.actor.resources.is_empty() {
            return Err(CoreError::InvalidRequest(
                "an authority needs at least one actor.resources handler mapping".to_string(),
            ));
        }
        Ok(())
    }

    /// Peers of the given role, in catalog order.
    #[must_use]
    pub fn peers_of(&self, role: ActorRole) -> Vec<&Peer> {
        self.peers.iter().filter(|p| p.role == role).collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::model::ActorRole;

    use super::ActorConfig;

    const BROKER_TOML: &str = r#"
        [actor]
        guid = "broker-1"
        name = "cluster-broker"
        type = "broker"
        topic = "trellis-broker-1"
        policy = "broker-first-fit"

        [transport]
        rpc_retries = 5
        rpc_request_timeout_seconds = 900

        [time]
        cycle_millis = 1000
        manual = true

        [policy]
        random_sites = ["EDC"]
        oversubscription_factor = 1.5

        [[peers]]
        guid = "orchestrator-1"
        role = "orchestrator"
        topic = "trellis-orc-1"

        [[peers]]
        guid = "authority-renc"
        role = "authority"
        topic = "trellis-auth-renc"
        delegation = "renc-primary"
    "#;

    #[test]
    fn test_broker_config_parses() {
        let config = ActorConfig::from_toml(BROKER_TOML).unwrap();
        assert_eq!(config.actor.role, ActorRole::Broker);
        assert_eq!(config.actor.policy.as_deref(), Some("broker-first-fit"));
        assert!(config.time.manual);
        assert_eq!(config.policy.random_sites, vec!["EDC".to_string()]);
        assert_eq!(config.peers_of(ActorRole::Authority).len(), 1);
        assert_eq!(config.transport.commit_batch_size, 1);
    }

    #[test]
    fn test_authority_requires_handler_map() {
        let toml = r#"
            [actor]
            guid = "auth-1"
            name = "site"
            type = "authority"
            topic = "trellis-auth-1"
        "#;
        assert!(ActorConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let toml = r#"
            [actor]
            guid = "b"
            name = "b"
            type = "broker"
            topic = "t"
            mystery = 1
        "#;
        assert!(ActorConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let toml = r#"
            [actor]
            guid = "b"
            name = "b"
            type = "broker"
            topic = "t"

            [transport]
            commit_batch_size = 0
        "#;
        assert!(ActorConfig::from_toml(toml).is_err());
    }
}
