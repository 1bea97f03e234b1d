//! Requested and granted capacity vectors and component attachments.

use serde::{Deserialize, Serialize};

/// A capacity vector over the dimensions the policies arbitrate.
///
/// Comparison is component-wise: a request fits an availability vector
/// only if every dimension fits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Capacities {
    /// CPU cores.
    #[serde(default)]
    pub cores: u32,
    /// Memory in gigabytes.
    #[serde(default)]
    pub ram_gb: u32,
    /// Disk in gigabytes.
    #[serde(default)]
    pub disk_gb: u32,
    /// Network bandwidth in gigabits per second.
    #[serde(default)]
    pub bandwidth_gbps: u32,
}

impl Capacities {
    /// Creates a compute capacity vector.
    #[must_use]
    pub const fn compute(cores: u32, ram_gb: u32, disk_gb: u32) -> Self {
        Self {
            cores,
            ram_gb,
            disk_gb,
            bandwidth_gbps: 0,
        }
    }

    /// Returns `true` when every dimension is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.cores == 0 && self.ram_gb == 0 && self.disk_gb == 0 && self.bandwidth_gbps == 0
    }

    /// Component-wise `self <= other`.
    #[must_use]
    pub const fn fits_within(&self, other: &Self) -> bool {
        self.cores <= other.cores
            && self.ram_gb <= other.ram_gb
            && self.disk_gb <= other.disk_gb
            && self.bandwidth_gbps <= other.bandwidth_gbps
    }

    /// Component-wise sum.
    #[must_use]
    pub const fn plus(&self, other: &Self) -> Self {
        Self {
            cores: self.cores + other.cores,
            ram_gb: self.ram_gb + other.ram_gb,
            disk_gb: self.disk_gb + other.disk_gb,
            bandwidth_gbps: self.bandwidth_gbps + other.bandwidth_gbps,
        }
    }

    /// Component-wise difference, saturating at zero.
    #[must_use]
    pub const fn minus_saturating(&self, other: &Self) -> Self {
        Self {
            cores: self.cores.saturating_sub(other.cores),
            ram_gb: self.ram_gb.saturating_sub(other.ram_gb),
            disk_gb: self.disk_gb.saturating_sub(other.disk_gb),
            bandwidth_gbps: self.bandwidth_gbps.saturating_sub(other.bandwidth_gbps),
        }
    }

    /// Scales every dimension by a factor, used for oversubscription.
    ///
    /// Values are truncated toward zero; factors below 1.0 are clamped to
    /// 1.0 so a misconfigured factor can never shrink a delegation.
    #[must_use]
    pub fn scaled(&self, factor: f64) -> Self {
        let factor = factor.max(1.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let scale = |v: u32| (f64::from(v) * factor) as u32;
        Self {
            cores: scale(self.cores),
            ram_gb: scale(self.ram_gb),
            disk_gb: scale(self.disk_gb),
            bandwidth_gbps: scale(self.bandwidth_gbps),
        }
    }
}

impl std::fmt::Display for Capacities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cores={} ram={}G disk={}G bw={}Gbps",
            self.cores, self.ram_gb, self.disk_gb, self.bandwidth_gbps
        )
    }
}

/// A requested component: a model and how many of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// Component model, e.g. `GPU-A30` or `SmartNIC-CX6`.
    pub model: String,
    /// Number of units requested.
    pub count: u32,
}

impl ComponentSpec {
    /// Creates a component request.
    #[must_use]
    pub fn new(model: impl Into<String>, count: u32) -> Self {
        Self {
            model: model.into(),
            count,
        }
    }
}

/// A component actually attached to a reservation by policy.
///
/// Components are identified on the substrate by their PCI address (BDF).
/// Shared NICs additionally carry the MAC and VLAN assigned from the
/// component's label pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedComponent {
    /// Component name on the substrate node.
    pub name: String,
    /// Component model.
    pub model: String,
    /// PCI bus/device/function address.
    pub bdf: String,
    /// `true` if the component is shared between reservations.
    pub shared: bool,
    /// VLAN tag allocated from the component label pool, shared NICs only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
    /// MAC address allocated from the component label pool, shared NICs only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}
