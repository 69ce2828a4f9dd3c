//! # Meshcast FIB
//!
//! The multicast forwarding information base for the meshcast relay.
//!
//! This crate holds the per-flow forwarding state the controller drives:
//!
//! - [`TokenBucket`]: per-(flow, interface) rate limiting with the five
//!   forwarding modes
//! - [`FibEntry`] / [`FlowTable`]: per-flow forwarding and acking state
//!   in an arena, threaded onto newest-first active/idle lists with
//!   tail-based pruning
//! - [`UpstreamRelay`] / [`UpstreamHistory`]: previous-hop relay ranking
//!   and sequence-gap loss estimation
//! - [`MembershipTable`]: group memberships with dual ELASTIC/MANAGED
//!   timeouts in a sorted ring with a cached leader
//! - [`PolicyTable`]: administrative allow/deny/rate overrides
//!
//! Everything ages against the wrapping microsecond tick from
//! `meshcast-core`; nothing here blocks or spawns.

pub mod bucket;
pub mod entry;
pub mod error;
pub mod membership;
pub mod policy;
pub mod relay;
pub mod table;

// Re-export main types
pub use bucket::{DEFAULT_BUCKET_DEPTH, ForwardingStatus, TokenBucket};
pub use entry::{FibEntry, FlowFlags, IFACE_WILDCARD, RELAY_SWITCH_IMPROVEMENT, RelayTimeouts};
pub use error::{FibError, FibResult};
pub use membership::{
    Membership, MembershipEvent, MembershipFlag, MembershipFlags, MembershipKey, MembershipTable,
    TimeoutFlag, TimeoutSweep,
};
pub use policy::{FlowPolicy, PolicyAction, PolicyTable};
pub use relay::{AckingPolicy, RelayStatus, UpstreamHistory, UpstreamRelay};
pub use table::{EntryId, FlowTable, FlowTimeouts, PruneStats};

use serde::{Deserialize, Serialize};

use meshcast_core::TICK_RATE;

/// Configuration for the forwarding information base
///
/// All timeouts are in ticks (microseconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FibConfig {
    /// Active flows older than this move to the idle list
    pub flow_active_timeout: u32,
    /// Idle flows older than this are deleted unless managed
    pub flow_idle_timeout: u32,
    /// Upstream relays older than this are stale for selection
    pub relay_active_timeout: u32,
    /// Upstream relays older than this are pruned outright
    pub relay_idle_timeout: u32,
    /// Token bucket depth for new entries
    pub bucket_depth: u32,
    /// Acknowledgement trigger policy for new entries
    pub acking: AckingPolicy,
    /// Hard cap on tracked flows
    pub max_flows: usize,
    /// Sweeps a membership may sit idle before being considered dead
    pub membership_idle_threshold: u32,
    /// Sweeps a relay history may sit idle before garbage collection
    pub history_idle_threshold: u32,
}

impl Default for FibConfig {
    fn default() -> Self {
        Self {
            flow_active_timeout: 60 * TICK_RATE,
            flow_idle_timeout: 300 * TICK_RATE,
            relay_active_timeout: 20 * TICK_RATE,
            relay_idle_timeout: 120 * TICK_RATE,
            bucket_depth: DEFAULT_BUCKET_DEPTH,
            acking: AckingPolicy {
                count_threshold: 10,
                interval_min: TICK_RATE / 10,
                interval_max: 10 * TICK_RATE,
            },
            max_flows: 4_096,
            membership_idle_threshold: 3,
            history_idle_threshold: 5,
        }
    }
}

impl FibConfig {
    /// Preset for dense deployments: aggressive pruning, tight tables
    pub fn dense_network() -> Self {
        Self {
            flow_active_timeout: 30 * TICK_RATE,
            flow_idle_timeout: 120 * TICK_RATE,
            relay_active_timeout: 10 * TICK_RATE,
            relay_idle_timeout: 60 * TICK_RATE,
            max_flows: 16_384,
            ..Self::default()
        }
    }

    /// Preset for sparse, intermittently-connected deployments
    pub fn sparse_network() -> Self {
        Self {
            flow_active_timeout: 120 * TICK_RATE,
            flow_idle_timeout: 900 * TICK_RATE,
            relay_active_timeout: 60 * TICK_RATE,
            relay_idle_timeout: 600 * TICK_RATE,
            membership_idle_threshold: 6,
            ..Self::default()
        }
    }

    /// Flow lifecycle timeouts for [`FlowTable::prune`]
    pub fn flow_timeouts(&self) -> FlowTimeouts {
        FlowTimeouts {
            active_timeout: self.flow_active_timeout,
            idle_timeout: self.flow_idle_timeout,
        }
    }

    /// Relay selection timeouts for [`FibEntry::best_upstream_relay`]
    pub fn relay_timeouts(&self) -> RelayTimeouts {
        RelayTimeouts {
            active_timeout: self.relay_active_timeout,
            idle_timeout: self.relay_idle_timeout,
        }
    }

    /// Check configuration invariants
    ///
    /// An empty list means the configuration is coherent.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        if self.flow_active_timeout >= self.flow_idle_timeout {
            warnings.push(ConfigWarning::ActiveTimeoutExceedsIdle);
        }
        if self.relay_active_timeout >= self.relay_idle_timeout {
            warnings.push(ConfigWarning::RelayActiveTimeoutExceedsIdle);
        }
        if self.acking.interval_min >= self.acking.interval_max {
            warnings.push(ConfigWarning::AckIntervalMinExceedsMax);
        }
        if self.bucket_depth == 0 {
            warnings.push(ConfigWarning::ZeroBucketDepth);
        }
        if self.max_flows == 0 {
            warnings.push(ConfigWarning::ZeroFlowCapacity);
        }
        warnings
    }

    /// Whether the configuration passes every invariant
    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }
}

/// Configuration coherence warnings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigWarning {
    /// `flow_active_timeout` should be below `flow_idle_timeout`
    ActiveTimeoutExceedsIdle,
    /// `relay_active_timeout` should be below `relay_idle_timeout`
    RelayActiveTimeoutExceedsIdle,
    /// `acking.interval_min` should be below `acking.interval_max`
    AckIntervalMinExceedsMax,
    /// A zero-depth bucket can never forward in metered modes
    ZeroBucketDepth,
    /// A zero-capacity flow table rejects every flow
    ZeroFlowCapacity,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ActiveTimeoutExceedsIdle => {
                write!(f, "flow_active_timeout exceeds flow_idle_timeout")
            }
            Self::RelayActiveTimeoutExceedsIdle => {
                write!(f, "relay_active_timeout exceeds relay_idle_timeout")
            }
            Self::AckIntervalMinExceedsMax => {
                write!(f, "acking interval_min exceeds interval_max")
            }
            Self::ZeroBucketDepth => write!(f, "bucket_depth is zero"),
            Self::ZeroFlowCapacity => write!(f, "max_flows is zero"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(FibConfig::default().is_valid());
    }

    #[test]
    fn test_preset_configs_are_valid() {
        assert!(FibConfig::dense_network().is_valid());
        assert!(FibConfig::sparse_network().is_valid());
    }

    #[test]
    fn test_invalid_config_detected() {
        let mut config = FibConfig::default();
        config.flow_active_timeout = config.flow_idle_timeout;
        config.bucket_depth = 0;
        let warnings = config.validate();
        assert!(warnings.contains(&ConfigWarning::ActiveTimeoutExceedsIdle));
        assert!(warnings.contains(&ConfigWarning::ZeroBucketDepth));
        assert!(!config.is_valid());
    }
}
