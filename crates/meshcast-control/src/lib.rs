//! # Meshcast Control
//!
//! Controller orchestration for the meshcast multicast relay.
//!
//! The [`Controller`] ties the forwarding information base, the
//! membership table, and the stochastic routing metrics together on the
//! event stream a relay daemon feeds it: packets, acknowledgements,
//! IGMP group records, and timer expiries. Its output is a
//! [`RelayDecision`] per packet plus EM-ACKs emitted through the
//! injected [`meshcast_core::FrameSender`].
//!
//! Two relay modes are supported:
//!
//! - [`RelayMode::Elastic`]: acknowledgement-driven broadcast relaying
//! - [`RelayMode::Stochastic`]: reinforcement-learned unicast with
//!   probabilistic broadcast fallback

pub mod controller;
pub mod decision;
pub mod error;

// Re-export main types
pub use controller::{Controller, PacketEvent};
pub use decision::{RelayDecision, SuppressReason};
pub use error::{ControlError, ControlResult};

use serde::{Deserialize, Serialize};

use meshcast_core::TICK_RATE;
use meshcast_fib::FibConfig;
use meshcast_srr::SrrConfig;

/// Which relay scheme drives forwarding decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMode {
    /// Acknowledgement-driven broadcast relaying (elastic multicast)
    Elastic,
    /// RL-selected unicast with probabilistic broadcast fallback
    Stochastic,
}

impl RelayMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Elastic => "elastic",
            Self::Stochastic => "stochastic",
        }
    }
}

/// Configuration for the relay controller
///
/// Combines the per-subsystem configurations with the controller's own
/// timeouts (all in ticks).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    pub mode: RelayMode,
    pub fib: FibConfig,
    pub srr: SrrConfig,
    /// Lifetime of an elastic (ack-driven) membership
    pub elastic_membership_timeout: u32,
    /// Lifetime of a managed (IGMP-driven) membership
    pub managed_membership_timeout: u32,
    /// Period of the flow/metric prune sweep
    pub prune_interval: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            mode: RelayMode::Elastic,
            fib: FibConfig::default(),
            srr: SrrConfig::default(),
            elastic_membership_timeout: 10 * TICK_RATE,
            managed_membership_timeout: 260 * TICK_RATE,
            prune_interval: 5 * TICK_RATE,
        }
    }
}

impl ControlConfig {
    /// Default configuration in stochastic (SRR) mode
    pub fn stochastic() -> Self {
        Self {
            mode: RelayMode::Stochastic,
            ..Self::default()
        }
    }

    /// Check configuration invariants, including the sub-configs
    pub fn validate(&self) -> Vec<String> {
        let mut warnings: Vec<String> = Vec::new();
        warnings.extend(self.fib.validate().iter().map(|w| w.to_string()));
        warnings.extend(self.srr.validate().iter().map(|w| w.to_string()));
        if self.prune_interval >= self.fib.flow_active_timeout {
            warnings.push(
                "prune_interval should be well below flow_active_timeout".to_string(),
            );
        }
        if self.elastic_membership_timeout == 0 || self.managed_membership_timeout == 0 {
            warnings.push("membership timeouts must be non-zero".to_string());
        }
        warnings
    }

    /// Whether the configuration passes every invariant
    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }
}
