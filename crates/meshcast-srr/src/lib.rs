//! # Meshcast SRR
//!
//! Stochastic Relay/Routing: the reinforcement-learned next-hop layer
//! of the meshcast relay.
//!
//! Each flow carries per-next-hop estimates of expected remaining
//! hop-cost (Q) and delivery reliability (C), updated online from
//! SmartAck acknowledgements and discounted by every packet sent. The
//! controller asks this crate two questions:
//!
//! - which next hop should unicast traffic for a flow
//!   ([`RlData::next_hop`]), and
//! - how likely should the relay fall back to broadcast
//!   ([`broadcast_probability`]).

pub mod error;
pub mod metric;
pub mod table;

// Re-export main types
pub use error::{SrrError, SrrResult};
pub use metric::{INITIAL_Q, MAX_SENT_PACKETS, NextHopMetric, RlData, SentPacket};
pub use table::{MetricTable, NextHopCandidate};

use serde::{Deserialize, Serialize};

use meshcast_core::TICK_RATE;

/// Probability that a flow is broadcast rather than unicast
///
/// `min_broadcast_prob` is the floor; confidence in the selected next
/// hop scales the remainder down. Competing-flow suppression is applied
/// on top by the controller.
pub fn broadcast_probability(min_broadcast_prob: f64, corrected_c: f64) -> f64 {
    min_broadcast_prob + (1.0 - min_broadcast_prob) * (1.0 - corrected_c.min(1.0))
}

/// Configuration for the stochastic relay/routing layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrrConfig {
    /// Learning rate for Q/C updates (0, 1)
    pub learning_rate: f64,
    /// Corrected-C bar a next hop must clear to be chosen on cost alone
    pub reliability_threshold: f64,
    /// Floor on the broadcast probability
    pub min_broadcast_prob: f64,
    /// Metric state older than this is pruned, in ticks
    pub metric_max_age: u32,
}

impl Default for SrrConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.25,
            reliability_threshold: 0.8,
            min_broadcast_prob: 0.1,
            metric_max_age: 300 * TICK_RATE,
        }
    }
}

impl SrrConfig {
    /// Preset favoring fast adaptation in volatile topologies
    pub fn volatile_topology() -> Self {
        Self {
            learning_rate: 0.4,
            reliability_threshold: 0.6,
            min_broadcast_prob: 0.2,
            ..Self::default()
        }
    }

    /// Preset favoring stable unicast in quiet topologies
    pub fn stable_topology() -> Self {
        Self {
            learning_rate: 0.1,
            reliability_threshold: 0.9,
            min_broadcast_prob: 0.05,
            ..Self::default()
        }
    }

    /// Check configuration invariants
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        if !(0.0..1.0).contains(&self.learning_rate) || self.learning_rate == 0.0 {
            warnings.push(ConfigWarning::LearningRateOutOfRange);
        }
        if !(0.0..=1.0).contains(&self.reliability_threshold) {
            warnings.push(ConfigWarning::ReliabilityThresholdOutOfRange);
        }
        if !(0.0..=1.0).contains(&self.min_broadcast_prob) {
            warnings.push(ConfigWarning::BroadcastProbOutOfRange);
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
    /// `learning_rate` must lie strictly inside (0, 1)
    LearningRateOutOfRange,
    /// `reliability_threshold` must lie in [0, 1]
    ReliabilityThresholdOutOfRange,
    /// `min_broadcast_prob` must lie in [0, 1]
    BroadcastProbOutOfRange,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LearningRateOutOfRange => write!(f, "learning_rate outside (0, 1)"),
            Self::ReliabilityThresholdOutOfRange => {
                write!(f, "reliability_threshold outside [0, 1]")
            }
            Self::BroadcastProbOutOfRange => write!(f, "min_broadcast_prob outside [0, 1]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_probability_bounds() {
        // No confidence: certain broadcast.
        assert!((broadcast_probability(0.1, 0.0) - 1.0).abs() < 1e-12);
        // Full confidence: only the floor remains.
        assert!((broadcast_probability(0.1, 1.0) - 0.1).abs() < 1e-12);
        // Corrected C beyond 1 is clamped.
        assert!((broadcast_probability(0.1, 3.0) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_broadcast_probability_scales_with_confidence() {
        let low = broadcast_probability(0.1, 0.9);
        let high = broadcast_probability(0.1, 0.2);
        assert!(high > low);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(SrrConfig::default().is_valid());
        assert!(SrrConfig::volatile_topology().is_valid());
        assert!(SrrConfig::stable_topology().is_valid());
    }

    #[test]
    fn test_invalid_config_detected() {
        let mut config = SrrConfig::default();
        config.learning_rate = 1.5;
        config.min_broadcast_prob = -0.1;
        let warnings = config.validate();
        assert!(warnings.contains(&ConfigWarning::LearningRateOutOfRange));
        assert!(warnings.contains(&ConfigWarning::BroadcastProbOutOfRange));
    }
}
