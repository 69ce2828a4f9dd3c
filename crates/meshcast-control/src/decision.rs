//! Relay decisions pushed to the forwarder

use serde::{Deserialize, Serialize};

use meshcast_core::RelayAddr;

/// Why a packet was not forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuppressReason {
    /// The flow's forwarding status rejects relaying here
    NotForwarding,
    /// Administratively denied
    Denied,
    /// The token bucket is empty
    NoTokens,
    /// The flow table is at capacity
    TableFull,
}

/// Outcome of the per-packet relay decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayDecision {
    /// Rebroadcast on the interface
    Broadcast {
        iface_index: u32,
        /// Probability the broadcast arm was chosen with
        probability: f64,
    },

    /// Unicast to the learned next hop
    Unicast {
        iface_index: u32,
        next_hop: RelayAddr,
        /// Probability the unicast arm was chosen with
        probability: f64,
    },

    /// Do not forward
    Suppress { reason: SuppressReason },
}

impl RelayDecision {
    /// Create a broadcast decision
    pub fn broadcast(iface_index: u32, probability: f64) -> Self {
        Self::Broadcast {
            iface_index,
            probability,
        }
    }

    /// Create a unicast decision
    pub fn unicast(iface_index: u32, next_hop: RelayAddr, probability: f64) -> Self {
        Self::Unicast {
            iface_index,
            next_hop,
            probability,
        }
    }

    /// Create a suppress decision
    pub fn suppress(reason: SuppressReason) -> Self {
        Self::Suppress { reason }
    }

    /// Check if this decision forwards the packet at all
    pub fn is_forwarding(&self) -> bool {
        !matches!(self, Self::Suppress { .. })
    }

    /// Check if this is a broadcast decision
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Broadcast { .. })
    }

    /// Check if this is a unicast decision
    pub fn is_unicast(&self) -> bool {
        matches!(self, Self::Unicast { .. })
    }

    /// Get the suppress reason, if any
    pub fn suppress_reason(&self) -> Option<SuppressReason> {
        match self {
            Self::Suppress { reason } => Some(*reason),
            _ => None,
        }
    }

    /// Get the unicast next hop, if any
    pub fn next_hop(&self) -> Option<RelayAddr> {
        match self {
            Self::Unicast { next_hop, .. } => Some(*next_hop),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_predicates() {
        let broadcast = RelayDecision::broadcast(1, 0.7);
        assert!(broadcast.is_forwarding());
        assert!(broadcast.is_broadcast());
        assert!(!broadcast.is_unicast());
        assert_eq!(broadcast.next_hop(), None);

        let next_hop = RelayAddr::v4(10, 0, 0, 1);
        let unicast = RelayDecision::unicast(1, next_hop, 0.3);
        assert!(unicast.is_forwarding());
        assert!(unicast.is_unicast());
        assert_eq!(unicast.next_hop(), Some(next_hop));

        let suppress = RelayDecision::suppress(SuppressReason::NoTokens);
        assert!(!suppress.is_forwarding());
        assert_eq!(suppress.suppress_reason(), Some(SuppressReason::NoTokens));
    }
}
