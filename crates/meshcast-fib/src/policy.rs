//! Administrative flow policies
//!
//! Operators can pre-seed forwarding behavior for flows they care about:
//! allow, deny, or rate-limit, matched by best prefix against the flow
//! description of arriving traffic. A policy match marks the resulting
//! FIB entry `POLICY` (and managed policies also pin it `MANAGED` so
//! pruning never deletes it).

use serde::{Deserialize, Serialize};
use tracing::trace;

use meshcast_core::FlowDescription;

use crate::bucket::ForwardingStatus;

/// What a policy does to matching flows
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PolicyAction {
    /// Forward unconditionally
    Allow,
    /// Administratively reject
    Deny,
    /// Forward metered to a packet rate
    Limit(f64),
}

impl PolicyAction {
    /// Forwarding mode the action maps to
    pub fn forwarding_status(&self) -> ForwardingStatus {
        match self {
            Self::Allow => ForwardingStatus::Forward,
            Self::Deny => ForwardingStatus::Deny,
            Self::Limit(_) => ForwardingStatus::Limit,
        }
    }

    /// Metering rate override, if any
    pub fn rate(&self) -> Option<f64> {
        match self {
            Self::Limit(pps) => Some(*pps),
            _ => None,
        }
    }
}

/// One administrative policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowPolicy {
    pub flow: FlowDescription,
    pub action: PolicyAction,
    /// Pin matching entries against idle deletion
    pub managed: bool,
}

/// Best-prefix-matched policy list
#[derive(Debug, Default)]
pub struct PolicyTable {
    /// Most specific first
    policies: Vec<FlowPolicy>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Install a policy, replacing any existing policy for the same flow
    pub fn insert(&mut self, policy: FlowPolicy) {
        self.policies.retain(|existing| existing.flow != policy.flow);
        let specificity = policy.flow.specificity();
        let position = self
            .policies
            .partition_point(|other| other.flow.specificity() > specificity);
        trace!(flow = %policy.flow, "installing flow policy");
        self.policies.insert(position, policy);
    }

    /// Remove the policy for an exact flow description
    pub fn remove(&mut self, flow: &FlowDescription) -> Option<FlowPolicy> {
        let position = self.policies.iter().position(|policy| policy.flow == *flow)?;
        Some(self.policies.remove(position))
    }

    /// Most specific policy covering `query`
    pub fn best_match(&self, query: &FlowDescription) -> Option<&FlowPolicy> {
        self.policies.iter().find(|policy| policy.flow.matches(query))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowPolicy> {
        self.policies.iter()
    }
}
