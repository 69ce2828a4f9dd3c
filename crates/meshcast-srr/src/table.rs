//! Flow-keyed metric table and next-hop candidate list
//!
//! The [`MetricTable`] owns one [`RlData`] per stochastically-routed
//! flow, plus the global list of next-hop candidates the relay has heard
//! from. Both are aged on ticks and pruned on sweeps; nothing is
//! preemptively cancelled.

use std::collections::HashMap;

use tracing::{debug, trace};

use meshcast_core::{ActivityStatus, FlowDescription, RelayAddr, Tick};

use crate::metric::RlData;

/// A known next-hop candidate (SRR mode's downstream relay list)
#[derive(Debug, Clone)]
pub struct NextHopCandidate {
    addr: RelayAddr,
    iface_index: u32,
    activity: ActivityStatus,
}

impl NextHopCandidate {
    pub fn addr(&self) -> RelayAddr {
        self.addr
    }

    pub fn iface_index(&self) -> u32 {
        self.iface_index
    }

    /// Age in ticks (auto-invalidates on overflow)
    pub fn age(&mut self, now: Tick) -> u32 {
        self.activity.age(now)
    }
}

/// Per-flow learning state plus the shared candidate list
#[derive(Debug, Default)]
pub struct MetricTable {
    flows: HashMap<FlowDescription, RlData>,
    candidates: HashMap<RelayAddr, NextHopCandidate>,
}

impl MetricTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Learning state for a flow, created on first use
    pub fn rl_or_create(
        &mut self,
        flow: &FlowDescription,
        learning_rate: f64,
        iface_index: u32,
        now: Tick,
    ) -> &mut RlData {
        self.flows
            .entry(flow.clone())
            .or_insert_with(|| {
                trace!(flow = %flow, "creating metric state");
                RlData::new(learning_rate, iface_index, now)
            })
    }

    pub fn rl(&self, flow: &FlowDescription) -> Option<&RlData> {
        self.flows.get(flow)
    }

    pub fn rl_mut(&mut self, flow: &FlowDescription) -> Option<&mut RlData> {
        self.flows.get_mut(flow)
    }

    pub fn flows(&self) -> impl Iterator<Item = (&FlowDescription, &RlData)> {
        self.flows.iter()
    }

    /// Record (or refresh) a next-hop candidate
    pub fn record_candidate(&mut self, addr: RelayAddr, iface_index: u32, now: Tick) {
        self.candidates
            .entry(addr)
            .and_modify(|candidate| candidate.activity.refresh(now))
            .or_insert_with(|| NextHopCandidate {
                addr,
                iface_index,
                activity: ActivityStatus::refreshed(now),
            });
    }

    pub fn candidate(&self, addr: &RelayAddr) -> Option<&NextHopCandidate> {
        self.candidates.get(addr)
    }

    pub fn candidates(&self) -> impl Iterator<Item = &NextHopCandidate> {
        self.candidates.values()
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Drop flows and candidates that have aged past `max_age`
    pub fn prune(&mut self, max_age: u32, now: Tick) -> usize {
        let flows_before = self.flows.len();
        self.flows.retain(|_, rl| rl.age(now) < max_age);
        self.candidates
            .retain(|_, candidate| candidate.age(now) < max_age);
        let dropped = flows_before - self.flows.len();
        if dropped > 0 {
            debug!(dropped, remaining = self.flows.len(), "pruned metric state");
        }
        dropped
    }
}
