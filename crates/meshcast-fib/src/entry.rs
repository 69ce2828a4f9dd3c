//! Per-flow forwarding state
//!
//! A [`FibEntry`] is the canonical record for one detected or managed
//! flow: its forwarding mode per interface (token buckets), its
//! acknowledgement trigger state, the upstream relays it has been heard
//! from with a cached best-relay choice, and the downstream relay and
//! unicast probability pushed in by the stochastic routing layer.
//!
//! Entries live in the arena owned by [`crate::table::FlowTable`], which
//! also threads them onto the active/idle lists; the entry itself only
//! carries its flags.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use meshcast_core::{ActivityStatus, FlowDescription, RelayAddr, Tick};

use crate::bucket::{ForwardingStatus, TokenBucket};
use crate::relay::{AckingPolicy, RelayStatus, UpstreamRelay};

/// Wildcard interface index: applies to the default and every bucket
pub const IFACE_WILDCARD: u32 = 0;

/// Relative path-metric improvement required before the best relay
/// switches (hysteresis against flapping)
pub const RELAY_SWITCH_IMPROVEMENT: f64 = 0.10;

/// Flow status bitset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowFlags(u8);

impl FlowFlags {
    pub const IDLE: FlowFlags = FlowFlags(0x01);
    pub const ACTIVE: FlowFlags = FlowFlags(0x02);
    pub const MANAGED: FlowFlags = FlowFlags(0x04);
    pub const POLICY: FlowFlags = FlowFlags(0x08);

    pub fn contains(&self, flag: FlowFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn set(&mut self, flag: FlowFlags) {
        self.0 |= flag.0;
    }

    pub fn clear(&mut self, flag: FlowFlags) {
        self.0 &= !flag.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Timeouts consulted by relay selection, in ticks
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RelayTimeouts {
    /// A relay older than this is considered stale for selection
    pub active_timeout: u32,
    /// A relay older than this is pruned outright
    pub idle_timeout: u32,
}

/// Per-flow forwarding state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FibEntry {
    flow: FlowDescription,
    default_status: ForwardingStatus,
    default_rate: f64,
    bucket_depth: u32,
    buckets: HashMap<u32, TokenBucket>,
    forwarding_count: u32,
    acking: bool,
    acking_policy: AckingPolicy,
    update_count: u32,
    update_start: Tick,
    activity: ActivityStatus,
    flags: FlowFlags,
    ttl: u8,
    relays: HashMap<RelayAddr, UpstreamRelay>,
    best_relay: Option<RelayAddr>,
    downstream_relay: Option<RelayAddr>,
    unicast_probability: f64,
}

impl FibEntry {
    pub fn new(
        flow: FlowDescription,
        default_status: ForwardingStatus,
        acking_policy: AckingPolicy,
        bucket_depth: u32,
        now: Tick,
    ) -> Self {
        Self {
            flow,
            default_status,
            default_rate: 0.0,
            bucket_depth,
            buckets: HashMap::new(),
            forwarding_count: 0,
            acking: false,
            acking_policy,
            update_count: 0,
            update_start: now,
            activity: ActivityStatus::refreshed(now),
            flags: FlowFlags::default(),
            ttl: 0,
            relays: HashMap::new(),
            best_relay: None,
            downstream_relay: None,
            unicast_probability: 0.0,
        }
    }

    pub fn flow(&self) -> &FlowDescription {
        &self.flow
    }

    // --- flags ---

    pub fn is_active(&self) -> bool {
        self.flags.contains(FlowFlags::ACTIVE)
    }

    pub fn is_idle(&self) -> bool {
        self.flags.contains(FlowFlags::IDLE)
    }

    pub fn is_managed(&self) -> bool {
        self.flags.contains(FlowFlags::MANAGED)
    }

    pub fn set_managed(&mut self, managed: bool) {
        if managed {
            self.flags.set(FlowFlags::MANAGED);
        } else {
            self.flags.clear(FlowFlags::MANAGED);
        }
    }

    pub fn is_policy(&self) -> bool {
        self.flags.contains(FlowFlags::POLICY)
    }

    pub fn set_policy(&mut self, policy: bool) {
        if policy {
            self.flags.set(FlowFlags::POLICY);
        } else {
            self.flags.clear(FlowFlags::POLICY);
        }
    }

    // --- activity & update window ---

    /// Record a non-duplicate packet: bump the update counter, refresh
    /// activity, and cascade into buckets and relays
    pub fn refresh(&mut self, now: Tick) {
        self.update_count += 1;
        self.activity.refresh(now);
        for bucket in self.buckets.values_mut() {
            bucket.refresh(now);
        }
        for relay in self.relays.values_mut() {
            relay.age(now);
        }
    }

    /// Cascade bucket refresh and relay aging without counting a packet
    ///
    /// Used by pruning sweeps; returns this entry's own age.
    pub fn age(&mut self, now: Tick) -> u32 {
        for bucket in self.buckets.values_mut() {
            bucket.refresh(now);
        }
        for relay in self.relays.values_mut() {
            relay.age(now);
        }
        self.activity.age(now)
    }

    /// Age without side effects
    pub fn peek_age(&self, now: Tick) -> u32 {
        self.activity.peek_age(now)
    }

    pub fn update_count(&self) -> u32 {
        self.update_count
    }

    /// Whether the controller-notification trigger has fired
    pub fn update_pending(&self, now: Tick) -> bool {
        self.acking_policy
            .pending(self.update_count, self.update_start, now)
    }

    /// Open a fresh update window after notifying the controller
    pub fn reset_update_window(&mut self, now: Tick) {
        self.update_count = 0;
        self.update_start = now;
    }

    pub fn acking_policy(&self) -> AckingPolicy {
        self.acking_policy
    }

    pub fn set_acking_policy(&mut self, policy: AckingPolicy) {
        self.acking_policy = policy;
    }

    /// Whether this node acknowledges upstream for the flow
    pub fn is_acking(&self) -> bool {
        self.acking
    }

    pub fn set_acking(&mut self, acking: bool) {
        self.acking = acking;
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.ttl = ttl;
    }

    // --- lifecycle ---

    /// Reset buckets and activity and mark the flow active
    ///
    /// The packet that activates the flow counts as the first update.
    pub fn activate(&mut self, now: Tick) {
        for bucket in self.buckets.values_mut() {
            bucket.reset(now);
        }
        self.activity = ActivityStatus::refreshed(now);
        self.activity.set_active(true);
        self.flags.clear(FlowFlags::IDLE);
        self.flags.set(FlowFlags::ACTIVE);
        self.update_count = 1;
        self.update_start = now;
    }

    /// Move the flow to the idle state with a refreshed timestamp
    pub fn deactivate(&mut self, now: Tick) {
        self.activity.refresh(now);
        self.activity.set_active(false);
        self.flags.clear(FlowFlags::ACTIVE);
        self.flags.set(FlowFlags::IDLE);
    }

    // --- forwarding status & buckets ---

    pub fn default_status(&self) -> ForwardingStatus {
        self.default_status
    }

    /// Number of interfaces currently in `Forward`
    pub fn forwarding_count(&self) -> u32 {
        self.forwarding_count
    }

    /// Set the forwarding mode for one interface, or for the default and
    /// every existing bucket when `iface_index` is [`IFACE_WILDCARD`]
    pub fn set_forwarding_status(
        &mut self,
        iface_index: u32,
        status: ForwardingStatus,
        acking: bool,
        now: Tick,
    ) {
        self.acking = acking;
        if iface_index == IFACE_WILDCARD {
            self.default_status = status;
            for bucket in self.buckets.values_mut() {
                bucket.set_status(status, now);
            }
        } else {
            let bucket = self.bucket_or_create(iface_index, now);
            bucket.set_status(status, now);
        }
        self.recount_forwarding();
    }

    /// Forwarding mode in effect for an interface
    pub fn forwarding_status(&self, iface_index: u32) -> ForwardingStatus {
        self.buckets
            .get(&iface_index)
            .map(|bucket| bucket.status())
            .unwrap_or(self.default_status)
    }

    /// Set the metering rate for one interface, or for the default and
    /// every existing bucket when `iface_index` is [`IFACE_WILDCARD`]
    pub fn set_rate(&mut self, iface_index: u32, pps: f64, now: Tick) {
        if iface_index == IFACE_WILDCARD {
            self.default_rate = pps;
            for bucket in self.buckets.values_mut() {
                bucket.set_rate(pps);
            }
        } else {
            let bucket = self.bucket_or_create(iface_index, now);
            bucket.set_rate(pps);
        }
    }

    /// Run one packet through the bucket for `iface_index`
    pub fn process_packet(&mut self, iface_index: u32, now: Tick) -> bool {
        let bucket = self.bucket_or_create(iface_index, now);
        bucket.process_packet(now)
    }

    pub fn bucket(&self, iface_index: u32) -> Option<&TokenBucket> {
        self.buckets.get(&iface_index)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_or_create(&mut self, iface_index: u32, now: Tick) -> &mut TokenBucket {
        if !self.buckets.contains_key(&iface_index) {
            let mut bucket =
                TokenBucket::new(iface_index, self.default_status, self.bucket_depth, now);
            bucket.set_rate(self.default_rate);
            if bucket.status() == ForwardingStatus::Forward {
                self.forwarding_count += 1;
            }
            self.buckets.insert(iface_index, bucket);
        }
        self.buckets.get_mut(&iface_index).unwrap()
    }

    fn recount_forwarding(&mut self) {
        self.forwarding_count = self
            .buckets
            .values()
            .filter(|bucket| bucket.status() == ForwardingStatus::Forward)
            .count() as u32;
    }

    // --- upstream relays ---

    /// Find or create the relay record for a previous hop
    pub fn relay_or_create(
        &mut self,
        addr: RelayAddr,
        iface_index: u32,
        now: Tick,
    ) -> &mut UpstreamRelay {
        self.relays
            .entry(addr)
            .or_insert_with(|| UpstreamRelay::new(addr, iface_index, now))
    }

    pub fn relay(&self, addr: &RelayAddr) -> Option<&UpstreamRelay> {
        self.relays.get(addr)
    }

    pub fn relay_mut(&mut self, addr: &RelayAddr) -> Option<&mut UpstreamRelay> {
        self.relays.get_mut(addr)
    }

    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }

    pub fn relays(&self) -> impl Iterator<Item = &UpstreamRelay> {
        self.relays.values()
    }

    pub fn relays_mut(&mut self) -> impl Iterator<Item = &mut UpstreamRelay> {
        self.relays.values_mut()
    }

    /// Currently selected upstream relay, if any
    pub fn current_best_relay(&self) -> Option<RelayAddr> {
        self.best_relay
    }

    /// Select the best upstream relay
    ///
    /// Two passes over the non-expired relays: the best raw one-hop
    /// link quality, and the best combined path metric among relays that
    /// have advertised one. Path-metric candidates win when present; the
    /// incumbent is kept unless it has gone stale and a fresher candidate
    /// exists, or a challenger improves on its combined metric by at
    /// least [`RELAY_SWITCH_IMPROVEMENT`].
    pub fn best_upstream_relay(&mut self, timeouts: RelayTimeouts, now: Tick) -> Option<RelayAddr> {
        // Prune relays idle beyond the hard timeout.
        let expired: Vec<RelayAddr> = self
            .relays
            .iter_mut()
            .filter_map(|(addr, relay)| (relay.age(now) >= timeouts.idle_timeout).then_some(*addr))
            .collect();
        for addr in expired {
            trace!(relay = %addr, "pruning idle upstream relay");
            self.relays.remove(&addr);
            if self.best_relay == Some(addr) {
                self.best_relay = None;
            }
        }

        // Pass (a): best raw link quality, freshest wins ties.
        let best_quality = self
            .relays
            .values()
            .min_by(|a, b| {
                let qa = a.link_quality().unwrap_or(0.0);
                let qb = b.link_quality().unwrap_or(0.0);
                qb.partial_cmp(&qa)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.age_hint(now).cmp(&b.age_hint(now)))
            })
            .map(|relay| relay.addr());

        // Pass (b): best combined metric among advertising relays.
        let best_path = self
            .relays
            .values()
            .filter_map(|relay| relay.path_metric().map(|metric| (relay.addr(), metric)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let incumbent = self.best_relay.filter(|addr| self.relays.contains_key(addr));
        let chosen = match incumbent {
            None => best_path.map(|(addr, _)| addr).or(best_quality),
            Some(current) => {
                let current_metric = self.relays[&current].path_metric();
                let current_age = self.relays[&current].age_hint(now);
                let current_stale = current_age >= timeouts.active_timeout;
                let selected = match (current_metric, best_path) {
                    (Some(have), Some((challenger, offered))) if challenger != current => {
                        if offered <= have * (1.0 - RELAY_SWITCH_IMPROVEMENT) {
                            challenger
                        } else if current_stale
                            && self.relays[&challenger].age_hint(now) < current_age
                        {
                            challenger
                        } else {
                            current
                        }
                    }
                    // A relay that advertises a path metric beats an
                    // incumbent that never has.
                    (None, Some((challenger, _))) => challenger,
                    _ => {
                        if current_stale
                            && let Some(fresher) = best_quality
                            && fresher != current
                            && self.relays[&fresher].age_hint(now) < current_age
                        {
                            fresher
                        } else {
                            current
                        }
                    }
                };
                Some(selected)
            }
        };

        if chosen != incumbent
            && let Some(previous) = incumbent
            && let Some(relay) = self.relays.get_mut(&previous)
        {
            relay.set_status(RelayStatus::Secondary);
        }
        if let Some(addr) = chosen
            && let Some(relay) = self.relays.get_mut(&addr)
        {
            relay.set_status(RelayStatus::Primary);
        }
        self.best_relay = chosen;
        chosen
    }

    // --- downstream (stochastic mode) ---

    pub fn downstream_relay(&self) -> Option<RelayAddr> {
        self.downstream_relay
    }

    pub fn unicast_probability(&self) -> f64 {
        self.unicast_probability
    }

    /// Install the routing decision computed by the stochastic layer
    pub fn set_downstream(&mut self, relay: Option<RelayAddr>, unicast_probability: f64) {
        self.downstream_relay = relay;
        self.unicast_probability = unicast_probability.clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn policy() -> AckingPolicy {
        AckingPolicy {
            count_threshold: 10,
            interval_min: 1_000,
            interval_max: 100_000,
        }
    }

    fn entry() -> FibEntry {
        let flow = FlowDescription::to_group(IpAddr::from([239, 1, 2, 3]));
        FibEntry::new(flow, ForwardingStatus::Block, policy(), 10, 0)
    }

    fn timeouts() -> RelayTimeouts {
        RelayTimeouts {
            active_timeout: 20_000_000,
            idle_timeout: 120_000_000,
        }
    }

    #[test]
    fn test_refresh_counts_and_is_age_idempotent() {
        let mut entry = entry();
        entry.refresh(5_000);
        entry.refresh(5_000);
        assert_eq!(entry.update_count(), 2);
        assert_eq!(entry.peek_age(5_000), 0);
    }

    #[test]
    fn test_update_pending_thresholds() {
        let mut entry = entry();
        entry.reset_update_window(0);
        for _ in 0..10 {
            entry.refresh(500);
        }
        // Count met, interval not.
        assert!(!entry.update_pending(500));
        assert!(entry.update_pending(1_000));
    }

    #[test]
    fn test_update_pending_max_interval_escalates() {
        let mut entry = entry();
        entry.reset_update_window(0);
        entry.refresh(10);
        assert!(!entry.update_pending(50_000));
        assert!(entry.update_pending(100_000));
    }

    #[test]
    fn test_wildcard_forwarding_status() {
        let mut entry = entry();
        entry.process_packet(1, 0);
        entry.process_packet(2, 0);
        entry.set_forwarding_status(IFACE_WILDCARD, ForwardingStatus::Forward, true, 0);
        assert_eq!(entry.forwarding_status(1), ForwardingStatus::Forward);
        assert_eq!(entry.forwarding_status(2), ForwardingStatus::Forward);
        // The default also covers interfaces without a bucket yet.
        assert_eq!(entry.forwarding_status(9), ForwardingStatus::Forward);
        assert_eq!(entry.forwarding_count(), 2);
    }

    #[test]
    fn test_forwarding_count_tracks_per_iface_changes() {
        let mut entry = entry();
        entry.set_forwarding_status(1, ForwardingStatus::Forward, true, 0);
        entry.set_forwarding_status(2, ForwardingStatus::Forward, true, 0);
        assert_eq!(entry.forwarding_count(), 2);
        entry.set_forwarding_status(1, ForwardingStatus::Block, true, 0);
        assert_eq!(entry.forwarding_count(), 1);
    }

    #[test]
    fn test_activate_resets_state() {
        let mut entry = entry();
        entry.refresh(100);
        entry.refresh(200);
        entry.activate(1_000);
        assert!(entry.is_active());
        assert!(!entry.is_idle());
        assert_eq!(entry.update_count(), 1);
        assert_eq!(entry.peek_age(1_000), 0);
    }

    #[test]
    fn test_deactivate_moves_to_idle() {
        let mut entry = entry();
        entry.activate(1_000);
        entry.deactivate(2_000);
        assert!(!entry.is_active());
        assert!(entry.is_idle());
        assert_eq!(entry.peek_age(2_000), 0);
    }

    #[test]
    fn test_best_relay_prefers_path_metric() {
        let mut entry = entry();
        let lq_only = RelayAddr::v4(10, 0, 0, 1);
        let advertising = RelayAddr::v4(10, 0, 0, 2);
        entry.relay_or_create(lq_only, 1, 0).set_link_quality(0.9);
        entry
            .relay_or_create(advertising, 1, 0)
            .record_advertisement(5.0, 8, 2, 0);
        let best = entry.best_upstream_relay(timeouts(), 100);
        assert_eq!(best, Some(advertising));
        assert_eq!(
            entry.relay(&advertising).unwrap().status(),
            RelayStatus::Primary
        );
    }

    #[test]
    fn test_best_relay_hysteresis() {
        let mut entry = entry();
        let incumbent = RelayAddr::v4(10, 0, 0, 1);
        let challenger = RelayAddr::v4(10, 0, 0, 2);
        // Incumbent advertises metric 9, link quality 1.0: combined 10.
        let relay = entry.relay_or_create(incumbent, 1, 0);
        relay.record_advertisement(9.0, 8, 2, 0);
        relay.set_link_quality(1.0);
        assert_eq!(entry.best_upstream_relay(timeouts(), 100), Some(incumbent));

        // 5% better does not unseat the incumbent.
        let relay = entry.relay_or_create(challenger, 1, 0);
        relay.record_advertisement(8.5, 8, 2, 0);
        relay.set_link_quality(1.0);
        assert_eq!(entry.best_upstream_relay(timeouts(), 200), Some(incumbent));

        // 11% better does.
        let relay = entry.relay_mut(&challenger).unwrap();
        relay.record_advertisement(7.9, 8, 2, 200);
        relay.set_link_quality(1.0);
        assert_eq!(entry.best_upstream_relay(timeouts(), 300), Some(challenger));
        assert_eq!(
            entry.relay(&incumbent).unwrap().status(),
            RelayStatus::Secondary
        );
    }

    #[test]
    fn test_best_relay_stale_incumbent_loses_to_fresh() {
        let mut entry = entry();
        let incumbent = RelayAddr::v4(10, 0, 0, 1);
        let challenger = RelayAddr::v4(10, 0, 0, 2);
        let relay = entry.relay_or_create(incumbent, 1, 0);
        relay.record_advertisement(9.0, 8, 2, 0);
        assert_eq!(entry.best_upstream_relay(timeouts(), 100), Some(incumbent));

        // Challenger is barely worse but the incumbent has gone stale.
        let later = 25_000_000;
        let relay = entry.relay_or_create(challenger, 1, later);
        relay.record_advertisement(9.2, 8, 2, later);
        assert_eq!(
            entry.best_upstream_relay(timeouts(), later),
            Some(challenger)
        );
    }

    #[test]
    fn test_best_relay_prunes_idle() {
        let mut entry = entry();
        let gone = RelayAddr::v4(10, 0, 0, 1);
        entry.relay_or_create(gone, 1, 0).set_link_quality(0.9);
        assert_eq!(entry.best_upstream_relay(timeouts(), 100), Some(gone));
        // Far past the idle timeout the relay is removed outright.
        assert_eq!(entry.best_upstream_relay(timeouts(), 130_000_000), None);
        assert_eq!(entry.relay_count(), 0);
    }

    #[test]
    fn test_best_relay_falls_back_to_link_quality() {
        let mut entry = entry();
        let a = RelayAddr::v4(10, 0, 0, 1);
        let b = RelayAddr::v4(10, 0, 0, 2);
        entry.relay_or_create(a, 1, 0).set_link_quality(0.5);
        entry.relay_or_create(b, 1, 0).set_link_quality(0.8);
        assert_eq!(entry.best_upstream_relay(timeouts(), 100), Some(b));
    }

    #[test]
    fn test_downstream_probability_is_clamped() {
        let mut entry = entry();
        entry.set_downstream(Some(RelayAddr::v4(10, 0, 0, 9)), 1.7);
        assert_eq!(entry.unicast_probability(), 1.0);
    }
}
