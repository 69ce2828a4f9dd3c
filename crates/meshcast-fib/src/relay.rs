//! Upstream relay state and per-hop reception history
//!
//! Every FIB entry keeps one [`UpstreamRelay`] per previous-hop address
//! it has heard the flow from, holding the relay's advertised path
//! metric and the locally measured link quality. Relay ranking and the
//! acknowledgement-pending policy both live here.
//!
//! [`UpstreamHistory`] is independent of any flow entry: it tracks the
//! sequence numbers seen from a previous hop across all flows and
//! maintains an exponentially-weighted loss estimate from the gaps.

use serde::{Deserialize, Serialize};

use meshcast_core::{ActivityStatus, RelayAddr, Tick, tick_age};

/// Smoothing weight for the loss estimate (1/8, classic EWMA)
const LOSS_ALPHA: f64 = 0.125;

/// Shared acknowledgement/controller-notification trigger policy
///
/// An update is pending when the accumulated count reaches
/// `count_threshold` *and* at least `interval_min` ticks have elapsed
/// since the window opened, or unconditionally once `interval_max` ticks
/// have elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckingPolicy {
    pub count_threshold: u32,
    pub interval_min: u32,
    pub interval_max: u32,
}

impl AckingPolicy {
    /// Evaluate the trigger for a (count, window-start) pair
    pub fn pending(&self, count: u32, window_start: Tick, now: Tick) -> bool {
        let elapsed = tick_age(now, window_start);
        (count >= self.count_threshold && elapsed >= self.interval_min)
            || elapsed >= self.interval_max
    }
}

/// Role of an upstream relay for a flow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayStatus {
    /// Heard from, not selected
    #[default]
    Nullary,
    /// Currently selected relay
    Primary,
    /// Backup relay kept warm
    Secondary,
}

/// Per-previous-hop relay state owned by a FIB entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamRelay {
    addr: RelayAddr,
    iface_index: u32,
    status: RelayStatus,
    update_count: u32,
    update_start: Tick,
    activity: ActivityStatus,
    adv_metric: Option<f64>,
    adv_ttl: u8,
    hop_count: u8,
    link_quality: Option<f64>,
}

impl UpstreamRelay {
    pub fn new(addr: RelayAddr, iface_index: u32, now: Tick) -> Self {
        Self {
            addr,
            iface_index,
            status: RelayStatus::Nullary,
            update_count: 0,
            update_start: now,
            activity: ActivityStatus::refreshed(now),
            adv_metric: None,
            adv_ttl: 0,
            hop_count: 0,
            link_quality: None,
        }
    }

    pub fn addr(&self) -> RelayAddr {
        self.addr
    }

    pub fn iface_index(&self) -> u32 {
        self.iface_index
    }

    pub fn status(&self) -> RelayStatus {
        self.status
    }

    pub fn set_status(&mut self, status: RelayStatus) {
        self.status = status;
    }

    /// Record a non-duplicate packet heard from this relay
    pub fn refresh(&mut self, now: Tick) {
        self.update_count += 1;
        self.activity.refresh(now);
    }

    /// Age in ticks (auto-invalidates on overflow)
    pub fn age(&mut self, now: Tick) -> u32 {
        self.activity.age(now)
    }

    /// Age without side effects
    pub fn age_hint(&self, now: Tick) -> u32 {
        self.activity.peek_age(now)
    }

    pub fn update_count(&self) -> u32 {
        self.update_count
    }

    /// Whether an acknowledgement toward this relay is due
    pub fn ack_pending(&self, policy: &AckingPolicy, now: Tick) -> bool {
        self.update_count > 0 && policy.pending(self.update_count, self.update_start, now)
    }

    /// Open a new update window after an acknowledgement went out
    pub fn reset_update_window(&mut self, now: Tick) {
        self.update_count = 0;
        self.update_start = now;
    }

    /// Take in an advertisement from this relay
    pub fn record_advertisement(&mut self, metric: f64, ttl: u8, hop_count: u8, now: Tick) {
        self.adv_metric = Some(metric);
        self.adv_ttl = ttl;
        self.hop_count = hop_count;
        self.activity.refresh(now);
    }

    pub fn advertised_metric(&self) -> Option<f64> {
        self.adv_metric
    }

    pub fn advertised_ttl(&self) -> u8 {
        self.adv_ttl
    }

    pub fn hop_count(&self) -> u8 {
        self.hop_count
    }

    /// Update the measured one-hop link quality (0.0..=1.0)
    pub fn set_link_quality(&mut self, quality: f64) {
        self.link_quality = Some(quality.clamp(0.0, 1.0));
    }

    pub fn link_quality(&self) -> Option<f64> {
        self.link_quality
    }

    /// Combined path metric: advertised metric plus the one-hop cost
    ///
    /// The hop cost is `1 / link_quality`, or 1 when no link-quality
    /// measurement exists yet. `None` when the relay has never
    /// advertised a metric.
    pub fn path_metric(&self) -> Option<f64> {
        let metric = self.adv_metric?;
        let hop_cost = match self.link_quality {
            Some(quality) if quality > 0.0 => 1.0 / quality,
            _ => 1.0,
        };
        Some(metric + hop_cost)
    }
}

/// Sequence-gap loss tracking for a previous hop, across flows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamHistory {
    addr: RelayAddr,
    last_seq: Option<u16>,
    idle_count: u32,
    loss_estimate: f64,
    activity: ActivityStatus,
}

impl UpstreamHistory {
    pub fn new(addr: RelayAddr, now: Tick) -> Self {
        Self {
            addr,
            last_seq: None,
            idle_count: 0,
            loss_estimate: 0.0,
            activity: ActivityStatus::refreshed(now),
        }
    }

    pub fn addr(&self) -> RelayAddr {
        self.addr
    }

    /// Fold a received sequence number into the loss estimate
    ///
    /// Returns the number of packets inferred lost before `seq`.
    /// Duplicates and reordered arrivals (non-positive wrapping delta)
    /// leave the estimate untouched.
    pub fn record_seq(&mut self, seq: u16, now: Tick) -> u32 {
        self.idle_count = 0;
        self.activity.refresh(now);
        let lost = match self.last_seq {
            None => 0,
            Some(last) => {
                let delta = seq.wrapping_sub(last) as i16;
                if delta <= 0 {
                    return 0;
                }
                (delta - 1) as u32
            }
        };
        self.last_seq = Some(seq);
        // One delivery observed alongside `lost` losses.
        let observed = lost as f64 / (lost as f64 + 1.0);
        self.loss_estimate += LOSS_ALPHA * (observed - self.loss_estimate);
        lost
    }

    /// Estimated loss fraction (0.0..=1.0)
    pub fn loss_estimate(&self) -> f64 {
        self.loss_estimate
    }

    /// Link quality derived from the loss estimate
    pub fn link_quality(&self) -> f64 {
        (1.0 - self.loss_estimate).clamp(0.0, 1.0)
    }

    /// Bump the idle counter during a GC sweep; returns the new count
    pub fn bump_idle(&mut self) -> u32 {
        self.idle_count += 1;
        self.idle_count
    }

    pub fn idle_count(&self) -> u32 {
        self.idle_count
    }

    /// Age in ticks (auto-invalidates on overflow)
    pub fn age(&mut self, now: Tick) -> u32 {
        self.activity.age(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay() -> UpstreamRelay {
        UpstreamRelay::new(RelayAddr::v4(10, 0, 0, 1), 1, 1_000)
    }

    #[test]
    fn test_acking_policy_count_and_min_interval() {
        let policy = AckingPolicy {
            count_threshold: 10,
            interval_min: 1_000,
            interval_max: 100_000,
        };
        // Count met but window too young.
        assert!(!policy.pending(10, 0, 500));
        // Count and interval both met.
        assert!(policy.pending(10, 0, 1_000));
        // Count unmet, interval_max escalates unconditionally.
        assert!(policy.pending(0, 0, 100_000));
        assert!(!policy.pending(9, 0, 99_999));
    }

    #[test]
    fn test_relay_ack_pending_requires_traffic() {
        let policy = AckingPolicy {
            count_threshold: 1,
            interval_min: 0,
            interval_max: 50_000,
        };
        let mut relay = relay();
        assert!(!relay.ack_pending(&policy, 2_000));
        relay.refresh(2_000);
        assert!(relay.ack_pending(&policy, 2_000));
        relay.reset_update_window(2_000);
        assert!(!relay.ack_pending(&policy, 2_500));
    }

    #[test]
    fn test_path_metric_uses_link_quality() {
        let mut relay = relay();
        assert_eq!(relay.path_metric(), None);

        relay.record_advertisement(4.0, 12, 3, 2_000);
        // No measurement yet: hop cost defaults to 1.
        assert_eq!(relay.path_metric(), Some(5.0));

        relay.set_link_quality(0.5);
        assert_eq!(relay.path_metric(), Some(6.0));
    }

    #[test]
    fn test_history_counts_gaps() {
        let mut history = UpstreamHistory::new(RelayAddr::v4(10, 0, 0, 2), 0);
        assert_eq!(history.record_seq(100, 10), 0);
        assert_eq!(history.record_seq(101, 20), 0);
        // 102 and 103 never arrived.
        assert_eq!(history.record_seq(104, 30), 2);
        assert!(history.loss_estimate() > 0.0);
        assert!(history.link_quality() < 1.0);
    }

    #[test]
    fn test_history_ignores_duplicates_and_reordering() {
        let mut history = UpstreamHistory::new(RelayAddr::v4(10, 0, 0, 2), 0);
        history.record_seq(50, 10);
        let estimate = history.loss_estimate();
        assert_eq!(history.record_seq(50, 20), 0);
        assert_eq!(history.record_seq(49, 30), 0);
        assert_eq!(history.loss_estimate(), estimate);
    }

    #[test]
    fn test_history_seq_wrap() {
        let mut history = UpstreamHistory::new(RelayAddr::v4(10, 0, 0, 2), 0);
        history.record_seq(u16::MAX, 10);
        // Wraps to 0 with no loss.
        assert_eq!(history.record_seq(0, 20), 0);
        // Gap of one straddling the wrap window.
        assert_eq!(history.record_seq(2, 30), 1);
    }

    #[test]
    fn test_history_idle_counter() {
        let mut history = UpstreamHistory::new(RelayAddr::v4(10, 0, 0, 2), 0);
        assert_eq!(history.bump_idle(), 1);
        assert_eq!(history.bump_idle(), 2);
        history.record_seq(1, 40);
        assert_eq!(history.idle_count(), 0);
    }

    #[test]
    fn test_loss_estimate_converges_upward() {
        let mut history = UpstreamHistory::new(RelayAddr::v4(10, 0, 0, 3), 0);
        let mut seq = 0u16;
        history.record_seq(seq, 0);
        // Lose every other packet for a while.
        for tick in 1..200u32 {
            seq = seq.wrapping_add(2);
            history.record_seq(seq, tick * 100);
        }
        // Half the packets are missing; the estimate approaches 0.5.
        assert!((history.loss_estimate() - 0.5).abs() < 0.05);
    }
}
