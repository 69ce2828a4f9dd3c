//! Per-flow reinforcement-learned next-hop metrics
//!
//! For every flow routed stochastically, [`RlData`] keeps one
//! [`NextHopMetric`] per candidate next-hop address:
//!
//! - **Q**: expected remaining hop-cost to the destination through that
//!   next hop, learned from acknowledged Q factors (`+1` per hop).
//! - **C**: reliability of delivery through that next hop. Every packet
//!   sent discounts C by the learning rate; every acknowledgement
//!   reinforces it.
//!
//! Because acknowledgements lag the packets in flight, raw C
//! under-reports reliability while the pipe is full. The *correction
//! factor* counts how many packets were still unacknowledged after the
//! acknowledged one was sent, and
//! [`corrected_c`](NextHopMetric::corrected) rescales C by the discount
//! those in-flight packets applied.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use meshcast_core::{ActivityStatus, RelayAddr, Tick};

/// Cap on tracked unacknowledged packets per next hop
pub const MAX_SENT_PACKETS: usize = 200;

/// Sentinel cost for a next hop we have never heard back from
pub const INITIAL_Q: f64 = 99.0;

/// A sent packet awaiting acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentPacket {
    pub seq: u16,
    pub frag_offset: u32,
}

/// Learned state for one (flow, next-hop) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextHopMetric {
    q: f64,
    c: f64,
    correction_factor: u32,
    correction_threshold: u32,
    need_advertisement: bool,
}

impl NextHopMetric {
    fn new() -> Self {
        Self {
            q: INITIAL_Q,
            c: 0.0,
            correction_factor: 0,
            correction_threshold: 0,
            need_advertisement: true,
        }
    }

    /// Expected remaining hop-cost
    pub fn q(&self) -> f64 {
        self.q
    }

    /// Raw reliability estimate
    pub fn c(&self) -> f64 {
        self.c
    }

    pub fn correction_factor(&self) -> u32 {
        self.correction_factor
    }

    pub fn correction_threshold(&self) -> u32 {
        self.correction_threshold
    }

    /// Reliability rescaled for the discount applied by in-flight packets
    pub fn corrected(&self, learning_rate: f64) -> f64 {
        self.c / (1.0 - learning_rate).powi(self.correction_factor as i32)
    }

    /// Whether this metric changed since it was last advertised
    pub fn needs_advertisement(&self) -> bool {
        self.need_advertisement
    }

    /// Mark the metric as advertised
    pub fn clear_advertisement(&mut self) {
        self.need_advertisement = false;
    }
}

/// Per-flow learning state: metrics and in-flight tracking per next hop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlData {
    learning_rate: f64,
    metrics: HashMap<RelayAddr, NextHopMetric>,
    sent_packets: HashMap<RelayAddr, VecDeque<SentPacket>>,
    iface_index: u32,
    activity: ActivityStatus,
}

impl RlData {
    pub fn new(learning_rate: f64, iface_index: u32, now: Tick) -> Self {
        Self {
            learning_rate,
            metrics: HashMap::new(),
            sent_packets: HashMap::new(),
            iface_index,
            activity: ActivityStatus::refreshed(now),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn iface_index(&self) -> u32 {
        self.iface_index
    }

    pub fn metric(&self, addr: &RelayAddr) -> Option<&NextHopMetric> {
        self.metrics.get(addr)
    }

    pub fn metric_mut(&mut self, addr: &RelayAddr) -> Option<&mut NextHopMetric> {
        self.metrics.get_mut(addr)
    }

    pub fn metrics(&self) -> impl Iterator<Item = (&RelayAddr, &NextHopMetric)> {
        self.metrics.iter()
    }

    pub fn next_hop_count(&self) -> usize {
        self.metrics.len()
    }

    /// In-flight packets tracked toward `addr`
    pub fn sent_count(&self, addr: &RelayAddr) -> usize {
        self.sent_packets.get(addr).map_or(0, VecDeque::len)
    }

    /// Age in ticks since the last send or acknowledgement
    pub fn age(&mut self, now: Tick) -> u32 {
        self.activity.age(now)
    }

    /// Account a packet sent toward `addr`
    ///
    /// Discounts the reliability estimate, widens the correction
    /// threshold by one, and appends the packet to the bounded in-flight
    /// list (evicting the oldest entry when full).
    pub fn process_sent_packet(&mut self, addr: RelayAddr, seq: u16, frag_offset: u32, now: Tick) {
        self.activity.refresh(now);
        let metric = self.metrics.entry(addr).or_insert_with(NextHopMetric::new);
        metric.c *= 1.0 - self.learning_rate;
        metric.correction_threshold += 1;

        let sent = self.sent_packets.entry(addr).or_default();
        if sent.len() >= MAX_SENT_PACKETS {
            sent.pop_front();
        }
        sent.push_back(SentPacket { seq, frag_offset });
        trace!(next_hop = %addr, seq, in_flight = sent.len(), "sent packet tracked");
    }

    /// Fold an acknowledgement from `addr` into the learned state
    ///
    /// Returns the correction factor observed for this acknowledgement.
    pub fn update(
        &mut self,
        addr: RelayAddr,
        ack_q: f64,
        ack_c: f64,
        seq: u16,
        frag_offset: u32,
        now: Tick,
    ) -> u32 {
        self.activity.refresh(now);
        let rate = self.learning_rate;
        let metric = self.metrics.entry(addr).or_insert_with(NextHopMetric::new);

        // Weight the cost update by the acknowledged confidence, or by
        // how little confidence we currently hold, whichever is larger.
        let alpha = ack_c.max(1.0 - metric.c / (1.0 - rate));
        metric.q += alpha * (ack_q + 1.0 - metric.q);

        // How many still-unacknowledged packets went out after this one.
        // An entry missing from a live list is indistinguishable from a
        // packet sent before tracking began, and is counted as if every
        // remaining in-flight packet followed it; that approximation is
        // inherited from the correction model.
        let correction = match self.sent_packets.get_mut(&addr) {
            None => 0,
            Some(sent) => {
                match sent
                    .iter()
                    .position(|p| p.seq == seq && p.frag_offset == frag_offset)
                {
                    Some(position) => {
                        let after = (sent.len() - position - 1) as u32;
                        sent.remove(position);
                        after
                    }
                    None => sent.len() as u32,
                }
            }
        };

        metric.c += rate * (1.0 - rate).powi(correction as i32) * ack_c;

        // Only a correction at or under the stored threshold tightens the
        // pair; larger values come from out-of-order acknowledgements and
        // would inflate the apparent correction.
        if correction <= metric.correction_threshold {
            metric.correction_factor = correction;
            metric.correction_threshold = correction;
        }
        metric.need_advertisement = true;

        debug!(
            next_hop = %addr,
            q = metric.q,
            c = metric.c,
            correction,
            "acknowledgement folded into metrics"
        );
        correction
    }

    /// Corrected reliability toward `addr` (0 when unknown)
    pub fn corrected_c(&self, addr: &RelayAddr) -> f64 {
        self.metrics
            .get(addr)
            .map_or(0.0, |metric| metric.corrected(self.learning_rate))
    }

    /// Select the next hop for this flow
    ///
    /// First pass: cheapest Q among next hops whose corrected
    /// reliability clears `reliability_threshold`. Fallback: minimize
    /// the risk-adjusted cost `Q * (1 - min(1, corrected C))`.
    pub fn next_hop(&self, reliability_threshold: f64) -> Option<RelayAddr> {
        let reliable = self
            .metrics
            .iter()
            .filter(|(_, metric)| metric.corrected(self.learning_rate) > reliability_threshold)
            .min_by(|a, b| {
                a.1.q
                    .partial_cmp(&b.1.q)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(addr, _)| *addr);
        if reliable.is_some() {
            return reliable;
        }

        self.metrics
            .iter()
            .min_by(|a, b| {
                let risk_a = a.1.q * (1.0 - a.1.corrected(self.learning_rate).min(1.0));
                let risk_b = b.1.q * (1.0 - b.1.corrected(self.learning_rate).min(1.0));
                risk_a
                    .partial_cmp(&risk_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(addr, _)| *addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: f64 = 0.25;

    fn hop(d: u8) -> RelayAddr {
        RelayAddr::v4(10, 0, 0, d)
    }

    fn rl() -> RlData {
        RlData::new(RATE, 1, 0)
    }

    #[test]
    fn test_first_ack_initializes_sentinel_then_learns() {
        let mut rl = rl();
        rl.update(hop(1), 1.0, 1.0, 7, 0, 10);
        let metric = rl.metric(&hop(1)).unwrap();
        // alpha = max(1, ...) = 1, so Q jumps straight to ackQ + 1.
        assert!((metric.q() - 2.0).abs() < 1e-9);
        assert!(metric.c() > 0.0);
    }

    #[test]
    fn test_correction_counts_packets_sent_after() {
        let mut rl = rl();
        rl.process_sent_packet(hop(1), 1, 0, 10);
        rl.process_sent_packet(hop(1), 2, 0, 20);
        rl.process_sent_packet(hop(1), 3, 0, 30);

        let correction = rl.update(hop(1), 1.0, 1.0, 1, 0, 40);
        assert_eq!(correction, 2);
        assert_eq!(rl.metric(&hop(1)).unwrap().correction_factor(), 2);
        // The acknowledged packet left the in-flight list.
        assert_eq!(rl.sent_count(&hop(1)), 2);
    }

    #[test]
    fn test_missing_entry_counts_full_list() {
        let mut rl = rl();
        rl.process_sent_packet(hop(1), 5, 0, 10);
        rl.process_sent_packet(hop(1), 6, 0, 20);
        // Seq 2 predates tracking: treated as older than everything.
        let correction = rl.update(hop(1), 1.0, 1.0, 2, 0, 30);
        assert_eq!(correction, 2);
        assert_eq!(rl.sent_count(&hop(1)), 2);
    }

    #[test]
    fn test_no_list_means_zero_correction() {
        let mut rl = rl();
        let correction = rl.update(hop(1), 1.0, 1.0, 9, 0, 10);
        assert_eq!(correction, 0);
    }

    #[test]
    fn test_fragment_offset_distinguishes_packets() {
        let mut rl = rl();
        rl.process_sent_packet(hop(1), 1, 0, 10);
        rl.process_sent_packet(hop(1), 1, 512, 20);
        let correction = rl.update(hop(1), 1.0, 1.0, 1, 0, 30);
        assert_eq!(correction, 1);
        assert_eq!(rl.sent_count(&hop(1)), 1);
    }

    #[test]
    fn test_sent_list_is_bounded() {
        let mut rl = rl();
        for seq in 0..(MAX_SENT_PACKETS as u16 + 10) {
            rl.process_sent_packet(hop(1), seq, 0, seq as u32);
        }
        assert_eq!(rl.sent_count(&hop(1)), MAX_SENT_PACKETS);
        // The oldest entries were evicted; acking one of them counts the
        // whole remaining list.
        let correction = rl.update(hop(1), 1.0, 1.0, 0, 0, 1_000);
        assert_eq!(correction, MAX_SENT_PACKETS as u32);
    }

    #[test]
    fn test_out_of_order_ack_does_not_inflate_correction() {
        let mut rl = rl();
        for seq in 1..=4u16 {
            rl.process_sent_packet(hop(1), seq, 0, seq as u32 * 10);
        }
        // Ack seq 4 first: nothing sent after it, correction tightens to 0.
        assert_eq!(rl.update(hop(1), 1.0, 1.0, 4, 0, 100), 0);
        assert_eq!(rl.metric(&hop(1)).unwrap().correction_factor(), 0);

        // The late ack for seq 1 observes correction 2, above the
        // tightened threshold, so the stored factor stays put.
        assert_eq!(rl.update(hop(1), 1.0, 1.0, 1, 0, 110), 2);
        let metric = rl.metric(&hop(1)).unwrap();
        assert_eq!(metric.correction_factor(), 0);
        assert_eq!(metric.correction_threshold(), 0);
    }

    #[test]
    fn test_send_discounts_reliability() {
        let mut rl = rl();
        rl.update(hop(1), 1.0, 1.0, 1, 0, 10);
        let before = rl.metric(&hop(1)).unwrap().c();
        rl.process_sent_packet(hop(1), 2, 0, 20);
        let after = rl.metric(&hop(1)).unwrap().c();
        assert!((after - before * (1.0 - RATE)).abs() < 1e-12);
    }

    #[test]
    fn test_corrected_c_amplifies_for_in_flight() {
        let mut rl = rl();
        rl.update(hop(1), 1.0, 1.0, 1, 0, 10);
        for seq in 2..=3u16 {
            rl.process_sent_packet(hop(1), seq, 0, seq as u32 * 10);
        }
        // Two in flight, then an ack of the older one observes
        // correction 1 (one packet after it).
        rl.update(hop(1), 1.0, 1.0, 2, 0, 40);
        let metric = rl.metric(&hop(1)).unwrap();
        assert_eq!(metric.correction_factor(), 1);
        let corrected = metric.corrected(RATE);
        assert!(corrected > metric.c());
        assert!((corrected - metric.c() / (1.0 - RATE)).abs() < 1e-12);
    }

    #[test]
    fn test_q_converges_to_acked_cost_plus_hop() {
        let mut rl = rl();
        for i in 0..50u16 {
            rl.update(hop(1), 3.0, 1.0, i, 0, i as u32 * 10);
        }
        let metric = rl.metric(&hop(1)).unwrap();
        assert!((metric.q() - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_next_hop_prefers_cheap_reliable() {
        let mut rl = rl();
        // Reliable and cheap.
        for i in 0..20u16 {
            rl.update(hop(1), 1.0, 1.0, i, 0, i as u32);
        }
        // Reliable but expensive.
        for i in 0..20u16 {
            rl.update(hop(2), 5.0, 1.0, i, 0, i as u32);
        }
        assert_eq!(rl.next_hop(0.8), Some(hop(1)));
    }

    #[test]
    fn test_next_hop_falls_back_to_risk_adjusted() {
        let mut rl = rl();
        // Neither hop clears a high reliability bar; hop 2 has higher
        // confidence, making its risk-adjusted cost lower despite a
        // slightly worse Q.
        rl.update(hop(1), 1.0, 0.1, 0, 0, 10);
        rl.update(hop(2), 1.5, 0.9, 0, 0, 20);
        assert_eq!(rl.next_hop(0.999), Some(hop(2)));
    }

    #[test]
    fn test_next_hop_empty() {
        let rl = rl();
        assert_eq!(rl.next_hop(0.5), None);
    }

    #[test]
    fn test_advertisement_flag_lifecycle() {
        let mut rl = rl();
        rl.update(hop(1), 1.0, 1.0, 0, 0, 10);
        assert!(rl.metric(&hop(1)).unwrap().needs_advertisement());
        rl.metric_mut(&hop(1)).unwrap().clear_advertisement();
        assert!(!rl.metric(&hop(1)).unwrap().needs_advertisement());
        rl.update(hop(1), 1.0, 1.0, 1, 0, 20);
        assert!(rl.metric(&hop(1)).unwrap().needs_advertisement());
    }
}
