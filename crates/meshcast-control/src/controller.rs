//! Relay controller orchestration
//!
//! The [`Controller`] owns every table in the relay core — flow table,
//! membership table, policy table, metric table, per-hop histories —
//! and mutates them from the event handlers the surrounding daemon
//! wires up: packet arrival, acknowledgements, IGMP group records, and
//! timer expiries. Handlers run to completion on a single thread; the
//! tick clock is refreshed on entry to every handler that depends on
//! elapsed time.
//!
//! Packet emission and timers are injected capabilities
//! ([`FrameSender`], [`RelayTimer`]), so the controller never touches
//! sockets or the OS timer wheel itself.

use std::collections::HashMap;
use std::net::IpAddr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace, warn};

use meshcast_core::{
    ElasticAck, ElasticAdvertisement, ElasticNack, FilterMode, FlowDescription, FrameSender,
    GroupRecord, RelayAddr, RelayPath, RelayTimer, SmartAck, Tick, TickClock,
};
use meshcast_fib::{
    EntryId, FibEntry, FibError, FlowTable, ForwardingStatus, IFACE_WILDCARD, MembershipEvent,
    MembershipFlag, MembershipKey, MembershipTable, PolicyTable, UpstreamHistory,
};
use meshcast_srr::{MetricTable, broadcast_probability};

use crate::decision::{RelayDecision, SuppressReason};
use crate::error::{ControlError, ControlResult};
use crate::{ControlConfig, RelayMode};

/// A forwarding-plane packet arrival, as seen by the control plane
#[derive(Debug, Clone)]
pub struct PacketEvent {
    /// Fully-specified flow description from the packet classifier
    pub flow: FlowDescription,
    /// Previous hop the packet was heard from
    pub prev_hop: RelayAddr,
    /// Interface the packet arrived on
    pub iface_index: u32,
    pub seq: u16,
    pub frag_offset: u32,
    pub ttl: u8,
}

/// The relay control plane
pub struct Controller<F: FrameSender, T: RelayTimer> {
    config: ControlConfig,
    local_addr: RelayAddr,
    clock: TickClock,
    flows: FlowTable,
    memberships: MembershipTable,
    policies: PolicyTable,
    metrics: MetricTable,
    histories: HashMap<RelayAddr, UpstreamHistory>,
    sender: F,
    membership_timer: T,
    prune_timer: T,
    /// Ring-leader tick the membership timer is currently armed for
    scheduled_leader: Option<Tick>,
    rng: StdRng,
}

impl<F: FrameSender, T: RelayTimer> Controller<F, T> {
    pub fn new(
        config: ControlConfig,
        local_addr: RelayAddr,
        sender: F,
        membership_timer: T,
        prune_timer: T,
    ) -> Self {
        let rng = StdRng::from_os_rng();
        Self::with_rng(config, local_addr, sender, membership_timer, prune_timer, rng)
    }

    /// Construct with a seeded generator, for reproducible runs
    pub fn with_seed(
        config: ControlConfig,
        local_addr: RelayAddr,
        sender: F,
        membership_timer: T,
        prune_timer: T,
        seed: u64,
    ) -> Self {
        let rng = StdRng::seed_from_u64(seed);
        Self::with_rng(config, local_addr, sender, membership_timer, prune_timer, rng)
    }

    fn with_rng(
        config: ControlConfig,
        local_addr: RelayAddr,
        sender: F,
        membership_timer: T,
        prune_timer: T,
        rng: StdRng,
    ) -> Self {
        let flows = FlowTable::new(config.fib.max_flows);
        let memberships = MembershipTable::new(config.fib.membership_idle_threshold);
        Self {
            config,
            local_addr,
            clock: TickClock::new(),
            flows,
            memberships,
            policies: PolicyTable::new(),
            metrics: MetricTable::new(),
            histories: HashMap::new(),
            sender,
            membership_timer,
            prune_timer,
            scheduled_leader: None,
            rng,
        }
    }

    /// Arm the periodic prune timer
    pub fn start(&mut self) {
        self.prune_timer
            .set_interval(std::time::Duration::from_micros(
                self.config.prune_interval as u64,
            ));
        self.prune_timer.activate();
    }

    // --- accessors ---

    pub fn local_addr(&self) -> RelayAddr {
        self.local_addr
    }

    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    pub fn memberships(&self) -> &MembershipTable {
        &self.memberships
    }

    pub fn metrics(&self) -> &MetricTable {
        &self.metrics
    }

    pub fn policies_mut(&mut self) -> &mut PolicyTable {
        &mut self.policies
    }

    pub fn sender(&self) -> &F {
        &self.sender
    }

    pub fn sender_mut(&mut self) -> &mut F {
        &mut self.sender
    }

    pub fn membership_timer(&self) -> &T {
        &self.membership_timer
    }

    pub fn prune_timer(&self) -> &T {
        &self.prune_timer
    }

    /// The tick clock, for deterministic advancement in tests and sims
    pub fn clock_mut(&mut self) -> &mut TickClock {
        &mut self.clock
    }

    // --- event handlers ---

    /// Handle a forwarding-plane packet arrival
    ///
    /// Looks up (or creates) the FIB entry, refreshes activity and the
    /// previous-hop state, meters the packet, emits an EM-ACK upstream
    /// when the acknowledgement trigger fires, and returns the relay
    /// decision for the forwarder to execute.
    pub fn on_packet(&mut self, event: &PacketEvent) -> ControlResult<RelayDecision> {
        let now = self.clock.update();

        let id = match self.flows.find_exact(&event.flow) {
            Some(id) => id,
            None => match self.create_entry(&event.flow, now) {
                Ok(id) => id,
                Err(FibError::TableFull { max }) => {
                    warn!(flow = %event.flow, max, "flow table full, dropping flow");
                    return Ok(RelayDecision::suppress(SuppressReason::TableFull));
                }
                Err(err) => return Err(err.into()),
            },
        };

        // Sequence-gap loss estimation for the previous hop.
        let link_quality = {
            let history = self
                .histories
                .entry(event.prev_hop)
                .or_insert_with(|| UpstreamHistory::new(event.prev_hop, now));
            history.record_seq(event.seq, now);
            history.link_quality()
        };

        let newly_active = !self.flows.get(id).ok_or(FibError::StaleEntryId)?.is_active();
        if newly_active {
            self.flows.activate_flow(id, now)?;
        }

        let relay_timeouts = self.config.fib.relay_timeouts();
        let (passed, status, ack_upstream) = {
            let entry = self.flows.get_mut(id).ok_or(FibError::StaleEntryId)?;
            if !newly_active {
                entry.refresh(now);
            }
            entry.set_ttl(event.ttl);
            let relay = entry.relay_or_create(event.prev_hop, event.iface_index, now);
            relay.refresh(now);
            relay.set_link_quality(link_quality);

            let status = entry.forwarding_status(event.iface_index);
            let passed = entry.process_packet(event.iface_index, now);

            let ack_upstream = if entry.is_acking() && entry.update_pending(now) {
                entry.best_upstream_relay(relay_timeouts, now)
            } else {
                None
            };
            (passed, status, ack_upstream)
        };

        if let Some(upstream) = ack_upstream {
            let mut path = RelayPath::new();
            path.append(upstream)?;
            let ack = ElasticAck {
                flow: event.flow.clone(),
                upstream: path,
            };
            debug!(flow = %event.flow, upstream = %upstream, "sending EM-ACK upstream");
            self.sender
                .send_elastic_ack(event.iface_index, upstream, &ack);
            if let Some(entry) = self.flows.get_mut(id) {
                entry.reset_update_window(now);
                if let Some(relay) = entry.relay_mut(&upstream) {
                    relay.reset_update_window(now);
                }
            }
        }

        if !passed {
            let reason = match status {
                ForwardingStatus::Deny => SuppressReason::Denied,
                ForwardingStatus::Block => SuppressReason::NotForwarding,
                _ => SuppressReason::NoTokens,
            };
            trace!(flow = %event.flow, ?reason, "packet suppressed");
            return Ok(RelayDecision::suppress(reason));
        }

        match self.config.mode {
            RelayMode::Elastic => Ok(RelayDecision::broadcast(event.iface_index, 1.0)),
            RelayMode::Stochastic => {
                let entry = self.flows.get(id).ok_or(FibError::StaleEntryId)?;
                let unicast_probability = entry.unicast_probability();
                match entry.downstream_relay() {
                    Some(next_hop) if self.rng.random::<f64>() < unicast_probability => {
                        let rl = self.metrics.rl_or_create(
                            &event.flow,
                            self.config.srr.learning_rate,
                            event.iface_index,
                            now,
                        );
                        rl.process_sent_packet(next_hop, event.seq, event.frag_offset, now);
                        Ok(RelayDecision::unicast(
                            event.iface_index,
                            next_hop,
                            unicast_probability,
                        ))
                    }
                    _ => Ok(RelayDecision::broadcast(
                        event.iface_index,
                        1.0 - unicast_probability,
                    )),
                }
            }
        }
    }

    /// Handle an EM-ACK from a downstream node
    ///
    /// Being acknowledged makes this node a relay for the flow on the
    /// receiving interface, and tracks the acknowledging node as an
    /// elastic membership with its own timeout.
    pub fn on_elastic_ack(
        &mut self,
        iface_index: u32,
        from: RelayAddr,
        ack: &ElasticAck,
    ) -> ControlResult<()> {
        let now = self.clock.update();

        if !ack.upstream.is_empty() && !ack.upstream.contains(&self.local_addr) {
            trace!(flow = %ack.flow, "EM-ACK not addressed to this relay");
            return Ok(());
        }

        let id = match self.flows.find_exact(&ack.flow) {
            Some(id) => id,
            None => self.create_entry(&ack.flow, now)?,
        };
        let entry = self.flows.get_mut(id).ok_or(FibError::StaleEntryId)?;
        entry.set_forwarding_status(iface_index, ForwardingStatus::Forward, true, now);
        debug!(flow = %ack.flow, from = %from, "EM-ACK: forwarding enabled");

        let key = MembershipKey::any_source(iface_index, ack.flow.dst);
        let timeout = now.wrapping_add(self.config.elastic_membership_timeout);
        self.memberships
            .activate(key.clone(), MembershipFlag::Elastic, timeout);
        if let Some(member) = self.memberships.member_mut(&key) {
            member.refresh_downstream(from);
        }
        self.sync_membership_timer(now);
        Ok(())
    }

    /// Handle an EM-NACK from a downstream node
    ///
    /// The reported sequence feeds the loss estimate for the path; the
    /// negative acknowledgement still proves the downstream listener is
    /// alive, so the elastic membership is refreshed as well.
    pub fn on_elastic_nack(
        &mut self,
        iface_index: u32,
        from: RelayAddr,
        nack: &ElasticNack,
    ) -> ControlResult<()> {
        let now = self.clock.update();

        let history = self
            .histories
            .entry(from)
            .or_insert_with(|| UpstreamHistory::new(from, now));
        history.record_seq(nack.seq, now);
        let link_quality = history.link_quality();

        if let Some(id) = self.flows.find_best_match(&nack.flow)
            && let Some(entry) = self.flows.get_mut(id)
            && let Some(relay) = entry.relay_mut(&from)
        {
            relay.set_link_quality(link_quality);
        }

        let key = MembershipKey::any_source(iface_index, nack.flow.dst);
        let timeout = now.wrapping_add(self.config.elastic_membership_timeout);
        self.memberships
            .activate(key.clone(), MembershipFlag::Elastic, timeout);
        if let Some(member) = self.memberships.member_mut(&key) {
            member.refresh_downstream(from);
        }
        self.sync_membership_timer(now);
        Ok(())
    }

    /// Handle a path advertisement from an upstream relay
    pub fn on_advertisement(
        &mut self,
        iface_index: u32,
        adv: &ElasticAdvertisement,
    ) -> ControlResult<()> {
        let now = self.clock.update();
        let id = match self.flows.find_exact(&adv.flow) {
            Some(id) => id,
            None => self.create_entry(&adv.flow, now)?,
        };
        let relay_timeouts = self.config.fib.relay_timeouts();
        let entry = self.flows.get_mut(id).ok_or(FibError::StaleEntryId)?;
        entry
            .relay_or_create(adv.relay, iface_index, now)
            .record_advertisement(adv.metric, adv.ttl, adv.hop_count, now);
        let best = entry.best_upstream_relay(relay_timeouts, now);
        trace!(flow = %adv.flow, best = ?best, "advertisement folded into relay ranking");
        Ok(())
    }

    /// Handle a SmartAck acknowledgement (stochastic mode only)
    ///
    /// Folds the acknowledged Q/C factors into the flow's metric state,
    /// recomputes the preferred next hop and the broadcast probability,
    /// and pushes the resulting routing decision into the FIB.
    pub fn on_smart_ack(&mut self, iface_index: u32, ack: &SmartAck) -> ControlResult<()> {
        if self.config.mode != RelayMode::Stochastic {
            return Err(ControlError::WrongMode {
                mode: self.config.mode.name(),
            });
        }
        let now = self.clock.update();

        self.metrics.record_candidate(ack.source, iface_index, now);
        let rl = self.metrics.rl_or_create(
            &ack.flow,
            self.config.srr.learning_rate,
            iface_index,
            now,
        );
        rl.update(
            ack.source,
            ack.q_factor as f64,
            ack.c_factor as f64,
            ack.seq,
            ack.frag_offset,
            now,
        );

        let next_hop = rl.next_hop(self.config.srr.reliability_threshold);
        let corrected = next_hop.map_or(0.0, |hop| rl.corrected_c(&hop));
        let probability = self.broadcast_probability_for(&ack.flow, corrected);

        let id = match self.flows.find_exact(&ack.flow) {
            Some(id) => id,
            None => self.create_entry(&ack.flow, now)?,
        };
        let entry = self.flows.get_mut(id).ok_or(FibError::StaleEntryId)?;
        entry.set_downstream(next_hop, 1.0 - probability);
        debug!(
            flow = %ack.flow,
            next_hop = ?next_hop,
            broadcast_probability = probability,
            "routing decision pushed to FIB"
        );
        Ok(())
    }

    /// Broadcast probability for a flow, with competing-flow suppression
    ///
    /// Flows with numerically lower traffic classes are more urgent;
    /// their own expected broadcast load suppresses this flow's
    /// probability. The controller's metric table is authoritative for
    /// the competing flows' next hops.
    pub fn broadcast_probability_for(&self, flow: &FlowDescription, corrected_c: f64) -> f64 {
        let mut probability =
            broadcast_probability(self.config.srr.min_broadcast_prob, corrected_c);

        let my_class = flow.traffic_class.unwrap_or(u8::MAX);
        let mut suppression = 0.0;
        for (other_flow, rl) in self.metrics.flows() {
            if other_flow == flow {
                continue;
            }
            let other_class = other_flow.traffic_class.unwrap_or(u8::MAX);
            if other_class >= my_class {
                continue;
            }
            let Some(hop) = rl.next_hop(self.config.srr.reliability_threshold) else {
                continue;
            };
            let other_probability = broadcast_probability(
                self.config.srr.min_broadcast_prob,
                rl.corrected_c(&hop),
            );
            suppression += other_probability / 2.0;
        }

        (probability * (1.0 - suppression).max(0.0)).clamp(0.0, 1.0)
    }

    /// Handle a pre-parsed IGMP group record
    pub fn on_group_record(&mut self, record: &GroupRecord) -> ControlResult<()> {
        let now = self.clock.update();
        let timeout = now.wrapping_add(self.config.managed_membership_timeout);

        if record.is_leave_all() {
            let keys: Vec<MembershipKey> = self
                .memberships
                .iter()
                .filter(|member| {
                    member.key().iface_index == record.iface_index
                        && member.key().group == record.group
                })
                .map(|member| member.key().clone())
                .collect();
            for key in keys {
                self.memberships.deactivate(&key, MembershipFlag::Managed);
            }
            debug!(group = %record.group, iface = record.iface_index, "IGMP leave");
        } else if record.is_join_all() {
            self.memberships.activate(
                MembershipKey::any_source(record.iface_index, record.group),
                MembershipFlag::Managed,
                timeout,
            );
            debug!(group = %record.group, iface = record.iface_index, "IGMP join");
        } else {
            match record.mode {
                FilterMode::Include => {
                    for source in &record.sources {
                        self.memberships.activate(
                            MembershipKey::with_source(record.iface_index, record.group, *source),
                            MembershipFlag::Managed,
                            timeout,
                        );
                    }
                }
                // Source exclusions are tracked at group granularity.
                FilterMode::Exclude => {
                    self.memberships.activate(
                        MembershipKey::any_source(record.iface_index, record.group),
                        MembershipFlag::Managed,
                        timeout,
                    );
                }
            }
        }

        self.update_group_forwarding(record.iface_index, &record.group, now);
        self.sync_membership_timer(now);
        Ok(())
    }

    /// Handle the membership timer firing
    pub fn on_membership_timeout(&mut self) -> ControlResult<()> {
        let now = self.clock.update();
        let sweep = self.memberships.on_timeout(now);
        for event in &sweep.events {
            let key = match event {
                MembershipEvent::Demoted { key, .. } => key,
                MembershipEvent::Removed { key } => key,
            };
            self.update_group_forwarding(key.iface_index, &key.group, now);
        }
        // The drain consumed the armed leader; force a fresh schedule.
        self.scheduled_leader = None;
        self.sync_membership_timer(now);
        Ok(())
    }

    /// Handle the periodic prune timer firing
    pub fn on_prune_timeout(&mut self) -> ControlResult<()> {
        let now = self.clock.update();
        let stats = self.flows.prune(self.config.fib.flow_timeouts(), now);
        let dropped = self.metrics.prune(self.config.srr.metric_max_age, now);
        trace!(?stats, dropped, "prune sweep");

        let history_threshold = self.config.fib.history_idle_threshold;
        self.histories
            .retain(|_, history| history.bump_idle() < history_threshold);

        let downstream_threshold = self.config.fib.membership_idle_threshold;
        for member in self.memberships.iter_mut() {
            member.age_downstream(downstream_threshold);
        }

        self.prune_timer.reschedule();
        Ok(())
    }

    // --- internals ---

    fn create_entry(
        &mut self,
        flow: &FlowDescription,
        now: Tick,
    ) -> Result<EntryId, FibError> {
        let mut entry = FibEntry::new(
            flow.clone(),
            ForwardingStatus::Block,
            self.config.fib.acking,
            self.config.fib.bucket_depth,
            now,
        );
        if let Some(policy) = self.policies.best_match(flow) {
            entry.set_policy(true);
            entry.set_managed(policy.managed);
            entry.set_forwarding_status(
                IFACE_WILDCARD,
                policy.action.forwarding_status(),
                false,
                now,
            );
            if let Some(rate) = policy.action.rate() {
                entry.set_rate(IFACE_WILDCARD, rate, now);
            }
            debug!(flow = %flow, action = ?policy.action, "policy applied to new flow");
        }
        self.flows.insert(entry)
    }

    /// Recompute forwarding/acking for entries of `group` on one interface
    ///
    /// Forwarding stays enabled while any membership for the group lives
    /// on the interface; acking stays enabled while any membership for
    /// the group is still elastic.
    fn update_group_forwarding(&mut self, iface_index: u32, group: &IpAddr, now: Tick) {
        let mut forward = false;
        let mut acking = false;
        for member in self.memberships.members_of_group(group) {
            if member.key().iface_index == iface_index {
                forward = true;
            }
            if member.is_elastic() {
                acking = true;
            }
        }

        let ids: Vec<EntryId> = self
            .flows
            .iter()
            .filter(|(_, entry)| entry.flow().dst == *group)
            .map(|(id, _)| id)
            .collect();
        for id in ids {
            if let Some(entry) = self.flows.get_mut(id) {
                let status = if forward {
                    ForwardingStatus::Forward
                } else {
                    entry.default_status()
                };
                entry.set_forwarding_status(iface_index, status, acking, now);
            }
        }
    }

    /// Re-arm the membership timer when the ring leader moved
    fn sync_membership_timer(&mut self, now: Tick) {
        let leader = self.memberships.next_timeout();
        if leader == self.scheduled_leader {
            return;
        }
        self.scheduled_leader = leader;
        match self.memberships.timer_interval(now) {
            Some(interval) => {
                self.membership_timer.set_interval(interval);
                if self.membership_timer.is_active() {
                    self.membership_timer.reschedule();
                } else {
                    self.membership_timer.activate();
                }
            }
            None => self.membership_timer.deactivate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    use meshcast_core::mock::{ManualTimer, RecordingSender};
    use meshcast_fib::{FlowPolicy, PolicyAction};
    use meshcast_core::TICK_RATE;

    type TestController = Controller<RecordingSender, ManualTimer>;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn controller(config: ControlConfig) -> TestController {
        init_tracing();
        Controller::with_seed(
            config,
            RelayAddr::v4(10, 0, 0, 1),
            RecordingSender::new(),
            ManualTimer::new(),
            ManualTimer::new(),
            7,
        )
    }

    fn group_flow(d: u8) -> FlowDescription {
        FlowDescription::to_group(IpAddr::from([239, 1, 1, d]))
            .with_traffic_class(4)
            .with_protocol(17)
    }

    fn packet(flow: &FlowDescription, seq: u16) -> PacketEvent {
        PacketEvent {
            flow: flow.clone(),
            prev_hop: RelayAddr::v4(10, 0, 0, 9),
            iface_index: 1,
            seq,
            frag_offset: 0,
            ttl: 8,
        }
    }

    #[test]
    fn test_first_packet_creates_and_activates_flow() {
        let mut controller = controller(ControlConfig::default());
        let flow = group_flow(1);
        let decision = controller.on_packet(&packet(&flow, 1)).unwrap();

        // Default status is Block: track the flow but do not relay yet.
        assert_eq!(
            decision.suppress_reason(),
            Some(SuppressReason::NotForwarding)
        );
        let id = controller.flows().find_exact(&flow).unwrap();
        let entry = controller.flows().get(id).unwrap();
        assert!(entry.is_active());
        assert_eq!(entry.update_count(), 1);
        assert_eq!(controller.flows().active_flows().first(), Some(&id));
    }

    #[test]
    fn test_deny_policy_suppresses() {
        let mut controller = controller(ControlConfig::default());
        let flow = group_flow(1);
        controller.policies_mut().insert(FlowPolicy {
            flow: FlowDescription::to_group(flow.dst),
            action: PolicyAction::Deny,
            managed: false,
        });
        let decision = controller.on_packet(&packet(&flow, 1)).unwrap();
        assert_eq!(decision.suppress_reason(), Some(SuppressReason::Denied));
    }

    #[test]
    fn test_allow_policy_broadcasts() {
        let mut controller = controller(ControlConfig::default());
        let flow = group_flow(1);
        controller.policies_mut().insert(FlowPolicy {
            flow: FlowDescription::to_group(flow.dst),
            action: PolicyAction::Allow,
            managed: true,
        });
        let decision = controller.on_packet(&packet(&flow, 1)).unwrap();
        assert!(decision.is_broadcast());

        let id = controller.flows().find_exact(&flow).unwrap();
        let entry = controller.flows().get(id).unwrap();
        assert!(entry.is_policy());
        assert!(entry.is_managed());
    }

    #[test]
    fn test_limit_policy_exhausts_tokens() {
        let mut controller = controller(ControlConfig::default());
        let flow = group_flow(1);
        controller.policies_mut().insert(FlowPolicy {
            flow: FlowDescription::to_group(flow.dst),
            action: PolicyAction::Limit(100.0),
            managed: false,
        });
        // Bucket depth is 10; the burst passes, the 11th packet does not.
        for seq in 0..10 {
            let decision = controller.on_packet(&packet(&flow, seq)).unwrap();
            assert!(decision.is_broadcast(), "packet {} should pass", seq);
        }
        let decision = controller.on_packet(&packet(&flow, 10)).unwrap();
        assert_eq!(decision.suppress_reason(), Some(SuppressReason::NoTokens));
    }

    #[test]
    fn test_flow_table_capacity() {
        let mut config = ControlConfig::default();
        config.fib.max_flows = 1;
        let mut controller = controller(config);
        controller.on_packet(&packet(&group_flow(1), 1)).unwrap();
        let decision = controller.on_packet(&packet(&group_flow(2), 1)).unwrap();
        assert_eq!(decision.suppress_reason(), Some(SuppressReason::TableFull));
    }

    #[test]
    fn test_elastic_ack_enables_forwarding_and_membership() {
        let mut controller = controller(ControlConfig::default());
        let flow = group_flow(1);
        let downstream = RelayAddr::v4(10, 0, 0, 7);
        let ack = ElasticAck {
            flow: flow.clone(),
            upstream: RelayPath::new(),
        };
        controller.on_elastic_ack(1, downstream, &ack).unwrap();

        let id = controller.flows().find_exact(&flow).unwrap();
        let entry = controller.flows().get(id).unwrap();
        assert_eq!(entry.forwarding_status(1), ForwardingStatus::Forward);
        assert!(entry.is_acking());

        let key = MembershipKey::any_source(1, flow.dst);
        let member = controller.memberships().member(&key).unwrap();
        assert!(member.is_elastic());
        assert!(member.has_downstream(&downstream));
        assert!(controller.membership_timer().is_active());
    }

    #[test]
    fn test_elastic_ack_for_other_relay_is_ignored() {
        let mut controller = controller(ControlConfig::default());
        let flow = group_flow(1);
        let mut upstream = RelayPath::new();
        upstream.append(RelayAddr::v4(10, 0, 0, 200)).unwrap();
        let ack = ElasticAck {
            flow: flow.clone(),
            upstream,
        };
        controller
            .on_elastic_ack(1, RelayAddr::v4(10, 0, 0, 7), &ack)
            .unwrap();
        assert!(controller.flows().find_exact(&flow).is_none());
        assert!(controller.memberships().is_empty());
    }

    #[test]
    fn test_ack_trigger_emits_em_ack_upstream() {
        let mut controller = controller(ControlConfig::default());
        let flow = group_flow(1);

        // A downstream ack makes this node an acking relay for the flow.
        let ack = ElasticAck {
            flow: flow.clone(),
            upstream: RelayPath::new(),
        };
        controller
            .on_elastic_ack(1, RelayAddr::v4(10, 0, 0, 7), &ack)
            .unwrap();

        // First packet activates; let the minimum ack interval elapse,
        // then meet the count threshold.
        controller.on_packet(&packet(&flow, 1)).unwrap();
        controller.clock_mut().advance(2 * TICK_RATE / 10);
        for seq in 2..=10 {
            controller.on_packet(&packet(&flow, seq)).unwrap();
        }

        let acks = &controller.sender().elastic_acks;
        assert_eq!(acks.len(), 1);
        let (iface, upstream, sent) = &acks[0];
        assert_eq!(*iface, 1);
        // The only known upstream relay is the previous hop.
        assert_eq!(*upstream, RelayAddr::v4(10, 0, 0, 9));
        assert_eq!(sent.flow, flow);
        assert!(sent.upstream.contains(upstream));

        // The update window reopened: no immediate second ack.
        let id = controller.flows().find_exact(&flow).unwrap();
        assert_eq!(controller.flows().get(id).unwrap().update_count(), 0);
    }

    #[test]
    fn test_advertisement_ranks_upstream_relay() {
        let mut controller = controller(ControlConfig::default());
        let flow = group_flow(1);
        let relay = RelayAddr::v4(10, 0, 0, 5);
        let adv = ElasticAdvertisement {
            flow: flow.clone(),
            relay,
            metric: 3.0,
            ttl: 12,
            hop_count: 2,
        };
        controller.on_advertisement(1, &adv).unwrap();

        let id = controller.flows().find_exact(&flow).unwrap();
        let entry = controller.flows().get(id).unwrap();
        assert_eq!(entry.current_best_relay(), Some(relay));
        assert_eq!(entry.relay(&relay).unwrap().advertised_metric(), Some(3.0));
    }

    #[test]
    fn test_smart_ack_requires_stochastic_mode() {
        let mut controller = controller(ControlConfig::default());
        let ack = SmartAck {
            flow: group_flow(1),
            source: RelayAddr::v4(10, 0, 0, 5),
            q_factor: 1.0,
            c_factor: 1.0,
            seq: 1,
            frag_offset: 0,
        };
        let result = controller.on_smart_ack(1, &ack);
        assert!(matches!(result, Err(ControlError::WrongMode { .. })));
    }

    #[test]
    fn test_smart_ack_pushes_routing_decision() {
        let mut controller = controller(ControlConfig::stochastic());
        let flow = group_flow(1);
        let next_hop = RelayAddr::v4(10, 0, 0, 5);
        for seq in 0..10 {
            let ack = SmartAck {
                flow: flow.clone(),
                source: next_hop,
                q_factor: 1.0,
                c_factor: 1.0,
                seq,
                frag_offset: 0,
            };
            controller.on_smart_ack(1, &ack).unwrap();
        }

        let id = controller.flows().find_exact(&flow).unwrap();
        let entry = controller.flows().get(id).unwrap();
        assert_eq!(entry.downstream_relay(), Some(next_hop));
        // Full confidence: broadcast probability sits at the floor.
        let expected = 1.0 - controller.config.srr.min_broadcast_prob;
        assert!((entry.unicast_probability() - expected).abs() < 1e-9);
        assert_eq!(controller.metrics().candidate_count(), 1);
    }

    #[test]
    fn test_stochastic_forwarding_mixes_unicast_and_broadcast() {
        let mut controller = controller(ControlConfig::stochastic());
        let flow = group_flow(1);
        controller.policies_mut().insert(FlowPolicy {
            flow: FlowDescription::to_group(flow.dst),
            action: PolicyAction::Allow,
            managed: false,
        });
        let next_hop = RelayAddr::v4(10, 0, 0, 5);
        for seq in 0..10 {
            let ack = SmartAck {
                flow: flow.clone(),
                source: next_hop,
                q_factor: 1.0,
                c_factor: 1.0,
                seq,
                frag_offset: 0,
            };
            controller.on_smart_ack(1, &ack).unwrap();
        }

        let mut unicast = 0;
        for seq in 0..100 {
            let decision = controller.on_packet(&packet(&flow, seq)).unwrap();
            assert!(decision.is_forwarding());
            if decision.is_unicast() {
                assert_eq!(decision.next_hop(), Some(next_hop));
                unicast += 1;
            }
        }
        // Unicast probability is 0.9; the draw is seeded, the bound loose.
        assert!(unicast > 60, "unicast count was {}", unicast);
        assert!(unicast < 100);

        // Every unicast packet is tracked as in flight toward the hop.
        let rl = controller.metrics().rl(&flow).unwrap();
        assert_eq!(rl.sent_count(&next_hop), unicast);
    }

    #[test]
    fn test_broadcast_probability_suppressed_by_urgent_flows() {
        let mut controller = controller(ControlConfig::stochastic());
        let urgent = FlowDescription::to_group(IpAddr::from([239, 1, 1, 1]))
            .with_traffic_class(0)
            .with_protocol(17);
        let bulk = FlowDescription::to_group(IpAddr::from([239, 1, 1, 2]))
            .with_traffic_class(5)
            .with_protocol(17);
        for seq in 0..10 {
            let ack = SmartAck {
                flow: urgent.clone(),
                source: RelayAddr::v4(10, 0, 0, 5),
                q_factor: 1.0,
                c_factor: 1.0,
                seq,
                frag_offset: 0,
            };
            controller.on_smart_ack(1, &ack).unwrap();
        }

        let unsuppressed = broadcast_probability(controller.config.srr.min_broadcast_prob, 0.0);
        let suppressed = controller.broadcast_probability_for(&bulk, 0.0);
        assert!(suppressed < unsuppressed);
        assert!(suppressed > 0.0);

        // The urgent flow itself sees no suppression from the bulk flow.
        let urgent_probability = controller.broadcast_probability_for(&urgent, 0.0);
        assert!((urgent_probability - unsuppressed).abs() < 1e-9);
    }

    #[test]
    fn test_group_record_join_enables_forwarding() {
        let mut controller = controller(ControlConfig::default());
        let flow = group_flow(1);
        controller.on_packet(&packet(&flow, 1)).unwrap();

        let record = GroupRecord {
            iface_index: 2,
            group: flow.dst,
            sources: vec![],
            mode: FilterMode::Exclude,
        };
        controller.on_group_record(&record).unwrap();

        let key = MembershipKey::any_source(2, flow.dst);
        assert!(controller.memberships().member(&key).unwrap().is_managed());
        assert!(controller.membership_timer().is_active());

        let id = controller.flows().find_exact(&flow).unwrap();
        let entry = controller.flows().get(id).unwrap();
        assert_eq!(entry.forwarding_status(2), ForwardingStatus::Forward);
    }

    #[test]
    fn test_group_record_leave_disables_forwarding() {
        let mut controller = controller(ControlConfig::default());
        let flow = group_flow(1);
        controller.on_packet(&packet(&flow, 1)).unwrap();

        let join = GroupRecord {
            iface_index: 2,
            group: flow.dst,
            sources: vec![],
            mode: FilterMode::Exclude,
        };
        controller.on_group_record(&join).unwrap();
        let leave = GroupRecord {
            mode: FilterMode::Include,
            ..join
        };
        controller.on_group_record(&leave).unwrap();

        assert!(controller.memberships().is_empty());
        assert!(!controller.membership_timer().is_active());
        let id = controller.flows().find_exact(&flow).unwrap();
        let entry = controller.flows().get(id).unwrap();
        assert_eq!(entry.forwarding_status(2), ForwardingStatus::Block);
    }

    #[test]
    fn test_membership_timeout_demotes_forwarding() {
        let mut controller = controller(ControlConfig::default());
        let flow = group_flow(1);
        let ack = ElasticAck {
            flow: flow.clone(),
            upstream: RelayPath::new(),
        };
        controller
            .on_elastic_ack(1, RelayAddr::v4(10, 0, 0, 7), &ack)
            .unwrap();

        // Let the elastic membership lifetime elapse.
        let lifetime = controller.config.elastic_membership_timeout;
        controller.clock_mut().advance(lifetime + TICK_RATE);
        controller.on_membership_timeout().unwrap();

        assert!(controller.memberships().is_empty());
        assert!(!controller.membership_timer().is_active());
        let id = controller.flows().find_exact(&flow).unwrap();
        let entry = controller.flows().get(id).unwrap();
        assert_eq!(entry.forwarding_status(1), ForwardingStatus::Block);
        assert!(!entry.is_acking());
    }

    #[test]
    fn test_prune_timer_lifecycle() {
        let mut controller = controller(ControlConfig::default());
        controller.start();
        assert!(controller.prune_timer().is_active());
        let armed = controller.prune_timer().arm_count;

        controller.on_packet(&packet(&group_flow(1), 1)).unwrap();
        controller.on_prune_timeout().unwrap();
        assert_eq!(controller.prune_timer().arm_count, armed + 1);
        // A freshly active flow survives the sweep.
        assert_eq!(controller.flows().len(), 1);
    }

    #[test]
    fn test_prune_removes_stale_flows_and_histories() {
        let mut controller = controller(ControlConfig::default());
        let flow = group_flow(1);
        controller.on_packet(&packet(&flow, 1)).unwrap();

        // Past the active timeout the flow demotes to idle; past the
        // idle timeout it disappears.
        let active = controller.config.fib.flow_active_timeout;
        let idle = controller.config.fib.flow_idle_timeout;
        controller.clock_mut().advance(active + TICK_RATE);
        controller.on_prune_timeout().unwrap();
        let id = controller.flows().find_exact(&flow).unwrap();
        assert!(controller.flows().get(id).unwrap().is_idle());

        controller.clock_mut().advance(idle + TICK_RATE);
        controller.on_prune_timeout().unwrap();
        assert!(controller.flows().find_exact(&flow).is_none());

        // Histories idle out after enough sweeps without traffic.
        for _ in 0..controller.config.fib.history_idle_threshold {
            controller.on_prune_timeout().unwrap();
        }
        assert!(controller.histories.is_empty());
    }
}
