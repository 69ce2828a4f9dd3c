//! Group membership tracking with a sorted timeout ring
//!
//! A [`Membership`] records that receivers exist for a (interface,
//! group[, source]) triple. The same membership can be tracked three
//! ways at once: `STATIC` (configured, never expires), `ELASTIC`
//! (learned from acknowledgements) and `MANAGED` (learned from IGMP),
//! and the two expiring flags each carry their own timeout tick.
//!
//! All pending timeouts live in one sorted ring ordered by timeout tick,
//! with the earliest entry — the *ring leader* — at the front so the
//! next-timeout query is O(1). A membership occupies at most one ring
//! position at a time, held by whichever flag's timeout is more
//! imminent; when that flag is deactivated or expires while the other
//! flag still has a live timeout, the membership is re-armed under the
//! other flag rather than silently dropping out of the ring.
//!
//! Ring order uses wrapping tick comparison, which is a consistent total
//! order while every pending timeout lies within `TICK_AGE_MAX` of the
//! current tick — the same bound the tick clock already imposes.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use meshcast_core::{RelayAddr, Tick, tick_delta};

/// Membership tracking flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipFlags(u8);

impl MembershipFlags {
    pub const STATIC: MembershipFlags = MembershipFlags(0x01);
    pub const ELASTIC: MembershipFlags = MembershipFlags(0x02);
    pub const MANAGED: MembershipFlags = MembershipFlags(0x04);

    pub fn contains(&self, flag: MembershipFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn set(&mut self, flag: MembershipFlags) {
        self.0 |= flag.0;
    }

    pub fn clear(&mut self, flag: MembershipFlags) {
        self.0 &= !flag.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// How a membership is being activated or deactivated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipFlag {
    Static,
    Elastic,
    Managed,
}

impl MembershipFlag {
    fn bit(&self) -> MembershipFlags {
        match self {
            Self::Static => MembershipFlags::STATIC,
            Self::Elastic => MembershipFlags::ELASTIC,
            Self::Managed => MembershipFlags::MANAGED,
        }
    }
}

/// Which expiring flag holds the ring position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutFlag {
    Elastic,
    Managed,
}

impl From<TimeoutFlag> for MembershipFlag {
    fn from(flag: TimeoutFlag) -> Self {
        match flag {
            TimeoutFlag::Elastic => MembershipFlag::Elastic,
            TimeoutFlag::Managed => MembershipFlag::Managed,
        }
    }
}

/// Identifies a membership: interface, group, optional source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MembershipKey {
    pub iface_index: u32,
    pub group: IpAddr,
    pub source: Option<IpAddr>,
}

impl MembershipKey {
    pub fn any_source(iface_index: u32, group: IpAddr) -> Self {
        Self {
            iface_index,
            group,
            source: None,
        }
    }

    pub fn with_source(iface_index: u32, group: IpAddr, source: IpAddr) -> Self {
        Self {
            iface_index,
            group,
            source: Some(source),
        }
    }
}

/// One tracked group membership
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    key: MembershipKey,
    flags: MembershipFlags,
    idle_count: u32,
    idle_threshold: u32,
    elastic_timeout: Option<Tick>,
    managed_timeout: Option<Tick>,
    ring_flag: Option<TimeoutFlag>,
    /// Acknowledging next hops with per-relay idle counts
    downstream: HashMap<RelayAddr, u32>,
}

impl Membership {
    fn new(key: MembershipKey, idle_threshold: u32) -> Self {
        Self {
            key,
            flags: MembershipFlags::default(),
            idle_count: 0,
            idle_threshold,
            elastic_timeout: None,
            managed_timeout: None,
            ring_flag: None,
            downstream: HashMap::new(),
        }
    }

    pub fn key(&self) -> &MembershipKey {
        &self.key
    }

    pub fn flags(&self) -> MembershipFlags {
        self.flags
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(MembershipFlags::STATIC)
    }

    pub fn is_elastic(&self) -> bool {
        self.flags.contains(MembershipFlags::ELASTIC)
    }

    pub fn is_managed(&self) -> bool {
        self.flags.contains(MembershipFlags::MANAGED)
    }

    pub fn elastic_timeout(&self) -> Option<Tick> {
        self.elastic_timeout
    }

    pub fn managed_timeout(&self) -> Option<Tick> {
        self.managed_timeout
    }

    /// Flag currently holding this membership's ring position
    pub fn ring_flag(&self) -> Option<TimeoutFlag> {
        self.ring_flag
    }

    /// Timeout tick of the held ring position
    pub fn ring_tick(&self) -> Option<Tick> {
        match self.ring_flag? {
            TimeoutFlag::Elastic => self.elastic_timeout,
            TimeoutFlag::Managed => self.managed_timeout,
        }
    }

    /// Record an acknowledging downstream next hop
    pub fn refresh_downstream(&mut self, relay: RelayAddr) {
        self.downstream.insert(relay, 0);
        self.idle_count = 0;
    }

    /// Bump every downstream idle counter, dropping relays that cross
    /// `threshold`; returns the dropped addresses
    pub fn age_downstream(&mut self, threshold: u32) -> Vec<RelayAddr> {
        let mut dropped = Vec::new();
        self.downstream.retain(|addr, idle| {
            *idle += 1;
            if *idle >= threshold {
                dropped.push(*addr);
                false
            } else {
                true
            }
        });
        dropped
    }

    pub fn downstream_count(&self) -> usize {
        self.downstream.len()
    }

    pub fn has_downstream(&self, relay: &RelayAddr) -> bool {
        self.downstream.contains_key(relay)
    }

    /// Bump the membership idle counter; true once the threshold is hit
    pub fn bump_idle(&mut self) -> bool {
        self.idle_count += 1;
        self.idle_count >= self.idle_threshold
    }

    pub fn reset_idle(&mut self) {
        self.idle_count = 0;
    }

    fn pending_reactivation(&self) -> Option<(Tick, TimeoutFlag)> {
        let elastic = self
            .flags
            .contains(MembershipFlags::ELASTIC)
            .then_some(self.elastic_timeout)
            .flatten()
            .map(|tick| (tick, TimeoutFlag::Elastic));
        let managed = self
            .flags
            .contains(MembershipFlags::MANAGED)
            .then_some(self.managed_timeout)
            .flatten()
            .map(|tick| (tick, TimeoutFlag::Managed));
        match (elastic, managed) {
            (Some(e), Some(m)) => {
                if tick_delta(e.0, m.0) <= 0 {
                    Some(e)
                } else {
                    Some(m)
                }
            }
            (Some(e), None) => Some(e),
            (None, Some(m)) => Some(m),
            (None, None) => None,
        }
    }
}

/// A membership whose timeout fired during a drain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A flag expired but the membership survives under other flags
    Demoted {
        key: MembershipKey,
        expired: TimeoutFlag,
    },
    /// The last flag expired and the membership was removed
    Removed { key: MembershipKey },
}

/// Result of draining expired ring entries
#[derive(Debug, Clone, Default)]
pub struct TimeoutSweep {
    pub events: Vec<MembershipEvent>,
    /// Next pending timeout, or `None` to deactivate the timer
    pub next_timeout: Option<Tick>,
}

/// All tracked memberships plus the shared timeout ring
#[derive(Debug, Default)]
pub struct MembershipTable {
    members: HashMap<MembershipKey, Membership>,
    /// Sorted by timeout tick (wrapping order); front is the ring leader
    ring: Vec<(Tick, MembershipKey)>,
    idle_threshold: u32,
}

impl MembershipTable {
    pub fn new(idle_threshold: u32) -> Self {
        Self {
            members: HashMap::new(),
            ring: Vec::new(),
            idle_threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member(&self, key: &MembershipKey) -> Option<&Membership> {
        self.members.get(key)
    }

    pub fn member_mut(&mut self, key: &MembershipKey) -> Option<&mut Membership> {
        self.members.get_mut(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Membership> {
        self.members.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Membership> {
        self.members.values_mut()
    }

    /// Memberships matching a group on any interface
    pub fn members_of_group(&self, group: &IpAddr) -> impl Iterator<Item = &Membership> {
        self.members
            .values()
            .filter(move |member| member.key.group == *group)
    }

    /// Activate a membership under `flag`
    ///
    /// `STATIC` never enters the ring; for the expiring flags the ring
    /// position moves to whichever flag's timeout is controlling
    /// (earlier), and a later timeout under the non-controlling flag is
    /// recorded without disturbing the ring.
    pub fn activate(&mut self, key: MembershipKey, flag: MembershipFlag, timeout: Tick) {
        let idle_threshold = self.idle_threshold;
        let member = self
            .members
            .entry(key.clone())
            .or_insert_with(|| Membership::new(key.clone(), idle_threshold));
        member.flags.set(flag.bit());
        member.reset_idle();

        let timeout_flag = match flag {
            MembershipFlag::Static => return,
            MembershipFlag::Elastic => {
                member.elastic_timeout = Some(timeout);
                TimeoutFlag::Elastic
            }
            MembershipFlag::Managed => {
                member.managed_timeout = Some(timeout);
                TimeoutFlag::Managed
            }
        };

        match member.ring_flag {
            None => {
                member.ring_flag = Some(timeout_flag);
                Self::ring_insert(&mut self.ring, timeout, key);
            }
            Some(held) if held == timeout_flag => {
                Self::ring_remove(&mut self.ring, &key);
                Self::ring_insert(&mut self.ring, timeout, key);
            }
            Some(_) => {
                // Held under the other flag: take the position over only
                // if the new timeout becomes the controlling (earlier) one.
                let held_tick = member.ring_tick().expect("ring position without timeout");
                if tick_delta(timeout, held_tick) < 0 {
                    member.ring_flag = Some(timeout_flag);
                    Self::ring_remove(&mut self.ring, &key);
                    Self::ring_insert(&mut self.ring, timeout, key);
                }
            }
        }
        trace!(ring_len = self.ring.len(), "membership activated");
    }

    /// Deactivate `flag` for a membership
    ///
    /// If the deactivated flag held the ring position and the other flag
    /// still carries a pending timeout, the membership is re-armed under
    /// that flag. Returns `true` when the membership was removed because
    /// no flags remain.
    pub fn deactivate(&mut self, key: &MembershipKey, flag: MembershipFlag) -> bool {
        let Some(member) = self.members.get_mut(key) else {
            return false;
        };
        member.flags.clear(flag.bit());
        match flag {
            MembershipFlag::Static => {}
            MembershipFlag::Elastic => {
                member.elastic_timeout = None;
                if member.ring_flag == Some(TimeoutFlag::Elastic) {
                    member.ring_flag = None;
                    Self::ring_remove(&mut self.ring, key);
                }
            }
            MembershipFlag::Managed => {
                member.managed_timeout = None;
                if member.ring_flag == Some(TimeoutFlag::Managed) {
                    member.ring_flag = None;
                    Self::ring_remove(&mut self.ring, key);
                }
            }
        }

        if member.ring_flag.is_none()
            && let Some((tick, surviving)) = member.pending_reactivation()
        {
            member.ring_flag = Some(surviving);
            Self::ring_insert(&mut self.ring, tick, key.clone());
        }

        if member.flags.is_empty() {
            self.members.remove(key);
            debug!("membership removed, no flags remain");
            true
        } else {
            false
        }
    }

    /// Earliest pending timeout — the ring leader
    pub fn next_timeout(&self) -> Option<Tick> {
        self.ring.first().map(|(tick, _)| *tick)
    }

    /// Interval until the ring leader fires, for timer scheduling
    ///
    /// `None` when the ring is empty (deactivate the timer); zero when
    /// the leader has already elapsed.
    pub fn timer_interval(&self, now: Tick) -> Option<Duration> {
        let leader = self.next_timeout()?;
        let remaining = tick_delta(leader, now).max(0) as u64;
        Some(Duration::from_micros(remaining))
    }

    /// Drain every ring entry whose timeout has elapsed
    ///
    /// Each expired membership loses the expiring flag; with other flags
    /// left it survives (and re-arms under a surviving pending timeout),
    /// otherwise it is removed.
    pub fn on_timeout(&mut self, now: Tick) -> TimeoutSweep {
        let mut sweep = TimeoutSweep::default();
        while let Some((tick, _)) = self.ring.first() {
            if tick_delta(now, *tick) < 0 {
                break;
            }
            let (_, key) = self.ring.remove(0);
            let Some(member) = self.members.get_mut(&key) else {
                continue;
            };
            let expired = member.ring_flag.take().expect("ring entry without flag");
            member.flags.clear(MembershipFlag::from(expired).bit());
            match expired {
                TimeoutFlag::Elastic => member.elastic_timeout = None,
                TimeoutFlag::Managed => member.managed_timeout = None,
            }

            if let Some((tick, surviving)) = member.pending_reactivation() {
                member.ring_flag = Some(surviving);
                Self::ring_insert(&mut self.ring, tick, key.clone());
            }

            if member.flags.is_empty() {
                self.members.remove(&key);
                debug!(group = %key.group, "membership timed out and removed");
                sweep.events.push(MembershipEvent::Removed { key });
            } else {
                debug!(group = %key.group, ?expired, "membership flag timed out");
                sweep.events.push(MembershipEvent::Demoted { key, expired });
            }
        }
        sweep.next_timeout = self.next_timeout();
        sweep
    }

    fn ring_insert(ring: &mut Vec<(Tick, MembershipKey)>, tick: Tick, key: MembershipKey) {
        let position = ring.partition_point(|(other, _)| tick_delta(*other, tick) <= 0);
        ring.insert(position, (tick, key));
    }

    fn ring_remove(ring: &mut Vec<(Tick, MembershipKey)>, key: &MembershipKey) {
        if let Some(position) = ring.iter().position(|(_, other)| other == key) {
            ring.remove(position);
        }
    }

    #[cfg(test)]
    fn ring_len(&self) -> usize {
        self.ring.len()
    }
}
