//! Last-seen activity tracking
//!
//! [`ActivityStatus`] is the generic "last-seen tick plus validity"
//! primitive embedded by every aged entity in the relay core: FIB
//! entries, upstream relays, relay histories, and group memberships all
//! age through it.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::tick::{TICK_AGE_MAX, Tick, tick_age};

/// Last-seen tick with validity and liveness flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityStatus {
    last_tick: Tick,
    valid: bool,
    active: bool,
}

impl ActivityStatus {
    /// A fresh, invalid status (age reads as infinite until refreshed)
    pub fn new() -> Self {
        Self::default()
    }

    /// A status refreshed at `now`
    pub fn refreshed(now: Tick) -> Self {
        let mut status = Self::new();
        status.refresh(now);
        status
    }

    /// Mark activity at `now`
    pub fn refresh(&mut self, now: Tick) {
        self.last_tick = now;
        self.valid = true;
    }

    /// Age in ticks as seen from `now`
    ///
    /// Returns [`TICK_AGE_MAX`] when the status is invalid or the
    /// computed delta is negative or excessive; an excessive delta also
    /// invalidates the status so a later wrapped reading cannot resurrect
    /// it with a misleadingly small age.
    pub fn age(&mut self, now: Tick) -> u32 {
        if !self.valid {
            return TICK_AGE_MAX;
        }
        let age = tick_age(now, self.last_tick);
        if age >= TICK_AGE_MAX {
            warn!(
                last_tick = self.last_tick,
                now, "activity age overflowed, invalidating"
            );
            self.valid = false;
            return TICK_AGE_MAX;
        }
        age
    }

    /// Age without the auto-invalidation side effect
    pub fn peek_age(&self, now: Tick) -> u32 {
        if !self.valid {
            return TICK_AGE_MAX;
        }
        tick_age(now, self.last_tick)
    }

    /// Tick of the most recent refresh
    pub fn last_tick(&self) -> Tick {
        self.last_tick
    }

    /// Whether the status has been refreshed and has not overflowed
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Drop validity; age reads as infinite until the next refresh
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Liveness flag carried alongside the age
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Set the liveness flag
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }
}
