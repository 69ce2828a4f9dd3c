//! Per-interface token buckets
//!
//! Each FIB entry meters traffic per outbound interface through a
//! [`TokenBucket`]. Tokens are credited proportionally to elapsed ticks
//! and clamped at the bucket depth; when a refresh does not saturate the
//! bucket, the crediting tick is rolled back by the division remainder so
//! that refreshing more often than the token interval never loses tokens
//! to rounding.
//!
//! Beyond classic rate limiting the bucket carries the per-interface
//! forwarding mode: `Block` and `Deny` reject outright, `Forward` accepts
//! unconditionally, `Limit` meters, and `Hybrid` meters but latches to
//! `Block` at its first rejection until explicitly re-armed.

use serde::{Deserialize, Serialize};

use meshcast_core::{TICK_AGE_MAX, TICK_RATE, Tick, tick_delta};

/// Default bucket depth in tokens
pub const DEFAULT_BUCKET_DEPTH: u32 = 10;

/// Per-interface forwarding mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardingStatus {
    /// Reject; may be promoted later
    #[default]
    Block,
    /// Forward one metered burst, then latch to `Block`
    Hybrid,
    /// Forward subject to the token bucket
    Limit,
    /// Forward unconditionally
    Forward,
    /// Administratively reject
    Deny,
}

impl ForwardingStatus {
    /// Whether packets can currently leave through this status at all
    pub fn permits_forwarding(&self) -> bool {
        matches!(self, Self::Hybrid | Self::Limit | Self::Forward)
    }
}

/// Token bucket with a forwarding mode, keyed by interface index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucket {
    iface_index: u32,
    status: ForwardingStatus,
    depth: u32,
    /// Ticks per token; zero disables metering entirely
    token_interval: u32,
    count: u32,
    last_tick: Tick,
}

impl TokenBucket {
    /// A full bucket for `iface_index` with the given mode and depth
    pub fn new(iface_index: u32, status: ForwardingStatus, depth: u32, now: Tick) -> Self {
        Self {
            iface_index,
            status,
            depth,
            token_interval: 0,
            count: depth,
            last_tick: now,
        }
    }

    pub fn iface_index(&self) -> u32 {
        self.iface_index
    }

    pub fn status(&self) -> ForwardingStatus {
        self.status
    }

    pub fn token_count(&self) -> u32 {
        self.count
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Set the forwarding mode
    ///
    /// Arming `Hybrid` (or re-arming after its latch demoted the bucket
    /// to `Block`) refills the bucket so the permitted burst is whole.
    pub fn set_status(&mut self, status: ForwardingStatus, now: Tick) {
        if status == ForwardingStatus::Hybrid {
            self.reset(now);
        }
        self.status = status;
    }

    /// Configure the metering rate in packets per second
    ///
    /// Non-positive rates disable metering (the bucket always accepts for
    /// metered modes).
    pub fn set_rate(&mut self, pps: f64) {
        if pps > 0.0 {
            self.token_interval = ((TICK_RATE as f64 / pps).round() as u32).max(1);
        } else {
            self.token_interval = 0;
        }
    }

    /// Ticks per token (zero when metering is disabled)
    pub fn token_interval(&self) -> u32 {
        self.token_interval
    }

    /// Refill to depth and re-anchor the crediting tick
    pub fn reset(&mut self, now: Tick) {
        self.count = self.depth;
        self.last_tick = now;
    }

    /// Credit tokens for the ticks elapsed since the last refresh
    ///
    /// Negative deltas (clock wrap or stall) credit nothing and re-anchor
    /// at `now`; deltas beyond [`TICK_AGE_MAX`] are clamped, which simply
    /// saturates the bucket.
    pub fn refresh(&mut self, now: Tick) {
        if self.count >= self.depth {
            self.last_tick = now;
            return;
        }
        if self.token_interval == 0 {
            self.count = self.depth;
            self.last_tick = now;
            return;
        }
        let elapsed = tick_delta(now, self.last_tick).clamp(0, TICK_AGE_MAX as i32) as u32;
        let credited = elapsed / self.token_interval;
        let total = self.count.saturating_add(credited);
        if total >= self.depth {
            self.count = self.depth;
            self.last_tick = now;
        } else {
            self.count = total;
            // Roll the crediting tick back by the remainder so the next
            // refresh continues from the same phase.
            self.last_tick = now.wrapping_sub(elapsed % self.token_interval);
        }
    }

    /// Account one packet against the bucket
    ///
    /// Returns whether the packet may be forwarded. A `Hybrid` bucket
    /// demotes itself to `Block` on its first rejection and stays there
    /// until [`set_status`](Self::set_status) re-arms it.
    pub fn process_packet(&mut self, now: Tick) -> bool {
        self.refresh(now);
        match self.status {
            ForwardingStatus::Block | ForwardingStatus::Deny => false,
            ForwardingStatus::Forward => true,
            ForwardingStatus::Limit | ForwardingStatus::Hybrid => {
                if self.token_interval == 0 && self.status == ForwardingStatus::Limit {
                    return true;
                }
                if self.count > 0 {
                    self.count -= 1;
                    true
                } else {
                    if self.status == ForwardingStatus::Hybrid {
                        self.status = ForwardingStatus::Block;
                    }
                    false
                }
            }
        }
    }
}
