//! Control-message data types
//!
//! The relay core exchanges four kinds of small binary messages with its
//! neighbors: acknowledgements and negative acknowledgements from
//! downstream nodes (EM-ACK / EM-NACK), per-hop acknowledgements carrying
//! learned Q/C factors (SmartAck), and path advertisements (SmartPathAd).
//! This module defines those messages as plain data; the fixed
//! 32-bit-aligned byte layouts live in the wire codecs, which are
//! external collaborators.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::flow::{FlowDescription, RelayAddr};

/// Maximum number of entries in a relay path list
pub const MAX_PATH_ENTRIES: usize = 15;

/// Bounded list of relay addresses carried by control messages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPath {
    entries: Vec<RelayAddr>,
}

impl RelayPath {
    /// An empty path
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an address, rejecting appends past [`MAX_PATH_ENTRIES`]
    pub fn append(&mut self, addr: RelayAddr) -> CoreResult<()> {
        if self.entries.len() >= MAX_PATH_ENTRIES {
            return Err(CoreError::PathFull {
                max: MAX_PATH_ENTRIES,
            });
        }
        self.entries.push(addr);
        Ok(())
    }

    /// Address at `index`
    pub fn get(&self, index: usize) -> CoreResult<RelayAddr> {
        self.entries
            .get(index)
            .copied()
            .ok_or(CoreError::PathIndexOutOfBounds {
                index,
                len: self.entries.len(),
            })
    }

    /// Iterate the addresses in order
    pub fn iter(&self) -> impl Iterator<Item = &RelayAddr> {
        self.entries.iter()
    }

    /// First entry, if any
    pub fn first(&self) -> Option<RelayAddr> {
        self.entries.first().copied()
    }

    /// Whether `addr` appears anywhere in the path
    pub fn contains(&self, addr: &RelayAddr) -> bool {
        self.entries.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TryFrom<Vec<RelayAddr>> for RelayPath {
    type Error = CoreError;

    fn try_from(entries: Vec<RelayAddr>) -> CoreResult<Self> {
        if entries.len() > MAX_PATH_ENTRIES {
            return Err(CoreError::PathFull {
                max: MAX_PATH_ENTRIES,
            });
        }
        Ok(Self { entries })
    }
}

/// Acknowledgement from a downstream node to its upstream relays (EM-ACK)
///
/// Names the flow being acknowledged and the chain of upstream relay
/// addresses the acknowledgement should travel through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElasticAck {
    pub flow: FlowDescription,
    pub upstream: RelayPath,
}

/// Negative acknowledgement from a downstream node (EM-NACK)
///
/// Reports the sequence number at which loss was observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElasticNack {
    pub flow: FlowDescription,
    pub upstream: RelayPath,
    pub seq: u16,
}

/// Path-quality advertisement from an upstream relay (EM-ADV)
///
/// Carries the advertised path metric, remaining TTL, and hop count the
/// receiver uses when ranking upstream relays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElasticAdvertisement {
    pub flow: FlowDescription,
    pub relay: RelayAddr,
    pub metric: f64,
    pub ttl: u8,
    pub hop_count: u8,
}

/// Per-hop acknowledgement carrying learned factors (SmartAck)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartAck {
    pub flow: FlowDescription,
    /// Node the acknowledgement came from
    pub source: RelayAddr,
    /// Acknowledged expected remaining hop-cost (Q factor)
    pub q_factor: f32,
    /// Acknowledged reliability (C factor)
    pub c_factor: f32,
    pub seq: u16,
    pub frag_offset: u32,
}

/// Path advertisement with learned factors (SmartPathAd)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartPathAd {
    pub flow: FlowDescription,
    pub source: RelayAddr,
    pub path: RelayPath,
    pub q_factor: f32,
    pub c_factor: f32,
}

/// IGMP group-record filter mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterMode {
    Include,
    Exclude,
}

/// Pre-parsed IGMP group record
///
/// Produced by the external IGMP listener. EXCLUDE mode with an empty
/// source list means "join all sources"; INCLUDE mode with an empty
/// source list means "leave all sources".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub iface_index: u32,
    pub group: std::net::IpAddr,
    pub sources: Vec<std::net::IpAddr>,
    pub mode: FilterMode,
}

impl GroupRecord {
    /// Whether this record joins the group for all sources
    pub fn is_join_all(&self) -> bool {
        self.mode == FilterMode::Exclude && self.sources.is_empty()
    }

    /// Whether this record leaves the group entirely
    pub fn is_leave_all(&self) -> bool {
        self.mode == FilterMode::Include && self.sources.is_empty()
    }
}
