//! Flow descriptions and best-prefix matching
//!
//! A [`FlowDescription`] identifies a multicast flow by destination
//! address and, optionally, source address, traffic class, protocol, and
//! inbound interface. Every field carries wildcard semantics: addresses
//! match under a prefix length, and the scalar fields match anything when
//! unset. Tables store descriptions keyed on exact equality and resolve
//! queries by walking candidates from most-specific to wildcard, so a
//! description also reports a [`specificity`](FlowDescription::specificity)
//! used for that ordering.

use std::fmt;
use std::net::IpAddr;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Address of a neighboring relay (previous or next hop)
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RelayAddr(pub IpAddr);

impl RelayAddr {
    /// Convenience constructor for an IPv4 relay address
    pub fn v4(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self(IpAddr::from([a, b, c, d]))
    }

    /// The wrapped IP address
    pub fn ip(&self) -> IpAddr {
        self.0
    }
}

impl From<IpAddr> for RelayAddr {
    fn from(ip: IpAddr) -> Self {
        Self(ip)
    }
}

/// Number of bits in an address of the given family
fn addr_bits(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn family_name(addr: &IpAddr) -> &'static str {
    match addr {
        IpAddr::V4(_) => "IPv4",
        IpAddr::V6(_) => "IPv6",
    }
}

/// Whether `a` and `b` agree on their first `bits` bits
///
/// Mismatched address families never match. A zero-bit prefix matches
/// everything of the same family.
pub fn prefix_match(a: &IpAddr, b: &IpAddr, bits: u8) -> bool {
    let (a_octets, b_octets): (Vec<u8>, Vec<u8>) = match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => (a.octets().to_vec(), b.octets().to_vec()),
        (IpAddr::V6(a), IpAddr::V6(b)) => (a.octets().to_vec(), b.octets().to_vec()),
        _ => return false,
    };
    let bits = bits.min(addr_bits(a)) as usize;
    let full_bytes = bits / 8;
    if a_octets[..full_bytes] != b_octets[..full_bytes] {
        return false;
    }
    let rem = bits % 8;
    if rem == 0 {
        return true;
    }
    let mask = !(0xffu8 >> rem);
    (a_octets[full_bytes] & mask) == (b_octets[full_bytes] & mask)
}

/// Identifies a multicast flow, with per-field wildcard semantics
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowDescription {
    /// Destination (group) address
    pub dst: IpAddr,
    /// Significant bits of the destination address
    pub dst_prefix: u8,
    /// Source address, `None` for any-source
    pub src: Option<IpAddr>,
    /// Significant bits of the source address
    pub src_prefix: u8,
    /// Traffic class, `None` for any
    pub traffic_class: Option<u8>,
    /// IP protocol, `None` for any
    pub protocol: Option<u8>,
    /// Inbound interface index, `None` for any
    pub iface_index: Option<u32>,
}

impl FlowDescription {
    /// A destination-only description with a full-length prefix
    pub fn to_group(dst: IpAddr) -> Self {
        let dst_prefix = addr_bits(&dst);
        Self {
            dst,
            dst_prefix,
            src: None,
            src_prefix: 0,
            traffic_class: None,
            protocol: None,
            iface_index: None,
        }
    }

    /// Narrow the destination prefix
    pub fn with_dst_prefix(mut self, prefix: u8) -> CoreResult<Self> {
        if prefix > addr_bits(&self.dst) {
            return Err(CoreError::InvalidPrefix {
                prefix,
                family: family_name(&self.dst),
            });
        }
        self.dst_prefix = prefix;
        Ok(self)
    }

    /// Constrain the source address with a full-length prefix
    pub fn with_source(mut self, src: IpAddr) -> Self {
        self.src_prefix = addr_bits(&src);
        self.src = Some(src);
        self
    }

    /// Constrain the source address under a prefix
    pub fn with_source_prefix(mut self, src: IpAddr, prefix: u8) -> CoreResult<Self> {
        if prefix > addr_bits(&src) {
            return Err(CoreError::InvalidPrefix {
                prefix,
                family: family_name(&src),
            });
        }
        self.src = Some(src);
        self.src_prefix = prefix;
        Ok(self)
    }

    /// Constrain the traffic class
    pub fn with_traffic_class(mut self, tc: u8) -> Self {
        self.traffic_class = Some(tc);
        self
    }

    /// Constrain the IP protocol
    pub fn with_protocol(mut self, protocol: u8) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Constrain the inbound interface
    pub fn with_iface(mut self, iface_index: u32) -> Self {
        self.iface_index = Some(iface_index);
        self
    }

    /// Whether this description carries no wildcards at all
    pub fn is_exact(&self) -> bool {
        self.dst_prefix == addr_bits(&self.dst)
            && self
                .src
                .map(|src| self.src_prefix == addr_bits(&src))
                .unwrap_or(false)
            && self.traffic_class.is_some()
            && self.protocol.is_some()
    }

    /// Whether a fully-specified `query` falls within this description
    ///
    /// `self` is the (possibly wildcarded) table entry; `query` comes from
    /// the packet classifier. Every constrained field of the entry must be
    /// satisfied by the query.
    pub fn matches(&self, query: &FlowDescription) -> bool {
        if !prefix_match(&self.dst, &query.dst, self.dst_prefix) {
            return false;
        }
        if let Some(src) = &self.src {
            match &query.src {
                Some(query_src) => {
                    if !prefix_match(src, query_src, self.src_prefix) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if let Some(tc) = self.traffic_class
            && query.traffic_class != Some(tc)
        {
            return false;
        }
        if let Some(protocol) = self.protocol
            && query.protocol != Some(protocol)
        {
            return false;
        }
        if let Some(iface) = self.iface_index
            && query.iface_index != Some(iface)
        {
            return false;
        }
        true
    }

    /// Ordering weight for best-match searches (higher is more specific)
    pub fn specificity(&self) -> u32 {
        let mut weight = self.dst_prefix as u32 + self.src_prefix as u32;
        if self.traffic_class.is_some() {
            weight += 8;
        }
        if self.protocol.is_some() {
            weight += 8;
        }
        if self.iface_index.is_some() {
            weight += 4;
        }
        weight
    }
}

impl fmt::Display for FlowDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.src {
            Some(src) => write!(f, "{}/{} -> ", src, self.src_prefix)?,
            None => write!(f, "* -> ")?,
        }
        write!(f, "{}/{}", self.dst, self.dst_prefix)?;
        if let Some(tc) = self.traffic_class {
            write!(f, " tc={}", tc)?;
        }
        if let Some(protocol) = self.protocol {
            write!(f, " proto={}", protocol)?;
        }
        if let Some(iface) = self.iface_index {
            write!(f, " if={}", iface)?;
        }
        Ok(())
    }
}
