//! Capability traits consumed by the relay core
//!
//! The core never touches sockets or OS timers. Packet emission and
//! timer scheduling are injected at construction as implementations of
//! these traits, so the same control logic runs against real interfaces,
//! a simulator, or the in-crate mocks (see [`crate::mock`]).

use std::time::Duration;

use crate::flow::RelayAddr;
use crate::message::{ElasticAck, SmartAck};

/// Abstract packet emission
///
/// The core decides *that* and *to whom* to send; the implementation
/// owns framing and I/O.
pub trait FrameSender {
    /// Emit a raw frame on an interface
    fn send_frame(&mut self, iface_index: u32, frame: &[u8]);

    /// Send an EM-ACK toward an upstream relay
    fn send_elastic_ack(&mut self, iface_index: u32, upstream: RelayAddr, ack: &ElasticAck);

    /// Send a SmartAck to the previous hop
    fn send_smart_ack(&mut self, iface_index: u32, prev_hop: RelayAddr, ack: &SmartAck);
}

/// Abstract single-shot-reschedulable repeating timer
///
/// Mirrors the timer-manager service the relay daemon provides: a timer
/// is activated with an interval, may be rescheduled with a new interval
/// while pending, and fires a callback the owner wires up externally.
pub trait RelayTimer {
    /// Arm the timer with its current interval
    fn activate(&mut self);

    /// Change the interval without (re)arming
    fn set_interval(&mut self, interval: Duration);

    /// Re-arm the timer with its current interval
    fn reschedule(&mut self);

    /// Cancel the pending expiry
    fn deactivate(&mut self);

    /// Whether an expiry is pending
    fn is_active(&self) -> bool;
}
