//! Mock collaborators for tests and simulation
//!
//! [`RecordingSender`] captures everything the core asks to transmit,
//! and [`ManualTimer`] is a [`RelayTimer`] driven by hand. Both live in
//! the crate proper (not behind `cfg(test)`) so downstream crates can
//! test their orchestration against them.

use std::time::Duration;

use crate::flow::RelayAddr;
use crate::message::{ElasticAck, SmartAck};
use crate::traits::{FrameSender, RelayTimer};

/// A [`FrameSender`] that records every emission
#[derive(Debug, Default)]
pub struct RecordingSender {
    pub frames: Vec<(u32, Vec<u8>)>,
    pub elastic_acks: Vec<(u32, RelayAddr, ElasticAck)>,
    pub smart_acks: Vec<(u32, RelayAddr, SmartAck)>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of recorded emissions of any kind
    pub fn emission_count(&self) -> usize {
        self.frames.len() + self.elastic_acks.len() + self.smart_acks.len()
    }

    /// Drop everything recorded so far
    pub fn clear(&mut self) {
        self.frames.clear();
        self.elastic_acks.clear();
        self.smart_acks.clear();
    }
}

impl FrameSender for RecordingSender {
    fn send_frame(&mut self, iface_index: u32, frame: &[u8]) {
        self.frames.push((iface_index, frame.to_vec()));
    }

    fn send_elastic_ack(&mut self, iface_index: u32, upstream: RelayAddr, ack: &ElasticAck) {
        self.elastic_acks.push((iface_index, upstream, ack.clone()));
    }

    fn send_smart_ack(&mut self, iface_index: u32, prev_hop: RelayAddr, ack: &SmartAck) {
        self.smart_acks.push((iface_index, prev_hop, ack.clone()));
    }
}

/// A [`RelayTimer`] whose state is inspected and advanced by hand
#[derive(Debug, Default)]
pub struct ManualTimer {
    active: bool,
    interval: Duration,
    /// Number of activate/reschedule calls, for assertions
    pub arm_count: u32,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently configured interval
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl RelayTimer for ManualTimer {
    fn activate(&mut self) {
        self.active = true;
        self.arm_count += 1;
    }

    fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    fn reschedule(&mut self) {
        self.active = true;
        self.arm_count += 1;
    }

    fn deactivate(&mut self) {
        self.active = false;
    }

    fn is_active(&self) -> bool {
        self.active
    }
}
