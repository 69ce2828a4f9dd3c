//! # Meshcast Core
//!
//! Core types and traits for the meshcast multicast relay stack.
//!
//! This crate provides the foundational pieces shared by the forwarding
//! information base, the stochastic relay/routing metric tables, and the
//! controller:
//!
//! ## Key Types
//!
//! - [`Tick`] / [`TickClock`]: the wrapping microsecond counter every
//!   aging decision is driven by
//! - [`ActivityStatus`]: the "last-seen tick + validity" primitive
//!   embedded by aged entities
//! - [`FlowDescription`]: flow identification with per-field wildcard
//!   semantics and best-prefix matching
//! - [`ElasticAck`] / [`ElasticNack`] / [`SmartAck`] / [`SmartPathAd`]:
//!   control messages as plain data (wire codecs are external)
//! - [`GroupRecord`]: pre-parsed IGMP membership events
//!
//! ## Key Traits
//!
//! - [`FrameSender`]: injected packet emission capability
//! - [`RelayTimer`]: injected timer-manager capability

pub mod activity;
pub mod error;
pub mod flow;
pub mod message;
pub mod mock;
pub mod tick;
pub mod traits;

// Re-export main types
pub use activity::*;
pub use error::*;
pub use flow::*;
pub use message::*;
pub use mock::*;
pub use tick::*;
pub use traits::*;
