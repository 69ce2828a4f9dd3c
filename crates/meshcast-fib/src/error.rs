//! FIB error types

use thiserror::Error;

pub use meshcast_core::CoreError;

/// Errors raised by the forwarding information base
///
/// Resource exhaustion is reported to the caller, which decides whether
/// to drop the triggering packet or event; nothing here is fatal to the
/// process.
#[derive(Debug, Error)]
pub enum FibError {
    /// Core type error
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Flow table is at capacity
    #[error("flow table full: at most {max} flows")]
    TableFull { max: usize },

    /// An entry id referred to a slot that has been reused or freed
    #[error("stale flow entry id")]
    StaleEntryId,

    /// No entry for the requested flow
    #[error("flow not found")]
    FlowNotFound,

    /// No membership for the requested (interface, group, source)
    #[error("membership not found")]
    MembershipNotFound,
}

/// Result type for FIB operations
pub type FibResult<T> = Result<T, FibError>;
