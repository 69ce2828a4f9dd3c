//! SRR error types

use thiserror::Error;

pub use meshcast_core::CoreError;

/// Errors raised by the stochastic relay/routing layer
#[derive(Debug, Error)]
pub enum SrrError {
    /// Core type error
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// No learning state exists for the flow
    #[error("no metric state for flow")]
    UnknownFlow,

    /// A factor outside its meaningful range was supplied
    #[error("factor out of range: {name} = {value}")]
    FactorOutOfRange { name: &'static str, value: f64 },
}

/// Result type for SRR operations
pub type SrrResult<T> = Result<T, SrrError>;
