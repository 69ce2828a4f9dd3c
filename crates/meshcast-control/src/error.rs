//! Controller error types

use thiserror::Error;

pub use meshcast_core::CoreError;
pub use meshcast_fib::FibError;
pub use meshcast_srr::SrrError;

/// Top-level error type for the relay controller
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("fib error: {0}")]
    Fib(#[from] FibError),

    #[error("srr error: {0}")]
    Srr(#[from] SrrError),

    /// An event arrived that the configured relay mode cannot use
    #[error("event not applicable in {mode} mode")]
    WrongMode { mode: &'static str },
}

/// Result type for controller operations
pub type ControlResult<T> = Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let err: ControlError = FibError::FlowNotFound.into();
        assert!(matches!(err, ControlError::Fib(_)));

        let err: ControlError = SrrError::UnknownFlow.into();
        assert!(matches!(err, ControlError::Srr(_)));

        let err: ControlError = CoreError::PathFull { max: 15 }.into();
        assert!(matches!(err, ControlError::Core(_)));
    }
}
