//! Error types for the meshcast core

use thiserror::Error;

/// Errors raised by core types
///
/// Invalid inputs are rejected locally without mutating state; callers
/// decide whether to drop the triggering packet or event.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("path list full: at most {max} entries")]
    PathFull { max: usize },

    #[error("path index {index} out of bounds (len {len})")]
    PathIndexOutOfBounds { index: usize, len: usize },

    #[error("address family mismatch: {0}")]
    AddressFamilyMismatch(String),

    #[error("invalid prefix length {prefix} for {family} address")]
    InvalidPrefix { prefix: u8, family: &'static str },

    #[error("malformed control message: {0}")]
    MalformedMessage(String),
}

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::PathFull { max: 15 };
        assert!(format!("{}", err).contains("15"));

        let err = CoreError::PathIndexOutOfBounds { index: 7, len: 3 };
        let msg = format!("{}", err);
        assert!(msg.contains("7"));
        assert!(msg.contains("3"));

        let err = CoreError::InvalidPrefix {
            prefix: 64,
            family: "IPv4",
        };
        assert!(format!("{}", err).contains("64"));
    }
}
