//! Codec errors

use thiserror::Error;

/// Result type alias for encode/decode operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while encoding or decoding wire data
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("buffer too short: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("payload size mismatch: expected {expected} bytes, got {actual}")]
    PayloadSizeMismatch { expected: usize, actual: usize },

    #[error("unknown {kind} value {value}")]
    UnknownValue { kind: &'static str, value: u32 },
}
