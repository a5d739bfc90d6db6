use thiserror::Error;

/// Failures raised while decoding a single legacy frame.
///
/// Family decoders never surface these; they fall through to the next
/// encoding attempt and yield zero readings instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid hex input {0:?}")]
    InvalidHex(String),

    #[error("frame truncated at offset {offset}: wanted {wanted} byte(s), {remaining} left")]
    Truncated {
        offset: usize,
        wanted: usize,
        remaining: usize,
    },

    #[error("{0}-byte value does not fit in 64 bits")]
    ValueTooWide(usize),

    #[error("timestamp {0} is outside the representable range")]
    TimestampOutOfRange(i64),
}
