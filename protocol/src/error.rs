//! Frame decoding errors.

use thiserror::Error;

/// A byte sequence could not be decoded into a [`Frame`][crate::Frame].
///
/// None of these are fatal: the reader drops the offending start byte and resynchronizes on the
/// next one.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame does not begin with the start byte (found {0:#04x})")]
    MissingStartByte(u8),

    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("{0} unexpected bytes after the end of the frame")]
    TrailingBytes(usize),

    #[error("declared payload length {0} exceeds the maximum")]
    PayloadTooLong(usize),

    #[error("checksum mismatch: expected {expected:#04x}, found {found:#04x}")]
    ChecksumMismatch { expected: u8, found: u8 },

    #[error("unknown command id {0:#04x}")]
    UnknownCommandId(u8),

    #[error("malformed payload for command id {0:#04x}")]
    InvalidPayload(u8),
}
