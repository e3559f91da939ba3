//! Wire framing error types.

use thiserror::Error;

/// Framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Incomplete frame (need more data)
    #[error("incomplete frame")]
    Incomplete,

    /// Frame size limit exceeded
    #[error("frame size limit exceeded: {0}")]
    Size(usize),

    /// Reserved bits nonzero
    #[error("reserved bits nonzero")]
    Reserved,

    /// Unknown opcode
    #[error("unknown opcode {0}")]
    Opcode(u8),

    /// Control frame longer than 125 bytes or fragmented
    #[error("oversized or fragmented control frame")]
    Control,

    /// Client frame arrived unmasked, or server frame arrived masked
    #[error("frame masking violates role")]
    Masking,

    /// Close frame carried a 1-byte or non-UTF-8 payload
    #[error("malformed close payload")]
    ClosePayload,

    /// Continuation frame without an open message, or data frame inside one
    #[error("unexpected continuation state")]
    Continuation,
}
