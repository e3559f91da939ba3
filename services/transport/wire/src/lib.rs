//! RFC 6455 framing, incremental encoding/decoding, and ring buffers for the
//! replication transport.
//!
//! This crate provides the byte-level plumbing underneath the built-in
//! WebSocket: frame headers with role-aware masking, an incremental decoder
//! that tolerates arbitrary packet boundaries, and the circular buffers used
//! to stage TLS ciphertext and cleartext between a producer and a consumer
//! running at different rates.
//!
//! ## Wire Format
//!
//! ```text
//! +--------------------+-----------------------------------+
//! | FIN/RSV/opcode     | 1 byte                            |
//! +--------------------+-----------------------------------+
//! | MASK/payload len   | 1 byte (+2 or +8 extended length) |
//! +--------------------+-----------------------------------+
//! | masking key (opt)  | 4 bytes, client-to-server only    |
//! +--------------------+-----------------------------------+
//! | payload            | variable (0..N)                   |
//! +--------------------+-----------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod ring;

// Re-export main types
pub use codec::{parse_close_payload, Frame, FrameDecoder, FrameEncoder, Role};
pub use error::WireError;
pub use frame::{
    apply_mask, FrameHeader, Opcode, DEFAULT_MAX_FRAME_SIZE, HARD_MAX_FRAME_SIZE,
    MAX_CONTROL_PAYLOAD, MAX_HEADER_SIZE,
};
pub use ring::RingBuffer;
