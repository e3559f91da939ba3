//! Incremental frame encoding and decoding.
//!
//! The decoder consumes bytes as they arrive off the socket and yields whole
//! frames; the encoder produces wire bytes for one frame at a time, masking
//! according to the sender's role.

use crate::frame::{apply_mask, FrameHeader, Opcode, DEFAULT_MAX_FRAME_SIZE};
use crate::WireError;
use bytes::{Bytes, BytesMut};

/// Which end of the connection this codec speaks for.
///
/// Clients mask every outgoing frame and require unmasked frames from the
/// server; servers do the opposite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connection initiator
    Client,
    /// Connection acceptor
    Server,
}

/// A complete decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message
    pub fin: bool,
    /// Frame opcode
    pub opcode: Opcode,
    /// Unmasked payload
    pub payload: Bytes,
}

/// Encodes outgoing frames for one connection.
#[derive(Debug)]
pub struct FrameEncoder {
    role: Role,
}

impl FrameEncoder {
    /// Create an encoder for the given role.
    pub fn new(role: Role) -> Self {
        Self { role }
    }

    /// Encode one frame to contiguous wire bytes.
    pub fn encode(&self, opcode: Opcode, fin: bool, payload: &[u8]) -> Bytes {
        let mask = match self.role {
            Role::Client => Some(rand::random::<[u8; 4]>()),
            Role::Server => None,
        };
        let header = FrameHeader {
            fin,
            opcode,
            mask,
            payload_len: payload.len() as u64,
        };

        let mut buf = BytesMut::with_capacity(header.encoded_size() + payload.len());
        header.encode(&mut buf);
        let body_start = buf.len();
        buf.extend_from_slice(payload);
        if let Some(key) = mask {
            apply_mask(&mut buf[body_start..], key, 0);
        }
        buf.freeze()
    }

    /// Encode a Close frame with the given status code and reason.
    pub fn encode_close(&self, status: u16, reason: &str) -> Bytes {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&status.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        payload.truncate(crate::frame::MAX_CONTROL_PAYLOAD);
        self.encode(Opcode::Close, true, &payload)
    }
}

/// Frame decoder for parsing incoming frames.
#[derive(Debug)]
pub struct FrameDecoder {
    role: Role,
    max_frame_size: usize,
    pending: Option<FrameHeader>,
}

impl FrameDecoder {
    /// Create a decoder for the given role with the default size limit.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            pending: None,
        }
    }

    /// Override the maximum accepted frame size.
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Decode one frame from a buffer.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
    /// call again after more bytes arrive.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        let header = match self.pending.take() {
            Some(h) => h,
            None => match FrameHeader::decode(buf)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        if header.payload_len > self.max_frame_size as u64 {
            return Err(WireError::Size(header.payload_len as usize));
        }

        // A server must receive masked frames; a client must not.
        let want_masked = self.role == Role::Server;
        if header.mask.is_some() != want_masked {
            return Err(WireError::Masking);
        }

        let len = header.payload_len as usize;
        if buf.len() < len {
            // Remember the parsed header so the length prefix is not re-read
            self.pending = Some(header);
            return Ok(None);
        }

        let mut payload = buf.split_to(len);
        if let Some(key) = header.mask {
            apply_mask(&mut payload, key, 0);
        }

        Ok(Some(Frame {
            fin: header.fin,
            opcode: header.opcode,
            payload: payload.freeze(),
        }))
    }
}

/// Parse a Close frame payload into (status, reason).
///
/// An empty payload means "no status" (1005 equivalent); a 1-byte payload is
/// malformed per RFC 6455 §5.5.1.
pub fn parse_close_payload(payload: &[u8]) -> Result<(u16, String), WireError> {
    match payload.len() {
        0 => Ok((1005, String::new())),
        1 => Err(WireError::ClosePayload),
        _ => {
            let status = u16::from_be_bytes([payload[0], payload[1]]);
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| WireError::ClosePayload)?
                .to_string();
            Ok((status, reason))
        }
    }
}
