//! Length-prefixed frame codec for the stream control surface.
//!
//! The wire layout is a strict subset of RFC 6455: single-frame messages
//! only, an optional 4-byte XOR mask, and 16- or 64-bit extended lengths.
//! Oversized and fragmented frames are rejected before any payload is
//! allocated; a partial frame stays in the buffer for the next read.

use thiserror::Error;

use crate::constants::MAX_FRAME_PAYLOAD;

/// Frame opcodes accepted by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// UTF-8 text payload.
    Text = 0x1,
    /// Binary payload.
    Binary = 0x2,
    /// Connection close.
    Close = 0x8,
    /// Keepalive probe.
    Ping = 0x9,
    /// Keepalive reply.
    Pong = 0xA,
}

impl Opcode {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }
}

/// A parsed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The frame's opcode.
    pub opcode: Opcode,
    /// The unmasked payload.
    pub payload: Vec<u8>,
}

/// Fatal framing errors. Any of these closes the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// `fin` was clear; fragmented messages are not supported.
    #[error("fragmented frames are not supported")]
    Fragmented,

    /// The opcode is not one of the accepted values.
    #[error("unsupported opcode {0:#x}")]
    UnknownOpcode(u8),

    /// The declared payload exceeds the configured maximum or 4 GiB.
    #[error("frame payload of {0} bytes exceeds the allowed maximum")]
    PayloadTooLarge(u64),
}

/// Codec over a growable input buffer.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec with the default 10 MiB payload cap.
    pub fn new() -> Self {
        Self {
            max_payload: MAX_FRAME_PAYLOAD,
        }
    }

    /// Codec with an explicit payload cap.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }

    /// Consumes every complete frame at the front of `buf`.
    ///
    /// A trailing partial frame is left in place for the next read. On a
    /// framing error the buffer contents are undefined and the caller must
    /// drop the connection.
    pub fn decode(&self, buf: &mut Vec<u8>) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();
        loop {
            match self.decode_one(buf)? {
                Some(frame) => frames.push(frame),
                None => return Ok(frames),
            }
        }
    }

    fn decode_one(&self, buf: &mut Vec<u8>) -> Result<Option<Frame>, FrameError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let b0 = buf[0];
        let b1 = buf[1];
        let fin = b0 & 0x80 != 0;
        let opcode_bits = b0 & 0x0F;
        let masked = b1 & 0x80 != 0;
        let len7 = (b1 & 0x7F) as u64;

        // Reject before waiting for more bytes; a fragment header alone is
        // already fatal.
        if !fin {
            return Err(FrameError::Fragmented);
        }
        let opcode =
            Opcode::from_bits(opcode_bits).ok_or(FrameError::UnknownOpcode(opcode_bits))?;

        let (payload_len, mut offset) = match len7 {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4usize)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let high = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
                let low = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
                if high != 0 {
                    // Payloads of 4 GiB and beyond are disallowed outright.
                    return Err(FrameError::PayloadTooLarge(
                        ((high as u64) << 32) | low as u64,
                    ));
                }
                (low as u64, 10usize)
            }
            n => (n, 2usize),
        };

        if payload_len > self.max_payload as u64 {
            return Err(FrameError::PayloadTooLarge(payload_len));
        }
        let payload_len = payload_len as usize;

        let mask = if masked {
            if buf.len() < offset + 4 {
                return Ok(None);
            }
            let key = [
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ];
            offset += 4;
            Some(key)
        } else {
            None
        };

        if buf.len() < offset + payload_len {
            return Ok(None);
        }

        let mut payload = buf[offset..offset + payload_len].to_vec();
        if let Some(key) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }
        buf.drain(..offset + payload_len);

        Ok(Some(Frame { opcode, payload }))
    }

    /// Encodes an outgoing frame: always final, unmasked, minimal header.
    pub fn encode(&self, opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 10);
        out.push(0x80 | opcode as u8);
        match payload.len() {
            len if len < 126 => out.push(len as u8),
            len if len <= u16::MAX as usize => {
                out.push(126);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                out.push(127);
                out.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }
        out.extend_from_slice(payload);
        out
    }
}
