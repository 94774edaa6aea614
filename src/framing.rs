//! Wire framing: `[u16 LE length][payload]`.
//!
//! The length counts the whole frame, the 2 header bytes included, so an empty payload is
//! encoded as `[02 00]` and `[05 00 01 02 03]` carries the 3 byte payload `[01 02 03]`.
//! Peers that read the length as payload-only are not compatible.

use tracing::debug;

use crate::{Error, Payload, Result, constants::MAX_FRAME_LEN};

/// Size of the little endian length prefix. The prefix counts itself.
pub const FRAME_HEADER_LEN: usize = 2;

/// Prefixes `payload` with its frame length.
pub fn encode_frame(payload: &[u8]) -> Result<Payload> {
    let total = payload.len() + FRAME_HEADER_LEN;
    let len = u16::try_from(total).map_err(|_| Error::PacketTooLarge {
        len: total,
        max: u16::MAX as usize,
    })?;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Splits `buf` into chunks of at most `mtu` bytes. Every chunk is sent on its own.
pub fn fragment(buf: &[u8], mtu: usize) -> impl Iterator<Item = &[u8]> {
    buf.chunks(mtu.max(1))
}

/// Reassembles frames from a byte stream that may split or merge them arbitrarily.
#[derive(Debug)]
pub struct FrameDecoder {
    leftover: Vec<u8>,
    max_frame_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            leftover: Vec::new(),
            max_frame_len,
        }
    }

    pub fn leftover(&self) -> usize {
        self.leftover.len()
    }

    /// Forgets buffered bytes, e.g. after a frame failed to decode.
    pub fn reset(&mut self) {
        self.leftover.clear();
    }

    /// Returns all payloads completed by `bytes`. Partial frames wait for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Payload> {
        self.leftover.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut pos = 0;
        loop {
            let rest = &self.leftover[pos..];
            if rest.len() < FRAME_HEADER_LEN {
                break;
            }
            let len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
            if len < FRAME_HEADER_LEN || len > self.max_frame_len {
                debug!(len, "impossible frame length, dropping buffered bytes");
                self.leftover.clear();
                return frames;
            }
            if rest.len() < len {
                break;
            }
            frames.push(rest[FRAME_HEADER_LEN..len].to_vec());
            pos += len;
        }
        self.leftover.drain(..pos);
        frames
    }
}
