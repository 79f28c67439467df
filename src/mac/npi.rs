//! Co-processor UART frame codec
//!
//! Frame format: `[0xFE] [LEN u16 LE] [CMD0] [CMD1] [PAYLOAD] [FCS]`
//!
//! `CMD0` carries the frame type in bits 5..7 (async request/indication,
//! sync request, sync response) and the subsystem in bits 0..4. The FCS is
//! the XOR of every byte between the SOF and the FCS itself.
//!
//! [`FrameReader`] parses incrementally from whatever the UART yields,
//! resynchronising on the SOF byte after corruption.

use super::ring_buffer::ByteRing;
use crate::error::{Error, Result};
use std::io::Read;

/// Start-of-frame marker
pub const SOF: u8 = 0xFE;

/// Frame type: asynchronous request / indication
pub const TYPE_AREQ: u8 = 0x40;

/// MAC subsystem id on the co-processor interface
pub const SUBSYS_MAC: u8 = 0x02;

/// Largest payload the link accepts
pub const MAX_PAYLOAD: usize = 500;

/// SOF + length + cmd0/cmd1
const FRAME_OVERHEAD: usize = 5;

/// A parsed or to-be-sent co-processor frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd0: u8,
    pub cmd1: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn areq(subsystem: u8, cmd1: u8, payload: Vec<u8>) -> Self {
        Self {
            cmd0: TYPE_AREQ | (subsystem & 0x1F),
            cmd1,
            payload,
        }
    }

    pub fn subsystem(&self) -> u8 {
        self.cmd0 & 0x1F
    }

    /// Serialize with SOF, length, and trailing FCS.
    pub fn to_bytes(&self) -> Vec<u8> {
        let len = self.payload.len() as u16;
        let mut out = Vec::with_capacity(self.payload.len() + FRAME_OVERHEAD + 1);
        out.push(SOF);
        out.extend_from_slice(&len.to_le_bytes());
        out.push(self.cmd0);
        out.push(self.cmd1);
        out.extend_from_slice(&self.payload);
        out.push(fcs(&out[1..]));
        out
    }
}

/// XOR checksum over length, command and payload bytes
fn fcs(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Incremental frame parser over a byte ring
pub struct FrameReader {
    buffer: ByteRing<2048>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buffer: ByteRing::new(),
        }
    }

    /// Pull available bytes from the port and try to parse one frame.
    ///
    /// Returns `Ok(None)` when no complete frame is buffered yet; timeouts
    /// on the port are not errors.
    pub fn read_frame<R: Read>(&mut self, port: &mut R) -> Result<Option<Frame>> {
        let mut chunk = [0u8; 256];
        match port.read(&mut chunk) {
            Ok(0) => {}
            Ok(n) => self.buffer.extend(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(Error::Io(e)),
        }

        self.try_parse()
    }

    /// Feed bytes directly (tests, non-serial transports).
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend(bytes);
    }

    pub fn try_parse(&mut self) -> Result<Option<Frame>> {
        loop {
            // Resync on SOF, discarding leading garbage
            let Some(sof_idx) = self.buffer.find_byte(SOF) else {
                let len = self.buffer.len();
                self.buffer.advance(len);
                return Ok(None);
            };
            if sof_idx > 0 {
                self.buffer.advance(sof_idx);
            }

            if self.buffer.len() < FRAME_OVERHEAD {
                return Ok(None);
            }

            let len =
                u16::from_le_bytes([self.buffer.get(1).unwrap(), self.buffer.get(2).unwrap()])
                    as usize;
            if len > MAX_PAYLOAD {
                // Corrupt length; skip this SOF and resync
                self.buffer.advance(1);
                continue;
            }

            let total = FRAME_OVERHEAD + len + 1;
            if self.buffer.len() < total {
                return Ok(None);
            }

            let (frame, ok) = {
                let body = self
                    .buffer
                    .get_slice(1, total - 1)
                    .ok_or_else(|| Error::Frame("frame larger than staging area".into()))?;
                let (content, check) = body.split_at(body.len() - 1);
                let ok = fcs(content) == check[0];
                let frame = Frame {
                    cmd0: content[2],
                    cmd1: content[3],
                    payload: content[4..].to_vec(),
                };
                (frame, ok)
            };

            if !ok {
                log::warn!(
                    "FCS mismatch on frame cmd0=0x{:02X} cmd1=0x{:02X}",
                    frame.cmd0,
                    frame.cmd1
                );
                // Do not trust the length field of a corrupt frame
                self.buffer.advance(1);
                continue;
            }

            self.buffer.advance(total);
            return Ok(Some(frame));
        }
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}
