//! Length-prefixed framing for stream transports.
//!
//! A stream socket has no message boundaries, so every body is wrapped in
//! a fixed header and a checksum trailer:
//!
//! ```text
//! +------+------+---------+-------+-----------------+--------------+----------+
//! | 0xF3 | 0x5B | version | flags | body_len u32 BE | body         | crc32 BE |
//! +------+------+---------+-------+-----------------+--------------+----------+
//! |<----------------- header: 8 bytes ------------->|              |<- 4 B -->|
//! ```
//!
//! The smallest possible frame (empty name and payload) is
//! [`MIN_FRAME_SIZE`] = 44 bytes.
//!
//! [`Deframer`] rebuilds messages from arbitrarily chunked reads. It
//! distinguishes "need more bytes" (`Ok(None)`) from a corrupt frame
//! (`Err`). After a corrupt header it discards bytes up to the next magic
//! so the stream can recover; after a corrupt body the whole frame, whose
//! length is known, is dropped.

use bytes::{Buf, BufMut, BytesMut};

use crate::codec::{MIN_BODY_SIZE, decode_body, encode_body};
use crate::{ActionMessage, ProtocolError};

/// Magic bytes at the start of every frame.
pub const FRAME_MAGIC: [u8; 2] = [0xF3, 0x5B];

/// The only frame version this implementation reads and writes.
pub const FRAME_VERSION: u8 = 1;

/// Header size: magic, version, flags, body length.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Trailer size: CRC-32 of the body.
pub const FRAME_TRAILER_SIZE: usize = 4;

/// Smallest valid packetized message.
pub const MIN_FRAME_SIZE: usize = FRAME_HEADER_SIZE + MIN_BODY_SIZE + FRAME_TRAILER_SIZE;

/// Default limit on the body length a reader accepts (16 KiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024;

// ---------------------------------------------------------------------------
// FrameHeader
// ---------------------------------------------------------------------------

/// The fixed 8-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    /// Reserved, always written as 0.
    pub flags: u8,
    pub body_len: u32,
}

impl FrameHeader {
    /// Creates a current-version header for a body of the given length.
    pub fn new(body_len: u32) -> Self {
        Self {
            version: FRAME_VERSION,
            flags: 0,
            body_len,
        }
    }

    /// Total frame size implied by this header.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.body_len as usize + FRAME_TRAILER_SIZE
    }

    /// Parses a header from the start of `buf`.
    ///
    /// Returns `Ok(None)` if fewer than [`FRAME_HEADER_SIZE`] bytes are
    /// available.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let mut buf = &buf[..FRAME_HEADER_SIZE];
        let magic = [buf.get_u8(), buf.get_u8()];
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::BadMagic { found: magic });
        }
        let version = buf.get_u8();
        if version != FRAME_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let flags = buf.get_u8();
        let body_len = buf.get_u32();
        Ok(Some(Self {
            version,
            flags,
            body_len,
        }))
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_slice(&FRAME_MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.flags);
        buf.put_u32(self.body_len);
    }
}

// ---------------------------------------------------------------------------
// Packetize / depacketize
// ---------------------------------------------------------------------------

impl ActionMessage {
    /// Serializes and frames the message for a stream transport.
    pub fn packetize(&self) -> Result<Vec<u8>, ProtocolError> {
        let body_len = self.encoded_len();
        let mut buf =
            BytesMut::with_capacity(FRAME_HEADER_SIZE + body_len + FRAME_TRAILER_SIZE);

        let header_len = u32::try_from(body_len).map_err(|_| ProtocolError::FieldTooLarge {
            field: "body",
            len: body_len,
            max: u32::MAX as usize,
        })?;
        FrameHeader::new(header_len).write(&mut buf);
        encode_body(self, &mut buf)?;
        let crc = crc32fast::hash(&buf[FRAME_HEADER_SIZE..]);
        buf.put_u32(crc);
        Ok(buf.to_vec())
    }

    /// Decodes exactly one complete frame.
    ///
    /// Unlike [`Deframer`], a short input is an error here, as are bytes
    /// left after the frame.
    pub fn depacketize(frame: &[u8]) -> Result<Self, ProtocolError> {
        let header = FrameHeader::parse(frame)?.ok_or(ProtocolError::Truncated {
            needed: FRAME_HEADER_SIZE,
            available: frame.len(),
        })?;
        let frame_len = header.frame_len();
        if frame.len() < frame_len {
            return Err(ProtocolError::Truncated {
                needed: frame_len,
                available: frame.len(),
            });
        }
        if frame.len() > frame_len {
            return Err(ProtocolError::TrailingBytes(frame.len() - frame_len));
        }
        decode_frame(frame)
    }
}

/// Verifies the trailer and decodes the body of a frame of exactly the
/// length its header declares.
fn decode_frame(frame: &[u8]) -> Result<ActionMessage, ProtocolError> {
    let body_end = frame.len() - FRAME_TRAILER_SIZE;
    let body = &frame[FRAME_HEADER_SIZE..body_end];
    let expected = (&frame[body_end..]).get_u32();
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(ProtocolError::ChecksumMismatch { expected, actual });
    }
    decode_body(body)
}

// ---------------------------------------------------------------------------
// Deframer
// ---------------------------------------------------------------------------

/// Incremental frame reader for one byte stream.
///
/// Feed it bytes as they arrive with [`extend`](Self::extend) (or read
/// straight into [`buffer_mut`](Self::buffer_mut)), then call
/// [`next_message`](Self::next_message) until it returns `Ok(None)`.
#[derive(Debug)]
pub struct Deframer {
    buf: BytesMut,
    max_body: usize,
    frames_decoded: u64,
    frames_rejected: u64,
    bytes_discarded: u64,
}

impl Deframer {
    /// Creates a deframer that rejects bodies longer than `max_body`.
    pub fn new(max_body: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max_body.min(64 * 1024) + FRAME_HEADER_SIZE),
            max_body,
            frames_decoded: 0,
            frames_rejected: 0,
            bytes_discarded: 0,
        }
    }

    /// Appends received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The receive buffer, for reading directly from a socket.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn max_body(&self) -> usize {
        self.max_body
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    /// Bytes skipped while searching for the next frame boundary.
    pub fn bytes_discarded(&self) -> u64 {
        self.bytes_discarded
    }

    /// Extracts the next complete message.
    ///
    /// - `Ok(Some(msg))`: one frame was consumed.
    /// - `Ok(None)`: more bytes are needed.
    /// - `Err(e)`: a corrupt frame was consumed or skipped; calling again
    ///   continues with whatever follows it.
    pub fn next_message(&mut self) -> Result<Option<ActionMessage>, ProtocolError> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            // A partial header that already cannot be a frame start is
            // dropped now rather than after more bytes arrive.
            if !self.buf.is_empty() && !magic_prefix_matches(&self.buf) {
                let found = [self.buf[0], self.buf.get(1).copied().unwrap_or(0)];
                self.resync();
                return Err(ProtocolError::BadMagic { found });
            }
            return Ok(None);
        }

        let header = match FrameHeader::parse(&self.buf) {
            Ok(Some(header)) => header,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.resync();
                return Err(e);
            }
        };

        let len = header.body_len as usize;
        if len > self.max_body || len < MIN_BODY_SIZE {
            self.resync();
            if len < MIN_BODY_SIZE {
                return Err(ProtocolError::Truncated {
                    needed: MIN_BODY_SIZE,
                    available: len,
                });
            }
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_body,
            });
        }

        let frame_len = header.frame_len();
        if self.buf.len() < frame_len {
            return Ok(None);
        }

        let frame = self.buf.split_to(frame_len);
        match decode_frame(&frame) {
            Ok(msg) => {
                self.frames_decoded += 1;
                Ok(Some(msg))
            }
            Err(e) => {
                self.frames_rejected += 1;
                self.bytes_discarded += frame_len as u64;
                Err(e)
            }
        }
    }

    /// Drops at least one byte, then everything up to the next position
    /// that could start a frame.
    fn resync(&mut self) {
        self.frames_rejected += 1;
        let len = self.buf.len();
        let start = len.min(1);
        let skip = self.buf[start..]
            .windows(2)
            .position(|w| w == FRAME_MAGIC)
            .map(|pos| pos + start)
            .unwrap_or_else(|| {
                // Keep a trailing first magic byte; its partner may be in
                // the next read.
                if len > start && self.buf[len - 1] == FRAME_MAGIC[0] {
                    len - 1
                } else {
                    len
                }
            });
        self.buf.advance(skip);
        self.bytes_discarded += skip as u64;
    }
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY_SIZE)
    }
}

fn magic_prefix_matches(buf: &[u8]) -> bool {
    buf.iter().zip(FRAME_MAGIC.iter()).all(|(a, b)| a == b)
}

// =========================================================================
// Tests
// =========================================================================
