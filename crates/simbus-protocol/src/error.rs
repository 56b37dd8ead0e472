//! Error types for the protocol layer.
//!
//! Everything that can go wrong while turning an [`ActionMessage`] into
//! bytes or back. "Need more bytes" is never an error here: the deframer
//! reports it as `Ok(None)` so callers can tell it apart from a corrupt
//! frame.
//!
//! [`ActionMessage`]: crate::ActionMessage

use std::string::FromUtf8Error;

/// Errors that can occur while encoding, decoding, or deframing messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The input ended before a complete field could be read.
    #[error("truncated message: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// The action tag is not one this implementation knows about.
    #[error("unknown action code {0}")]
    UnknownAction(i32),

    /// The frame did not start with the expected magic bytes.
    #[error("bad frame magic {found:02x?}")]
    BadMagic { found: [u8; 2] },

    /// The frame header carries a version this reader does not speak.
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    /// The body checksum in the trailer does not match the body.
    #[error("checksum mismatch: frame says {expected:#010x}, body hashes to {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// The declared body length exceeds the reader's limit.
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    /// The name field is not valid UTF-8.
    #[error("invalid utf-8 in name field: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),

    /// Bytes were left over after a complete message was decoded.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// A field is too long to be represented in its length prefix.
    #[error("{field} is {len} bytes, limit is {max}")]
    FieldTooLarge {
        field: &'static str,
        len: usize,
        max: usize,
    },
}
