//! Error types for ZMODEM transfers.
//!
//! `ZmodemError` is what a transfer worker returns. The lower layers have
//! their own enums so the link can tell a recoverable framing problem from a
//! fatal one.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ZmodemError>;

/// Fatal conditions of a transfer.
#[derive(Debug, Error)]
pub enum ZmodemError {
    /// Malformed header or sub-packet that the caller chose not to retry
    #[error("framing error: {0}")]
    Framing(#[from] FrameError),

    /// No valid frame arrived within the wait budget
    #[error("timed out waiting for {waiting_for}")]
    Timeout { waiting_for: String },

    /// Stream or filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer aborted the session
    #[error("transfer aborted by peer: {0}")]
    ProtocolAbort(String),

    /// Stopped locally through the cancellation token
    #[error("transfer cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

impl ZmodemError {
    pub fn timeout(waiting_for: impl Into<String>) -> Self {
        Self::Timeout {
            waiting_for: waiting_for.into(),
        }
    }

    pub fn abort(message: impl Into<String>) -> Self {
        Self::ProtocolAbort(message.into())
    }
}

/// Header and sub-packet decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unknown header format marker 0x{0:02X}")]
    UnknownFormat(u8),

    #[error("unknown frame type 0x{0:02X}")]
    UnknownFrameType(u8),

    #[error("CRC mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    BadCrc { expected: u32, actual: u32 },

    #[error("invalid hex digit in header")]
    BadHex,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("sub-packet exceeds {max} bytes")]
    SubpacketTooLong { max: usize },

    #[error("malformed file header: {0}")]
    BadFileHeader(String),

    /// Five consecutive CAN bytes: the peer's abort sequence
    #[error("cancel sequence received")]
    CancelSequence,
}

/// Byte codec errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid escape sequence ZDLE 0x{0:02X}")]
    BadEscape(u8),

    #[error("unexpected sub-packet terminator")]
    UnexpectedTerminator,
}
