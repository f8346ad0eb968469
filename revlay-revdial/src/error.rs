//! Error types for `revlay-revdial`.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RevDialError {
    // ---
    #[error("framing bad magic: expected 0x{expected:02X}, got 0x{got:02X}")]
    BadMagic { expected: u8, got: u8 },

    #[error("framing unsupported version: expected {expected}, got {got}")]
    UnsupportedVersion { expected: u8, got: u8 },

    #[error("frame payload of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),

    #[error("connection closed before handshake completed")]
    HandshakeEof,

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("control channel closed")]
    ControlClosed,

    #[error("peer did not attach a data connection within {0:?}")]
    AttachTimeout(Duration),

    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---

pub(crate) type Result<T> = std::result::Result<T, RevDialError>;

// ---------------------------------------------------------------------------
// Bridge to revlay_domain::RevlayError
// ---------------------------------------------------------------------------

impl From<RevDialError> for revlay_domain::RevlayError {
    // ---
    fn from(e: RevDialError) -> Self {
        revlay_domain::RevlayError::Transport(e.to_string())
    }
}
