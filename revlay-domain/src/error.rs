use thiserror::Error;

// ---

use super::peer::PeerId;

// ---

#[derive(Debug, Error)]
pub enum RevlayError {
    // ---
    /// No live Dialer and no (or an expired) grace period for the peer.
    #[error("no connection to peer {0}")]
    NoConnection(PeerId),

    /// A queued dial outlived the grace period without the peer returning.
    #[error("peer {0} did not reconnect within the grace period")]
    DialTimeout(PeerId),

    /// The per-peer pending-dial queue is full.
    #[error("too many pending dials for peer {peer} (limit {limit})")]
    TooManyPendingDials { peer: PeerId, limit: usize },

    /// The reverse-dial handshake failed; the peer never produced a data connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// Client bytes arrived faster than reconnection could absorb them.
    #[error("input buffer overflow ({buffered} buffered + {incoming} incoming > {capacity})")]
    BufferOverflow {
        buffered: usize,
        incoming: usize,
        capacity: usize,
    },

    /// Dial + upgrade did not succeed within the attempt or time budget.
    #[error("reconnection exhausted after {attempts} attempt(s): {last_error}")]
    ReconnectionExhausted { attempts: u32, last_error: String },

    /// The protocol upgrade on a freshly dialed connection was refused.
    #[error("upgrade failed: {0}")]
    Upgrade(String),

    /// The connection manager has been shut down.
    #[error("connection manager shut down")]
    Shutdown,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---

impl RevlayError {
    // ---
    /// `true` for the errors a broker caller may reasonably retry later.
    pub fn is_transient(&self) -> bool {
        // ---
        matches!(
            self,
            RevlayError::NoConnection(_)
                | RevlayError::DialTimeout(_)
                | RevlayError::TooManyPendingDials { .. }
                | RevlayError::Transport(_)
        )
    }
}

// ---

pub type Result<T> = std::result::Result<T, RevlayError>;
