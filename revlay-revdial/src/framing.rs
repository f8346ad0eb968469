//! Wire framing for reverse-dial control and attach messages.
//!
//! Every frame is a fixed binary preamble followed by a JSON payload:
//!
//! ```text
//! +-------+-------+-------------------+-----------------------------+
//! | magic | ver   | payload_len (u32) | payload (payload_len bytes) |
//! | 0x52  | 0x01  | big-endian        | UTF-8 JSON                  |
//! +-------+-------+-------------------+-----------------------------+
//!   1 byte  1 byte      4 bytes          variable
//!                  ← fixed 6 bytes →
//! ```
//!
//! Control connections carry frames for their whole lifetime. A data
//! connection carries exactly one [`Frame::Attach`] and then raw bytes with
//! no further framing.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

// ---

use super::error::{Result, RevDialError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic byte, 'R' for revlay.  Lets the receiver detect misaligned reads.
pub const MAGIC: u8 = 0x52;

/// Wire format version.  Bump when the fixed header layout changes.
pub const VERSION: u8 = 0x01;

/// Fixed header size in bytes: magic(1) + ver(1) + payload_len(4).
pub const FIXED_HEADER_LEN: usize = 6;

/// Upper bound on a single frame payload.  Control messages are tiny;
/// anything near this is a corrupted or hostile stream.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// Every message exchanged by the reverse-dial handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    // ---
    /// Peer → server.  First frame on a control connection.
    Hello { peer_id: String },

    /// Server → peer.  Names the Dialer built on this control connection.
    Welcome { dialer_id: Uuid },

    /// Server → peer.  Open a data connection for `request_id` now.
    ConnReady { request_id: Uuid },

    /// Peer → server.  First and only frame on a data connection.
    Attach { dialer_id: Uuid, request_id: Uuid },

    /// Keepalive probe.
    Ping,

    /// Keepalive answer.
    Pong,
}

// ---

impl Frame {
    // ---
    pub(crate) fn kind(&self) -> &'static str {
        // ---
        match self {
            Frame::Hello { .. } => "Hello",
            Frame::Welcome { .. } => "Welcome",
            Frame::ConnReady { .. } => "ConnReady",
            Frame::Attach { .. } => "Attach",
            Frame::Ping => "Ping",
            Frame::Pong => "Pong",
        }
    }
}

// ---------------------------------------------------------------------------
// write_frame
// ---------------------------------------------------------------------------

/// Serialize `frame` and write the fixed preamble + JSON payload to `stream`.
pub async fn write_frame<W>(stream: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(frame)?;

    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(RevDialError::FrameTooLarge(payload.len()));
    }

    // Fixed header: magic + version + payload_len (big-endian u32).
    // MAX_PAYLOAD_LEN keeps the cast lossless.
    let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + payload.len());
    buf.push(MAGIC);
    buf.push(VERSION);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);

    stream.write_all(&buf).await?;
    stream.flush().await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// read_frame
// ---------------------------------------------------------------------------

/// Read one [`Frame`] from `stream`.
///
/// Returns `None` on clean EOF before the first header byte, which is how a
/// closed control connection looks between frames.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut fixed = [0u8; FIXED_HEADER_LEN];

    // Peek at the first byte to distinguish clean EOF from a real header.
    if stream.read(&mut fixed[..1]).await? == 0 {
        return Ok(None);
    }
    stream.read_exact(&mut fixed[1..]).await?;

    if fixed[0] != MAGIC {
        return Err(RevDialError::BadMagic {
            expected: MAGIC,
            got: fixed[0],
        });
    }

    if fixed[1] != VERSION {
        return Err(RevDialError::UnsupportedVersion {
            expected: VERSION,
            got: fixed[1],
        });
    }

    let payload_len = u32::from_be_bytes([fixed[2], fixed[3], fixed[4], fixed[5]]) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(RevDialError::FrameTooLarge(payload_len));
    }

    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).await?;

    Ok(Some(serde_json::from_slice(&payload)?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    // ---

    /// An attach frame is followed by raw stream bytes; reading the frame
    /// must leave those bytes untouched.
    #[tokio::test]
    async fn attach_frame_leaves_payload_bytes() {
        // ---
        let attach = Frame::Attach {
            dialer_id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
        };

        let mut buf: Vec<u8> = Vec::new();
        write_frame(&mut buf, &attach).await.unwrap();
        buf.extend_from_slice(b"GET / HTTP/1.1\r\n");

        let mut reader = Cursor::new(buf);
        let got = read_frame(&mut reader).await.unwrap();
        assert_eq!(got, Some(attach));

        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).await.unwrap();
        assert_eq!(tail, b"GET / HTTP/1.1\r\n");
    }

    // ---

    #[tokio::test]
    async fn clean_eof_is_none() {
        // ---
        let mut reader = Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    // ---

    #[tokio::test]
    async fn truncated_header_is_error() {
        // ---
        let mut reader = Cursor::new(vec![MAGIC, VERSION, 0]);
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(RevDialError::Io(_))
        ));
    }

    // ---

    #[tokio::test]
    async fn bad_magic_rejected() {
        // ---
        let mut reader = Cursor::new(vec![0xFFu8, VERSION, 0, 0, 0, 2, b'{', b'}']);
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    // ---

    #[tokio::test]
    async fn bad_version_rejected() {
        // ---
        let mut reader = Cursor::new(vec![MAGIC, 0xFFu8, 0, 0, 0, 2, b'{', b'}']);
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("unsupported version"));
    }

    // ---

    #[tokio::test]
    async fn oversized_payload_rejected_before_allocation() {
        // ---
        let mut reader = Cursor::new(vec![MAGIC, VERSION, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(RevDialError::FrameTooLarge(_))
        ));
    }

    // ---

    #[test]
    fn frames_are_tagged_json() {
        // ---
        let json = serde_json::to_string(&Frame::Hello {
            peer_id: "desktop-42".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"Hello","peer_id":"desktop-42"}"#);
        assert_eq!(serde_json::to_string(&Frame::Ping).unwrap(), r#"{"type":"Ping"}"#);
    }
}
