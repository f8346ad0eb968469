//! [`HttpUpgrade`]: re-run an HTTP/1.1 protocol upgrade on a freshly
//! dialed connection so a resumed proxy session lands back on the same
//! logical endpoint.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

// ---

use revlay_domain::{DataConnPtr, Result, RevlayError, Upgrade};

// ---

/// Response heads larger than this are rejected.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

const MAX_HEADERS: usize = 64;

// ---------------------------------------------------------------------------
// HttpUpgrade
// ---------------------------------------------------------------------------

/// Sends `GET {path}` with WebSocket upgrade headers and requires
/// `101 Switching Protocols`.
///
/// The response head is consumed byte by byte so nothing the server sends
/// after it is swallowed.
#[derive(Debug, Clone)]
pub struct HttpUpgrade {
    // ---
    path: String,
    host: String,
    key: String,
}

// ---

impl HttpUpgrade {
    // ---
    pub fn new(path: impl Into<String>) -> Self {
        // ---
        Self {
            path: path.into(),
            host: "localhost".to_string(),
            key: random_key(),
        }
    }

    // ---

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    // ---

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    // ---

    pub fn path(&self) -> &str {
        &self.path
    }

    // ---

    fn request(&self) -> String {
        // ---
        format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             \r\n",
            self.path, self.host, self.key,
        )
    }
}

// ---

#[async_trait]
impl Upgrade for HttpUpgrade {
    // ---
    async fn upgrade(&self, conn: &mut DataConnPtr) -> Result<()> {
        // ---
        conn.write_all(self.request().as_bytes()).await?;
        conn.flush().await?;

        let status = read_status(conn).await?;
        if status != 101 {
            return Err(RevlayError::Upgrade(format!(
                "{} answered {status}, expected 101",
                self.path
            )));
        }

        debug!(path = %self.path, "upgrade accepted");
        Ok(())
    }
}

// ---

/// 22 alphanumerics plus `==`: the shape of a base64-encoded 16-byte nonce.
fn random_key() -> String {
    // ---
    let mut key: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(22)
        .map(char::from)
        .collect();
    key.push_str("==");
    key
}

// ---

/// Read the response head and return its status code.
async fn read_status(conn: &mut DataConnPtr) -> Result<u16> {
    // ---
    let mut head = Vec::with_capacity(256);
    loop {
        let byte = match conn.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(RevlayError::Upgrade(
                    "connection closed during upgrade response".into(),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        head.push(byte);

        if head.ends_with(b"\r\n\r\n") {
            if let Some(status) = parse_status(&head)? {
                return Ok(status);
            }
        }
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(RevlayError::Upgrade(format!(
                "response head exceeds {MAX_RESPONSE_HEAD} bytes"
            )));
        }
    }
}

// ---

/// `Ok(None)` while `head` is still incomplete.
fn parse_status(head: &[u8]) -> Result<Option<u16>> {
    // ---
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => response
            .code
            .map(Some)
            .ok_or_else(|| RevlayError::Upgrade("response without status code".into())),
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(RevlayError::Upgrade(format!("malformed upgrade response: {e}"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
