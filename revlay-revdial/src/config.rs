use std::time::Duration;

// ---------------------------------------------------------------------------
// RevDialConfig
// ---------------------------------------------------------------------------

/// Timing knobs for both ends of the reverse-dial transport.
#[derive(Debug, Clone)]
pub struct RevDialConfig {
    // ---
    /// Upper bound on one `dial`: ConnReady sent → Attach received.
    pub dial_timeout: Duration,

    /// Upper bound on reading the first frame of any new connection.
    pub handshake_timeout: Duration,

    /// How often the server pings an idle control connection.
    pub keepalive_interval: Duration,

    /// Silence on a control connection longer than this kills it.
    /// Must comfortably exceed `keepalive_interval`.
    pub keepalive_timeout: Duration,
}

// ---

impl Default for RevDialConfig {
    fn default() -> Self {
        // ---
        Self {
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(15),
            keepalive_timeout: Duration::from_secs(45),
        }
    }
}

// ---

impl RevDialConfig {
    // ---
    /// Derive the keepalive timeout as three missed pings.
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        // ---
        self.keepalive_interval = interval;
        self.keepalive_timeout = interval * 3;
        self
    }
}
