use std::time::Duration;

// ---------------------------------------------------------------------------
// LinkSimConfig
// ---------------------------------------------------------------------------

/// Configuration for the in-process reverse-dial simulator.
///
/// All fields default to a perfect link: instant dials, nothing refused.
#[derive(Debug, Clone)]
pub struct LinkSimConfig {
    // ---
    /// Delay between `dial()` being called and the data connection existing.
    /// Stands in for the ConnReady → Attach round trip.
    pub dial_latency: Duration,

    /// In-memory buffer of each simulated data connection, per direction.
    pub pipe_capacity: usize,

    /// Start with every dial refused (toggle later via `SimLink`).
    pub refuse_dials: bool,
}

// ---

impl Default for LinkSimConfig {
    fn default() -> Self {
        // ---
        Self {
            dial_latency: Duration::ZERO,
            pipe_capacity: 64 * 1024,
            refuse_dials: false,
        }
    }
}

// ---

impl LinkSimConfig {
    // ---
    /// Perfect link, no impairments. Useful as a baseline.
    pub fn perfect() -> Self {
        Self::default()
    }

    // ---

    /// Every dial takes `latency` before the connection exists.
    pub fn slow_dials(latency: Duration) -> Self {
        // ---
        Self {
            dial_latency: latency,
            ..Default::default()
        }
    }
}
