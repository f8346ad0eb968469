use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// PeerId
// ---------------------------------------------------------------------------

/// Opaque identifier of one remote worker, e.g. `desktop-{session}`.
///
/// Stable for the worker's lifetime and never reused concurrently.
/// Backed by an `Arc<str>` so clones into waiters, log fields and
/// watcher tasks stay cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Arc<str>);

// ---

impl PeerId {
    // ---
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    // ---

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ---

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Monotonic registration counter.
///
/// Every `set` on the connection manager installs its Dialer under a fresh
/// generation, so a watcher or a proxy holding an older value can tell that
/// its Dialer has been superseded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub u64);

// ---

impl Generation {
    // ---
    pub const ZERO: Generation = Generation(0);

    pub fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
