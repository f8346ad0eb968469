use revlay_domain::{Result, RevlayError};

// ---------------------------------------------------------------------------
// InputSpool
// ---------------------------------------------------------------------------

/// Bounded FIFO for client bytes that arrive while the server side of a
/// proxy session is being re-established.
///
/// A push that would exceed capacity is rejected whole, so the spool never
/// holds a truncated chunk.
pub(crate) struct InputSpool {
    // ---
    buf: Vec<u8>,
    capacity: usize,

    /// Bytes ever accepted.
    total: u64,
}

// ---

impl InputSpool {
    // ---
    pub(crate) fn new(capacity: usize) -> Self {
        // ---
        Self {
            buf: Vec::new(),
            capacity,
            total: 0,
        }
    }

    // ---

    pub(crate) fn push(&mut self, data: &[u8]) -> Result<()> {
        // ---
        if self.buf.len() + data.len() > self.capacity {
            return Err(RevlayError::BufferOverflow {
                buffered: self.buf.len(),
                incoming: data.len(),
                capacity: self.capacity,
            });
        }
        self.buf.extend_from_slice(data);
        self.total += data.len() as u64;
        Ok(())
    }

    // ---

    /// Drain everything spooled so far, oldest first.
    pub(crate) fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    // ---

    /// Put back bytes returned by [`InputSpool::take`] that could not be
    /// flushed.  They go ahead of anything spooled since.
    pub(crate) fn restore(&mut self, mut front: Vec<u8>) {
        // ---
        front.extend_from_slice(&self.buf);
        self.buf = front;
    }

    // ---

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn total(&self) -> u64 {
        self.total
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
