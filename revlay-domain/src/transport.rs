use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::error::Result;

// ---------------------------------------------------------------------------
// DataStream
// ---------------------------------------------------------------------------

/// An ephemeral, bidirectional byte stream between the server and one peer.
///
/// Blanket-implemented for every `AsyncRead + AsyncWrite` type that can move
/// between tasks, so TCP sockets, in-memory duplex pipes and wrapped streams
/// all qualify without adapters.
pub trait DataStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DataStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

// ---

/// Heap-allocated [`DataStream`]. What every `dial` hands back.
pub type DataConnPtr = Box<dyn DataStream>;

// ---------------------------------------------------------------------------
// ReverseDialer
// ---------------------------------------------------------------------------

/// Server-side handle bound to exactly one control connection.
///
/// Converts "I need a stream to this peer" into a completed data connection
/// by running the reverse-dial handshake over the control channel.
/// Implementations: `revlay_revdial::RevDialer`, `revlay_link_sim::SimDialer`.
#[async_trait]
pub trait ReverseDialer: Send + Sync + 'static {
    // ---
    /// Ask the peer for one fresh data connection.
    ///
    /// Must fail fast when the control channel is already dead and must
    /// never block longer than the implementation's dial timeout. A failed
    /// call leaves no half-open connection behind.
    async fn dial(&self) -> Result<DataConnPtr>;

    /// Resolves once the control channel has closed, cleanly or not.
    async fn closed(&self);

    /// Non-blocking snapshot of [`ReverseDialer::closed`].
    fn is_closed(&self) -> bool;

    /// Tear the control channel down. Idempotent.
    fn close(&self);
}

// ---

/// Shared [`ReverseDialer`] handle as stored in the peer table.
pub type ReverseDialerPtr = Arc<dyn ReverseDialer>;

// ---------------------------------------------------------------------------
// Redial
// ---------------------------------------------------------------------------

/// Produces a new server-side connection for a resilient proxy session.
///
/// Usually wraps the connection manager's `dial` for one peer, so each
/// attempt transits the grace-period and queueing logic.
#[async_trait]
pub trait Redial: Send + Sync {
    // ---
    async fn redial(&self) -> Result<DataConnPtr>;
}

// ---

#[async_trait]
impl<F, Fut> Redial for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<DataConnPtr>> + Send + 'static,
{
    // ---
    async fn redial(&self) -> Result<DataConnPtr> {
        (self)().await
    }
}

// ---------------------------------------------------------------------------
// Upgrade
// ---------------------------------------------------------------------------

/// Handshake run on every freshly dialed server connection before the
/// proxy resumes traffic on it (e.g. an HTTP protocol upgrade).
///
/// Implementations must not consume bytes past the end of the handshake.
#[async_trait]
pub trait Upgrade: Send + Sync {
    // ---
    async fn upgrade(&self, conn: &mut DataConnPtr) -> Result<()>;
}
