//! [`ConnectionManager`]: one slot per peer, a grace period across
//! control-channel outages, and queued dials that resolve on reconnect.
//!
//! # Slot states
//!
//! ```text
//!            set                 closed / on_disconnect
//!   Absent ───────▶ Live{gen} ───────────────────────────▶ Grace{retired gen}
//!     ▲               ▲  │ set (replace: old dialer closed)       │   │
//!     │               │  └──────────┘                             │   │
//!     │               └───────────────── set (waiters woken) ─────┘   │
//!     └──────────────────────── grace expiry (waiters: DialTimeout) ──┘
//! ```
//!
//! Absent has no map entry.  `remove` and `shutdown` evict from any state.
//!
//! # Locking
//!
//! The whole peer table sits behind one `parking_lot::Mutex`.  It is never
//! held across an `.await`: `dial` decides under the lock, drops it, and
//! only then talks to a dialer or parks on its [`PendingDial`].
//!
//! # Background tasks
//!
//! - One watcher per registered dialer.  It waits on
//!   [`ReverseDialer::closed`] and retires the slot, but only if its
//!   generation is still the live one.
//! - One expiry task per disconnection.  It evicts the slot when the grace
//!   period ends and fails every queued waiter with `DialTimeout`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

// ---

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ---

use revlay_domain::{
    //
    DataConnPtr,
    Generation,
    PeerId,
    Result,
    ReverseDialerPtr,
    RevlayError,
};

// ---

use super::metrics::{Metrics, MetricsPtr};

// ---------------------------------------------------------------------------
// ManagerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    // ---
    /// How long a disconnected peer keeps its slot and queues dials.
    pub grace_period: Duration,

    /// Upper bound on queued dials per peer.
    pub max_pending_dials: usize,
}

// ---

impl Default for ManagerConfig {
    fn default() -> Self {
        // ---
        Self {
            grace_period: Duration::from_secs(30),
            max_pending_dials: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// ManagerStats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    // ---
    pub active: usize,
    pub in_grace: usize,
    pub pending_dials: usize,
}

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

/// What a woken waiter receives: the new dialer, or why there is none.
type Wake = Result<(ReverseDialerPtr, Generation)>;

// ---

enum Slot {
    // ---
    Live {
        generation: Generation,
        dialer: ReverseDialerPtr,
    },

    Grace {
        retired: Generation,
        since: Instant,
        waiters: HashMap<u64, oneshot::Sender<Wake>>,
        expiry: AbortHandle,
    },
}

// ---

#[derive(Default)]
struct Table {
    // ---
    peers: HashMap<PeerId, Slot>,
    last_generation: Generation,
    next_waiter: u64,
}

// ---

impl Table {
    // ---
    fn stats(&self) -> ManagerStats {
        // ---
        let mut stats = ManagerStats::default();
        for slot in self.peers.values() {
            match slot {
                Slot::Live { .. } => stats.active += 1,
                Slot::Grace { waiters, .. } => {
                    stats.in_grace += 1;
                    stats.pending_dials += waiters.len();
                }
            }
        }
        stats
    }
}

// ---------------------------------------------------------------------------
// Inner
// ---------------------------------------------------------------------------

struct Inner {
    // ---
    cfg: ManagerConfig,
    table: Mutex<Table>,
    metrics: MetricsPtr,
    shutdown: CancellationToken,
}

// ---

/// Routing decision taken under the table lock.
enum Route {
    Live(ReverseDialerPtr, Generation),
    Queued(PendingDial),
}

// ---

impl Inner {
    // ---
    /// Mirror the table's gauges into the shared metrics.
    fn publish(&self, table: &Table) {
        // ---
        use std::sync::atomic::Ordering;

        let stats = table.stats();
        self.metrics
            .peers_in_grace
            .store(stats.in_grace as u64, Ordering::Relaxed);
        self.metrics
            .pending_dials
            .store(stats.pending_dials as u64, Ordering::Relaxed);
    }

    // ---

    /// Turn the live slot of `peer` into a grace slot and start its expiry
    /// timer.  Caller holds the table lock and has checked the slot is live.
    fn retire_locked(self: &Arc<Self>, table: &mut Table, peer: &PeerId, retired: Generation) {
        // ---
        let since = Instant::now();
        let deadline = since + self.cfg.grace_period;

        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let expiring = peer.clone();

        let expiry = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.expire(&expiring, retired);
                    }
                }
            }
        })
        .abort_handle();

        table.peers.insert(
            peer.clone(),
            Slot::Grace {
                retired,
                since,
                waiters: HashMap::new(),
                expiry,
            },
        );

        info!(
            %peer,
            generation = %retired,
            grace_secs = self.cfg.grace_period.as_secs_f64(),
            "peer disconnected, grace period started",
        );
    }

    // ---

    /// The dialer registered under `generation` reported its channel closed.
    fn disconnected(self: &Arc<Self>, peer: &PeerId, generation: Generation) {
        // ---
        let mut table = self.table.lock();
        let is_live = matches!(
            table.peers.get(peer),
            Some(Slot::Live { generation: live, .. }) if *live == generation
        );

        if is_live {
            self.retire_locked(&mut table, peer, generation);
            self.publish(&table);
        } else {
            debug!(%peer, %generation, "stale disconnect ignored");
        }
    }

    // ---

    /// Grace period for `retired` ran out without a new registration.
    fn expire(&self, peer: &PeerId, retired: Generation) {
        // ---
        let mut table = self.table.lock();
        let matches = matches!(
            table.peers.get(peer),
            Some(Slot::Grace { retired: r, .. }) if *r == retired
        );
        if !matches {
            return;
        }

        if let Some(Slot::Grace { waiters, .. }) = table.peers.remove(peer) {
            let failed = waiters.len();
            for (_, tx) in waiters {
                let _ = tx.send(Err(RevlayError::DialTimeout(peer.clone())));
            }
            Metrics::inc(&self.metrics.grace_expirations_total);
            warn!(%peer, failed_dials = failed, "grace period expired, peer evicted");
        }
        self.publish(&table);
    }

    // ---

    /// Decide how a dial for `peer` proceeds.
    fn route(self: &Arc<Self>, peer: &PeerId) -> Result<Route> {
        // ---
        if self.shutdown.is_cancelled() {
            return Err(RevlayError::Shutdown);
        }

        let mut table = self.table.lock();

        // A dialer whose channel just died but whose watcher has not run yet
        // is retired here so the caller queues instead of failing.
        let closed_live = match table.peers.get(peer) {
            Some(Slot::Live { generation, dialer }) if !dialer.is_closed() => {
                return Ok(Route::Live(Arc::clone(dialer), *generation));
            }
            Some(Slot::Live { generation, .. }) => Some(*generation),
            _ => None,
        };
        if let Some(retired) = closed_live {
            self.retire_locked(&mut table, peer, retired);
        }

        let waiter_id = table.next_waiter;
        let grace_period = self.cfg.grace_period;
        let limit = self.cfg.max_pending_dials;

        let pending = match table.peers.get_mut(peer) {
            None => return Err(RevlayError::NoConnection(peer.clone())),
            Some(Slot::Live { .. }) => unreachable!("live slot handled above"),
            Some(Slot::Grace { since, waiters, .. }) => {
                // ---
                let deadline = *since + grace_period;
                if Instant::now() >= deadline {
                    return Err(RevlayError::NoConnection(peer.clone()));
                }
                if waiters.len() >= limit {
                    return Err(RevlayError::TooManyPendingDials {
                        peer: peer.clone(),
                        limit,
                    });
                }

                let (tx, rx) = oneshot::channel();
                waiters.insert(waiter_id, tx);

                PendingDial {
                    inner: Arc::downgrade(self),
                    peer: peer.clone(),
                    id: waiter_id,
                    deadline,
                    rx,
                }
            }
        };

        table.next_waiter += 1;
        self.publish(&table);
        Ok(Route::Queued(pending))
    }

    // ---

    fn current_generation(&self, peer: &PeerId) -> Option<Generation> {
        // ---
        match self.table.lock().peers.get(peer) {
            Some(Slot::Live { generation, .. }) => Some(*generation),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// PendingDial
// ---------------------------------------------------------------------------

/// A dial parked while its peer is inside the grace period.
///
/// Resolves exactly once: woken by `set`, failed by expiry, `remove` or
/// `shutdown`, or timed out at its deadline.  Dropping it before then
/// unregisters the waiter.
struct PendingDial {
    // ---
    inner: Weak<Inner>,
    peer: PeerId,
    id: u64,
    deadline: Instant,
    rx: oneshot::Receiver<Wake>,
}

// ---

impl PendingDial {
    // ---
    async fn wait(&mut self) -> Wake {
        // ---
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(wake)) => wake,
            Ok(Err(_)) | Err(_) => Err(RevlayError::DialTimeout(self.peer.clone())),
        }
    }
}

// ---

impl Drop for PendingDial {
    fn drop(&mut self) {
        // ---
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        let mut table = inner.table.lock();
        if let Some(Slot::Grace { waiters, .. }) = table.peers.get_mut(&self.peer) {
            if waiters.remove(&self.id).is_some() {
                debug!(peer = %self.peer, waiter = self.id, "pending dial withdrawn");
                inner.publish(&table);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

/// Server-side registry of reverse dialers, keyed by peer.
///
/// Cheap to clone; every clone shares the same peer table.
#[derive(Clone)]
pub struct ConnectionManager {
    // ---
    inner: Arc<Inner>,
}

// ---

impl ConnectionManager {
    // ---
    pub fn new(cfg: ManagerConfig) -> Self {
        Self::with_metrics(cfg, Arc::new(Metrics::new()))
    }

    // ---

    pub fn with_metrics(cfg: ManagerConfig, metrics: MetricsPtr) -> Self {
        // ---
        Self {
            inner: Arc::new(Inner {
                cfg,
                table: Mutex::new(Table::default()),
                metrics,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    // ---

    pub fn metrics(&self) -> MetricsPtr {
        Arc::clone(&self.inner.metrics)
    }

    // ---

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.cfg
    }

    // ---

    /// Register (or replace) the dialer for `peer`.
    ///
    /// Retires any previous dialer, clears a disconnection record, wakes
    /// every queued dial against the new dialer and starts the watcher that
    /// calls back into the manager once this dialer's channel closes.
    pub fn set(&self, peer: PeerId, dialer: ReverseDialerPtr) -> Result<Generation> {
        // ---
        if self.inner.shutdown.is_cancelled() {
            dialer.close();
            return Err(RevlayError::Shutdown);
        }

        let (generation, previous) = {
            let mut table = self.inner.table.lock();
            let generation = table.last_generation.next();
            table.last_generation = generation;

            let previous = table.peers.insert(
                peer.clone(),
                Slot::Live {
                    generation,
                    dialer: Arc::clone(&dialer),
                },
            );

            if let Some(Slot::Grace { expiry, .. }) = &previous {
                expiry.abort();
            }
            self.inner.publish(&table);
            (generation, previous)
        };

        match previous {
            None => info!(%peer, %generation, "peer registered"),

            Some(Slot::Live {
                generation: old,
                dialer: old_dialer,
            }) => {
                info!(%peer, %generation, replaced = %old, "peer re-registered, previous dialer retired");
                old_dialer.close();
            }

            Some(Slot::Grace {
                retired,
                since,
                waiters,
                ..
            }) => {
                // ---
                Metrics::inc(&self.inner.metrics.peer_reconnects_total);
                info!(
                    %peer,
                    %generation,
                    %retired,
                    outage_ms = since.elapsed().as_millis() as u64,
                    woken = waiters.len(),
                    "peer reconnected within grace period",
                );
                for (_, tx) in waiters {
                    let _ = tx.send(Ok((Arc::clone(&dialer), generation)));
                }
            }
        }

        self.spawn_watcher(peer, generation, dialer);
        Ok(generation)
    }

    // ---

    fn spawn_watcher(&self, peer: PeerId, generation: Generation, dialer: ReverseDialerPtr) {
        // ---
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = dialer.closed() => {}
            }
            drop(dialer);

            if let Some(inner) = weak.upgrade() {
                inner.disconnected(&peer, generation);
            }
        });
    }

    // ---

    /// Open a data connection to `peer`.
    ///
    /// Served straight from the live dialer when there is one.  While the
    /// peer is in its grace period the call queues until the peer returns
    /// or the grace period ends.  Unknown or evicted peers fail at once.
    ///
    /// Cancel by dropping the future; the queued waiter is withdrawn.
    pub async fn dial(&self, peer: &PeerId) -> Result<DataConnPtr> {
        self.dial_tagged(peer).await.map(|(conn, _)| conn)
    }

    // ---

    /// [`ConnectionManager::dial`], also reporting the generation of the
    /// dialer that produced the connection.
    ///
    /// Fails with `Transport` if that dialer was superseded while the
    /// connection was being set up, so a stale registration never hands
    /// out a stream.
    pub async fn dial_tagged(&self, peer: &PeerId) -> Result<(DataConnPtr, Generation)> {
        // ---
        let (dialer, generation) = match self.inner.route(peer)? {
            Route::Live(dialer, generation) => {
                Metrics::inc(&self.inner.metrics.dials_instant_total);
                (dialer, generation)
            }
            Route::Queued(mut pending) => {
                Metrics::inc(&self.inner.metrics.dials_waited_total);
                debug!(%peer, "dial queued for reconnect");
                pending.wait().await?
            }
        };

        let conn = dialer.dial().await?;

        if self.inner.current_generation(peer) != Some(generation) {
            warn!(%peer, %generation, "dialer superseded during dial, dropping connection");
            return Err(RevlayError::Transport(format!(
                "dialer {generation} for peer {peer} was superseded"
            )));
        }

        debug!(%peer, %generation, "data connection ready");
        Ok((conn, generation))
    }

    // ---

    /// Retire the live dialer of `peer` and start its grace period.
    ///
    /// Normally driven by the dialer's watcher.  No-op unless the peer is live.
    pub fn on_disconnect(&self, peer: &PeerId) {
        // ---
        if let Some(generation) = self.inner.current_generation(peer) {
            self.inner.disconnected(peer, generation);
        }
    }

    // ---

    /// Evict `peer` immediately, skipping the grace period.
    ///
    /// Queued dials fail with `NoConnection`.  Returns `false` for unknown
    /// peers.
    pub fn remove(&self, peer: &PeerId) -> bool {
        // ---
        let removed = {
            let mut table = self.inner.table.lock();
            let removed = table.peers.remove(peer);
            self.inner.publish(&table);
            removed
        };

        match removed {
            None => false,
            Some(Slot::Live { dialer, generation }) => {
                info!(%peer, %generation, "peer removed");
                dialer.close();
                true
            }
            Some(Slot::Grace { waiters, expiry, .. }) => {
                info!(%peer, failed_dials = waiters.len(), "peer removed during grace period");
                expiry.abort();
                for (_, tx) in waiters {
                    let _ = tx.send(Err(RevlayError::NoConnection(peer.clone())));
                }
                true
            }
        }
    }

    // ---

    /// Peers with a live dialer, sorted.
    pub fn list(&self) -> Vec<PeerId> {
        // ---
        let table = self.inner.table.lock();
        let mut peers: Vec<PeerId> = table
            .peers
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Live { .. }))
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    // ---

    /// Peers currently inside their grace period, sorted.
    pub fn list_in_grace(&self) -> Vec<PeerId> {
        // ---
        let table = self.inner.table.lock();
        let mut peers: Vec<PeerId> = table
            .peers
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Grace { .. }))
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    // ---

    pub fn stats(&self) -> ManagerStats {
        self.inner.table.lock().stats()
    }

    // ---

    /// Live generation of `peer`, if it has a live dialer.
    pub fn generation(&self, peer: &PeerId) -> Option<Generation> {
        self.inner.current_generation(peer)
    }

    // ---

    /// Stop every background task, close every dialer and fail every
    /// queued dial with `Shutdown`.  Later calls fail with `Shutdown` too.
    pub fn shutdown(&self) {
        // ---
        self.inner.shutdown.cancel();

        let drained: Vec<(PeerId, Slot)> = {
            let mut table = self.inner.table.lock();
            let drained = table.peers.drain().collect();
            self.inner.publish(&table);
            drained
        };

        let peers = drained.len();
        for (_, slot) in drained {
            match slot {
                Slot::Live { dialer, .. } => dialer.close(),
                Slot::Grace { waiters, expiry, .. } => {
                    expiry.abort();
                    for (_, tx) in waiters {
                        let _ = tx.send(Err(RevlayError::Shutdown));
                    }
                }
            }
        }

        info!(peers, "connection manager shut down");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
