//! [`AttachRouter`]: matches inbound data connections to waiting dials.
//!
//! Every `RevDialer::dial` registers its `request_id` here before sending
//! `ConnReady`.  When the peer's `Attach` arrives on the shared listener the
//! server hands the stream to [`AttachRouter::deliver`], which completes the
//! one waiting dial.  Registrations are removed when the returned
//! [`PendingAttach`] is dropped, so a dial that times out or is cancelled
//! leaves nothing behind, and a late `Attach` for it is refused.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

// ---

use revlay_domain::DataConnPtr;

// ---------------------------------------------------------------------------
// AttachRouter
// ---------------------------------------------------------------------------

struct Slot {
    // ---
    dialer_id: Uuid,
    tx: oneshot::Sender<DataConnPtr>,
}

// ---

/// Cheap-clone handle to the request table shared by one server's dialers.
#[derive(Clone, Default)]
pub struct AttachRouter {
    // ---
    slots: Arc<Mutex<HashMap<Uuid, Slot>>>,
}

// ---

impl AttachRouter {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    // ---

    /// Register a dial awaiting its data connection.
    pub fn register(&self, dialer_id: Uuid, request_id: Uuid) -> PendingAttach {
        // ---
        let (tx, rx) = oneshot::channel();
        self.slots.lock().insert(request_id, Slot { dialer_id, tx });

        PendingAttach {
            request_id,
            rx,
            slots: Arc::clone(&self.slots),
        }
    }

    // ---

    /// Hand an attached data connection to its waiting dial.
    ///
    /// Returns `false` and drops (closes) `conn` when no dial is waiting
    /// for `request_id` or the attach names a different dialer.
    pub fn deliver(&self, dialer_id: Uuid, request_id: Uuid, conn: DataConnPtr) -> bool {
        // ---
        let slot = {
            let mut slots = self.slots.lock();
            let ours = slots
                .get(&request_id)
                .is_some_and(|slot| slot.dialer_id == dialer_id);
            if ours {
                slots.remove(&request_id)
            } else {
                None
            }
        };

        match slot {
            Some(slot) => slot.tx.send(conn).is_ok(),
            None => {
                tracing::warn!(%dialer_id, %request_id, "attach for unknown request, closing");
                false
            }
        }
    }

    // ---

    /// Number of dials currently awaiting an attach.
    pub fn pending(&self) -> usize {
        self.slots.lock().len()
    }
}

// ---------------------------------------------------------------------------
// PendingAttach
// ---------------------------------------------------------------------------

/// One registered dial.  Dropping it unregisters the request.
pub struct PendingAttach {
    // ---
    request_id: Uuid,
    rx: oneshot::Receiver<DataConnPtr>,
    slots: Arc<Mutex<HashMap<Uuid, Slot>>>,
}

// ---

impl PendingAttach {
    // ---
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    // ---

    /// Wait for the data connection.  `None` if the router dropped the slot.
    pub async fn wait(&mut self) -> Option<DataConnPtr> {
        (&mut self.rx).await.ok()
    }
}

// ---

impl Drop for PendingAttach {
    fn drop(&mut self) {
        self.slots.lock().remove(&self.request_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
