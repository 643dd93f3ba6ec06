//! One connected client: outbound queue, liveness and subscription
//! back-references.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use turbo_core::{EventClass, SessionId};

/// Why a frame could not be queued for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("outbound queue full")]
    Full,
    #[error("session closed")]
    Closed,
}

pub struct Session {
    id: SessionId,
    outbox: Mutex<Option<mpsc::Sender<String>>>,
    transport: CancellationToken,
    closed: AtomicBool,
    subscriptions: Mutex<HashSet<(String, EventClass)>>,
    last_pong: AtomicU64,
}

impl Session {
    /// Create a session with a bounded outbox. The receiver feeds the
    /// transport writer.
    pub fn new(id: SessionId, capacity: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let session = Arc::new(Self {
            id,
            outbox: Mutex::new(Some(tx)),
            transport: CancellationToken::new(),
            closed: AtomicBool::new(false),
            subscriptions: Mutex::new(HashSet::new()),
            last_pong: AtomicU64::new(now_secs()),
        });
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue a frame without waiting.
    pub fn deliver(&self, frame: String) -> Result<(), DeliveryError> {
        let outbox = self.outbox.lock();
        let Some(tx) = outbox.as_ref() else {
            return Err(DeliveryError::Closed);
        };
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Claim the teardown. Returns true exactly once.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop the sender so the writer drains and exits, and signal the
    /// transport to close.
    pub(crate) fn close(&self) {
        self.outbox.lock().take();
        self.transport.cancel();
    }

    /// Cancelled when the session is torn down.
    pub fn transport_token(&self) -> CancellationToken {
        self.transport.clone()
    }

    /// Record a membership. Refused once teardown has started, so nothing
    /// is added after `take_subscriptions` drained the set.
    pub(crate) fn add_subscription(&self, path: &str, class: EventClass) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        if self.is_closed() {
            return false;
        }
        subscriptions.insert((path.to_string(), class));
        true
    }

    pub(crate) fn remove_subscription(&self, path: &str, class: EventClass) {
        self.subscriptions.lock().remove(&(path.to_string(), class));
    }

    pub(crate) fn take_subscriptions(&self) -> Vec<(String, EventClass)> {
        self.subscriptions.lock().drain().collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }

    #[cfg(test)]
    pub(crate) fn set_last_pong(&self, secs: u64) {
        self.last_pong.store(secs, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
