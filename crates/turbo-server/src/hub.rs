//! Live sessions and the shared services commands run against.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use turbo_core::{Ack, ChangeEvent, EventClass, SessionId, SessionIdAllocator};
use turbo_store::Storage;
use turbo_telemetry::ServerMetrics;

use crate::bus::MessageBus;
use crate::locker::PathLocker;
use crate::session::{DeliveryError, Session};

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Socket closed or errored.
    Transport,
    /// Outbox full.
    Backpressure,
    /// No pong within the client timeout.
    Timeout,
    /// Server shutting down.
    Shutdown,
}

impl Teardown {
    fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Backpressure => "backpressure",
            Self::Timeout => "timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

pub struct Hub {
    sessions: DashMap<SessionId, Arc<Session>>,
    ids: SessionIdAllocator,
    bus: MessageBus,
    locker: PathLocker,
    store: Arc<dyn Storage>,
    metrics: Arc<ServerMetrics>,
    outbox_capacity: usize,
    started: Instant,
}

impl Hub {
    pub fn new(store: Arc<dyn Storage>, metrics: Arc<ServerMetrics>, outbox_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            ids: SessionIdAllocator::new(),
            bus: MessageBus::new(),
            locker: PathLocker::new(),
            store,
            metrics,
            outbox_capacity,
            started: Instant::now(),
        }
    }

    /// Register a new session. The receiver feeds its transport writer.
    pub fn connect(&self) -> (Arc<Session>, mpsc::Receiver<String>) {
        let (session, rx) = Session::new(self.ids.next(), self.outbox_capacity);
        self.sessions.insert(session.id(), Arc::clone(&session));
        self.metrics.session_opened();
        tracing::info!(session_id = %session.id(), "session connected");
        (session, rx)
    }

    /// Tear a session down. Only the first call for a session has any effect.
    pub fn disconnect(&self, session: &Session, reason: Teardown) -> bool {
        if !session.mark_closed() {
            return false;
        }
        self.sessions.remove(&session.id());
        let dropped = self.bus.unsubscribe_all(session);
        session.close();
        self.metrics.session_closed();
        if reason == Teardown::Backpressure {
            self.metrics.backpressure_teardown();
            tracing::warn!(session_id = %session.id(), "outbound queue full, closing session");
        }
        tracing::info!(
            session_id = %session.id(),
            reason = reason.as_str(),
            subscriptions = dropped,
            "session disconnected"
        );
        true
    }

    /// Queue a frame for one session, tearing it down if its outbox is full.
    pub fn send(&self, session: &Session, frame: String) -> Result<(), DeliveryError> {
        let result = session.deliver(frame);
        if result == Err(DeliveryError::Full) {
            self.disconnect(session, Teardown::Backpressure);
        }
        result
    }

    /// Acknowledge a command. Nothing is sent when the command had no ack id.
    pub fn send_ack(&self, session: &Session, ack: &Ack) {
        if ack.ack.is_none() {
            return;
        }
        let Some(frame) = encode(ack) else {
            return;
        };
        if self.send(session, frame).is_ok() {
            self.metrics.ack_sent();
        }
    }

    /// Publish `event` to subscribers of `(class, event.path)`. Subscribers
    /// with a full outbox are disconnected after the fan-out completes.
    pub fn publish(&self, class: EventClass, event: &ChangeEvent) -> usize {
        if !self.bus.has_subscribers(class, &event.path) {
            return 0;
        }
        let Some(frame) = encode(event) else {
            return 0;
        };
        let published = self.bus.publish(class, &event.path, &frame);
        self.metrics.events_published(class, published.delivered);
        for session in &published.overflowed {
            self.metrics.delivery_dropped();
            self.disconnect(session, Teardown::Backpressure);
        }
        published.delivered
    }

    /// Disconnect sessions that have not answered a ping within `timeout`.
    pub fn reap(&self, timeout: Duration) -> usize {
        let stale: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().is_alive(timeout))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        stale
            .iter()
            .filter(|session| self.disconnect(session, Teardown::Timeout))
            .count()
    }

    pub fn disconnect_all(&self) -> usize {
        let live: Vec<Arc<Session>> = self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        live.iter()
            .filter(|session| self.disconnect(session, Teardown::Shutdown))
            .count()
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn locker(&self) -> &PathLocker {
        &self.locker
    }

    pub fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Serialize an outgoing frame. A failure is logged and the frame skipped.
fn encode<T: Serialize>(frame: &T) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode outgoing frame");
            None
        }
    }
}
