//! `/health` endpoint body.

use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server runs.
    pub status: &'static str,
    pub uptime_secs: u64,
    /// Live WebSocket sessions.
    pub sessions: usize,
    /// Subscriber memberships across all paths.
    pub subscriptions: usize,
    pub storage: &'static str,
}

pub fn health_check(
    uptime: Duration,
    sessions: usize,
    subscriptions: usize,
    storage: &'static str,
) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_secs: uptime.as_secs(),
        sessions,
        subscriptions,
        storage,
    }
}
