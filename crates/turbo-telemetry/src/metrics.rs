//! In-process server counters with optional SQLite history.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use turbo_core::{CommandKind, EventClass};

/// Latency samples kept for percentile summaries.
const LATENCY_WINDOW: usize = 4096;

struct Counter(AtomicU64);

impl Counter {
    fn new() -> Self {
        Self(AtomicU64::new(0))
    }
    fn increment(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Sliding window of recent observations.
struct LatencyWindow {
    samples: Mutex<VecDeque<f64>>,
    count: AtomicU64,
}

impl LatencyWindow {
    fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut samples = self.samples.lock();
        if samples.len() == LATENCY_WINDOW {
            samples.pop_front();
        }
        samples.push_back(value);
    }

    fn summary(&self) -> LatencySummary {
        let mut sorted: Vec<f64> = self.samples.lock().iter().copied().collect();
        let total = self.count.load(Ordering::Relaxed);
        if sorted.is_empty() {
            return LatencySummary {
                count: total,
                ..Default::default()
            };
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len();
        let pick = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];
        LatencySummary {
            count: total,
            p50: pick(0.50),
            p95: pick(0.95),
            p99: pick(0.99),
            max: sorted[n - 1],
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

/// Point-in-time view of [`ServerMetrics`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub live_sessions: i64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub backpressure_teardowns: u64,
    pub acks_sent: u64,
    pub deliveries_dropped: u64,
    pub commands: BTreeMap<String, u64>,
    pub command_errors: BTreeMap<String, u64>,
    pub events: BTreeMap<String, u64>,
    pub command_latency_ms: LatencySummary,
}

impl MetricsSnapshot {
    /// Flatten into `(name, label, value)` rows.
    fn rows(&self) -> Vec<(String, Option<String>, f64)> {
        let mut rows = vec![
            ("uptime_secs".to_string(), None, self.uptime_secs as f64),
            ("live_sessions".to_string(), None, self.live_sessions as f64),
            ("sessions_opened".to_string(), None, self.sessions_opened as f64),
            ("sessions_closed".to_string(), None, self.sessions_closed as f64),
            ("backpressure_teardowns".to_string(), None, self.backpressure_teardowns as f64),
            ("acks_sent".to_string(), None, self.acks_sent as f64),
            ("deliveries_dropped".to_string(), None, self.deliveries_dropped as f64),
            ("command_latency_p50_ms".to_string(), None, self.command_latency_ms.p50),
            ("command_latency_p99_ms".to_string(), None, self.command_latency_ms.p99),
        ];
        for (cmd, n) in &self.commands {
            rows.push(("commands".to_string(), Some(cmd.clone()), *n as f64));
        }
        for (kind, n) in &self.command_errors {
            rows.push(("command_errors".to_string(), Some(kind.clone()), *n as f64));
        }
        for (class, n) in &self.events {
            rows.push(("events".to_string(), Some(class.clone()), *n as f64));
        }
        rows
    }
}

/// Counters shared by the hub, the router and the transport shell.
pub struct ServerMetrics {
    started: Instant,
    live_sessions: AtomicI64,
    sessions_opened: Counter,
    sessions_closed: Counter,
    backpressure_teardowns: Counter,
    acks_sent: Counter,
    deliveries_dropped: Counter,
    commands: [Counter; CommandKind::COUNT],
    unsupported_commands: Counter,
    command_errors: Mutex<BTreeMap<&'static str, u64>>,
    events: [Counter; EventClass::COUNT],
    command_latency: LatencyWindow,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            live_sessions: AtomicI64::new(0),
            sessions_opened: Counter::new(),
            sessions_closed: Counter::new(),
            backpressure_teardowns: Counter::new(),
            acks_sent: Counter::new(),
            deliveries_dropped: Counter::new(),
            commands: std::array::from_fn(|_| Counter::new()),
            unsupported_commands: Counter::new(),
            command_errors: Mutex::new(BTreeMap::new()),
            events: std::array::from_fn(|_| Counter::new()),
            command_latency: LatencyWindow::new(),
        }
    }

    pub fn session_opened(&self) {
        self.sessions_opened.increment(1);
        self.live_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_closed.increment(1);
        self.live_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn backpressure_teardown(&self) {
        self.backpressure_teardowns.increment(1);
    }

    pub fn ack_sent(&self) {
        self.acks_sent.increment(1);
    }

    pub fn delivery_dropped(&self) {
        self.deliveries_dropped.increment(1);
    }

    pub fn command(&self, kind: Option<CommandKind>) {
        match kind {
            Some(kind) => self.commands[kind.index()].increment(1),
            None => self.unsupported_commands.increment(1),
        }
    }

    pub fn command_error(&self, kind: &'static str) {
        *self.command_errors.lock().entry(kind).or_insert(0) += 1;
    }

    pub fn command_latency(&self, elapsed: Duration) {
        self.command_latency.observe(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn events_published(&self, class: EventClass, deliveries: usize) {
        self.events[class.index()].increment(deliveries as u64);
    }

    pub fn live_sessions(&self) -> i64 {
        self.live_sessions.load(Ordering::Relaxed)
    }

    pub fn commands_total(&self, kind: CommandKind) -> u64 {
        self.commands[kind.index()].get()
    }

    pub fn events_total(&self, class: EventClass) -> u64 {
        self.events[class.index()].get()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut commands: BTreeMap<String, u64> = CommandKind::ALL
            .iter()
            .map(|k| (k.as_str().to_string(), self.commands[k.index()].get()))
            .collect();
        commands.insert("unsupported".to_string(), self.unsupported_commands.get());

        MetricsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            live_sessions: self.live_sessions(),
            sessions_opened: self.sessions_opened.get(),
            sessions_closed: self.sessions_closed.get(),
            backpressure_teardowns: self.backpressure_teardowns.get(),
            acks_sent: self.acks_sent.get(),
            deliveries_dropped: self.deliveries_dropped.get(),
            commands,
            command_errors: self
                .command_errors
                .lock()
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            events: EventClass::ALL
                .iter()
                .map(|c| (c.as_str().to_string(), self.events[c.index()].get()))
                .collect(),
            command_latency_ms: self.command_latency.summary(),
        }
    }
}

/// A persisted metric row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricRow {
    pub id: i64,
    pub timestamp: String,
    pub name: String,
    pub label: Option<String>,
    pub value: f64,
}

#[derive(Clone, Debug, Default)]
pub struct MetricsQuery {
    pub name: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite history of metric snapshots.
pub struct MetricsStore {
    db: Mutex<Connection>,
}

impl MetricsStore {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS metrics_snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 name TEXT NOT NULL,
                 label TEXT,
                 value REAL NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics_snapshots(name, timestamp);",
        )?;
        Ok(Self { db: Mutex::new(conn) })
    }

    /// Append one row per metric. Returns the number of rows written.
    pub fn persist(&self, snapshot: &MetricsSnapshot) -> Result<usize, rusqlite::Error> {
        let now = Utc::now().to_rfc3339();
        let mut db = self.db.lock();
        let tx = db.transaction()?;
        let rows = snapshot.rows();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO metrics_snapshots (timestamp, name, label, value) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (name, label, value) in &rows {
                stmt.execute(rusqlite::params![now, name, label, value])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Newest first.
    pub fn query(&self, q: &MetricsQuery) -> Result<Vec<MetricRow>, rusqlite::Error> {
        let db = self.db.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, name, label, value FROM metrics_snapshots WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(name) = &q.name {
            sql.push_str(&format!(" AND name = ?{}", params.len() + 1));
            params.push(Box::new(name.clone()));
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(MetricRow {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                name: row.get(2)?,
                label: row.get(3)?,
                value: row.get(4)?,
            })
        })?;
        rows.collect()
    }

    /// Delete rows older than `retention_days`.
    pub fn prune(&self, retention_days: u32) -> Result<usize, rusqlite::Error> {
        let cutoff = Utc::now()
            .checked_sub_signed(chrono::Duration::days(i64::from(retention_days)))
            .unwrap_or_else(Utc::now)
            .to_rfc3339();
        self.db.lock().execute(
            "DELETE FROM metrics_snapshots WHERE timestamp < ?1",
            rusqlite::params![cutoff],
        )
    }
}

/// Persist a snapshot every `interval` and prune old rows, until cancelled.
pub fn spawn_snapshot_task(
    metrics: Arc<ServerMetrics>,
    store: Arc<MetricsStore>,
    interval: Duration,
    retention_days: u32,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = metrics.snapshot();
                    let store = Arc::clone(&store);
                    let result = tokio::task::spawn_blocking(move || {
                        let written = store.persist(&snapshot)?;
                        let pruned = store.prune(retention_days)?;
                        Ok::<_, rusqlite::Error>((written, pruned))
                    })
                    .await;
                    match result {
                        Ok(Ok((written, pruned))) => {
                            tracing::debug!(written, pruned, "metrics snapshot persisted");
                        }
                        Ok(Err(e)) => tracing::warn!(error = %e, "failed to persist metrics snapshot"),
                        Err(e) => tracing::warn!(error = %e, "metrics snapshot task failed"),
                    }
                }
            }
        }
    })
}
