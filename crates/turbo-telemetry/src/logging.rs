//! WARN and ERROR events persisted to SQLite, keyed by the session, path and
//! command they concern.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const LOG_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        session_id TEXT,
        path TEXT,
        cmd TEXT,
        error TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_logs_session ON logs(session_id);
    CREATE INDEX IF NOT EXISTS idx_logs_path ON logs(path);
    CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);";

const DEFAULT_LIMIT: u32 = 100;

/// Which session, path and command an event concerns. Filled from the event's
/// own fields first, then from enclosing spans.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LogContext {
    pub session_id: Option<String>,
    pub path: Option<String>,
    pub cmd: Option<String>,
    pub error: Option<String>,
}

impl LogContext {
    fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.path.is_none() && self.cmd.is_none() && self.error.is_none()
    }

    /// Take whatever `outer` knows that this context does not.
    fn inherit(&mut self, outer: &LogContext) {
        for (mine, theirs) in [
            (&mut self.session_id, &outer.session_id),
            (&mut self.path, &outer.path),
            (&mut self.cmd, &outer.cmd),
        ] {
            if mine.is_none() {
                mine.clone_from(theirs);
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(flatten)]
    pub context: LogContext,
}

impl LogRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            timestamp: row.get("timestamp")?,
            level: row.get("level")?,
            target: row.get("target")?,
            message: row.get("message")?,
            context: LogContext {
                session_id: row.get("session_id")?,
                path: row.get("path")?,
                cmd: row.get("cmd")?,
                error: row.get("error")?,
            },
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub session_id: Option<String>,
    /// Matches the logged path and everything below it.
    pub path_prefix: Option<String>,
    pub cmd: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

impl LogQuery {
    /// WHERE clause and its positional parameters.
    fn filter(&self) -> (String, Vec<Box<dyn ToSql>>) {
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();
        let mut param = |value: String| {
            values.push(Box::new(value));
            format!("?{}", values.len())
        };

        let mut clauses = Vec::new();
        if let Some(level) = &self.level {
            clauses.push(format!("level = {}", param(level.to_uppercase())));
        }
        if let Some(session_id) = &self.session_id {
            clauses.push(format!("session_id = {}", param(session_id.clone())));
        }
        if let Some(cmd) = &self.cmd {
            clauses.push(format!("cmd = {}", param(cmd.clone())));
        }
        let prefix = self
            .path_prefix
            .as_deref()
            .map(|p| p.trim_end_matches('/'))
            .filter(|p| !p.is_empty());
        if let Some(prefix) = prefix {
            let exact = param(prefix.to_string());
            let below = param(format!("{}/%", escape_like(prefix)));
            clauses.push(format!("(path = {exact} OR path LIKE {below} ESCAPE '\\')"));
        }
        if let Some(since) = &self.since {
            clauses.push(format!("timestamp >= {}", param(since.clone())));
        }

        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (filter, values)
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// SQLite table of persisted log lines.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
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
        conn.execute_batch(LOG_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn append(&self, timestamp: &str, level: Level, target: &str, message: &str, context: &LogContext) {
        let conn = self.conn.lock();
        // A failed log write has nowhere to be reported.
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, session_id, path, cmd, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                timestamp,
                level.as_str(),
                target,
                message,
                context.session_id,
                context.path,
                context.cmd,
                context.error,
            ],
        );
    }

    /// Newest first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let (filter, values) = q.filter();
        let sql = format!(
            "SELECT * FROM logs{filter} ORDER BY id DESC LIMIT {}",
            q.limit.unwrap_or(DEFAULT_LIMIT)
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let rows = stmt.query_map(refs.as_slice(), LogRecord::from_row)?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

/// `tracing` layer that writes WARN and ERROR events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Collects the message and the context fields; everything else is dropped.
#[derive(Default)]
struct ContextVisitor {
    message: String,
    context: LogContext,
}

impl Visit for ContextVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        let slot = match field.name() {
            "message" => {
                self.message = value.to_string();
                return;
            }
            "session_id" => &mut self.context.session_id,
            "path" => &mut self.context.path,
            "cmd" => &mut self.context.cmd,
            "error" => &mut self.context.error,
            _ => return,
        };
        *slot = Some(value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{value:?}");
        if field.name() == "message" {
            self.message = text;
        } else {
            self.record_str(field, text.trim_matches('"'));
        }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > Level::WARN {
            return;
        }

        let mut visitor = ContextVisitor::default();
        event.record(&mut visitor);
        for span in ctx.event_scope(event).into_iter().flatten() {
            if let Some(outer) = span.extensions().get::<LogContext>() {
                visitor.context.inherit(outer);
            }
        }

        self.sink.append(
            &Utc::now().to_rfc3339(),
            *metadata.level(),
            metadata.target(),
            &visitor.message,
            &visitor.context,
        );
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = ContextVisitor::default();
        attrs.record(&mut visitor);
        if visitor.context.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.context);
        }
    }
}
