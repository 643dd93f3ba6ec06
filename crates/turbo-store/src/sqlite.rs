use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;
use crate::{descendant_prefix, Entry, Storage};

/// Durable store over the `entries` table. Values are JSON text, `NULL`
/// for removed paths.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| StoreError::Database(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl Storage for SqliteStore {
    #[instrument(skip(self))]
    async fn get(&self, path: &str) -> Result<Entry, StoreError> {
        let path = path.to_string();
        self.blocking(move |conn| read_entry(conn, &path)).await
    }

    #[instrument(skip(self, value))]
    async fn set(&self, path: &str, value: Value) -> Result<u64, StoreError> {
        let path = path.to_string();
        self.blocking(move |conn| write_entry(conn, &path, &value)).await
    }

    async fn descendants(&self, path: &str) -> Result<Vec<(String, Entry)>, StoreError> {
        let path = path.to_string();
        self.blocking(move |conn| {
            let prefix = descendant_prefix(&path);
            let mut stmt = conn.prepare(
                "SELECT path, value, revision FROM entries
                 WHERE substr(path, 1, length(?1)) = ?1 AND path != ?2 AND value IS NOT NULL
                 ORDER BY path",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![prefix, path], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(path, text, revision)| Ok((path, decode(text, revision)?)))
                .collect()
        })
        .await
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

fn read_entry(conn: &Connection, path: &str) -> Result<Entry, StoreError> {
    let row: Option<(Option<String>, i64)> = conn
        .query_row(
            "SELECT value, revision FROM entries WHERE path = ?1",
            [path],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        Some((text, revision)) => decode(text, revision),
        None => Ok(Entry::default()),
    }
}

fn write_entry(conn: &Connection, path: &str, value: &Value) -> Result<u64, StoreError> {
    let text = if value.is_null() {
        None
    } else {
        Some(serde_json::to_string(value)?)
    };
    let now = Utc::now().to_rfc3339();

    let tx = conn.unchecked_transaction()?;
    let revision: i64 = tx.query_row(
        "INSERT INTO entries (path, value, revision, updated_at) VALUES (?1, ?2, 1, ?3)
         ON CONFLICT(path) DO UPDATE SET
             value = excluded.value,
             revision = entries.revision + 1,
             updated_at = excluded.updated_at
         RETURNING revision",
        rusqlite::params![path, text, now],
        |row| row.get(0),
    )?;
    if value.is_null() {
        tx.execute(
            "UPDATE entries SET value = NULL, revision = revision + 1, updated_at = ?2
             WHERE value IS NOT NULL AND substr(path, 1, length(?1)) = ?1",
            rusqlite::params![descendant_prefix(path), now],
        )?;
    }
    tx.commit()?;
    Ok(revision as u64)
}

fn decode(text: Option<String>, revision: i64) -> Result<Entry, StoreError> {
    let value = match text {
        Some(text) => serde_json::from_str(&text)?,
        None => Value::Null,
    };
    Ok(Entry {
        value,
        revision: revision as u64,
    })
}
