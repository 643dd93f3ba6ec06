pub mod database;
pub mod error;
pub mod memory;
pub mod schema;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use database::Database;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Stored value at one path plus its revision. A path that was never
/// written reads as `null` at revision 0.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub value: Value,
    pub revision: u64,
}

/// Backing document store.
///
/// `set` writes the value and bumps the path's revision atomically. Writing
/// `null` also clears every non-null descendant, bumping each of their
/// revisions.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    async fn get(&self, path: &str) -> Result<Entry, StoreError>;

    /// Returns the new revision of `path`.
    async fn set(&self, path: &str, value: Value) -> Result<u64, StoreError>;

    /// Non-null entries strictly below `path`, ordered by path.
    async fn descendants(&self, path: &str) -> Result<Vec<(String, Entry)>, StoreError>;

    fn backend(&self) -> &'static str;
}

/// Prefix shared by every strict descendant of a canonical path.
pub(crate) fn descendant_prefix(path: &str) -> String {
    if path == turbo_core::path::ROOT {
        path.to_string()
    } else {
        format!("{path}/")
    }
}
