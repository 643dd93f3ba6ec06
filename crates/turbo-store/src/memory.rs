use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::StoreError;
use crate::{descendant_prefix, Entry, Storage};

/// Process-local store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().values().filter(|e| !e.value.is_null()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn get(&self, path: &str) -> Result<Entry, StoreError> {
        Ok(self.entries.read().get(path).cloned().unwrap_or_default())
    }

    async fn set(&self, path: &str, value: Value) -> Result<u64, StoreError> {
        let mut entries = self.entries.write();
        let clear = value.is_null();
        let entry = entries.entry(path.to_string()).or_default();
        entry.value = value;
        entry.revision += 1;
        let revision = entry.revision;

        if clear {
            let prefix = descendant_prefix(path);
            for (key, entry) in entries.range_mut(prefix.clone()..) {
                if !key.starts_with(&prefix) {
                    break;
                }
                if key != path && !entry.value.is_null() {
                    entry.value = Value::Null;
                    entry.revision += 1;
                }
            }
        }
        Ok(revision)
    }

    async fn descendants(&self, path: &str) -> Result<Vec<(String, Entry)>, StoreError> {
        let prefix = descendant_prefix(path);
        Ok(self
            .entries
            .read()
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, entry)| key.as_str() != path && !entry.value.is_null())
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
