use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::{KvStore, StoreError, Table};

/// In-process key-value store.
///
/// Nothing survives the process. `set_available(false)` makes every call
/// fail with [`StoreError::Unavailable`], which is how tests simulate a
/// backing store that has gone away.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<Table, BTreeMap<String, Value>>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store set offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn with_tables<T>(
        &self,
        f: impl FnOnce(&mut HashMap<Table, BTreeMap<String, Value>>) -> T,
    ) -> Result<T, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(f(&mut tables))
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Value>, StoreError> {
        self.with_tables(|t| t.get(&table).and_then(|rows| rows.get(key)).cloned())
    }

    async fn put(&self, table: Table, key: &str, value: Value) -> Result<(), StoreError> {
        self.with_tables(|t| {
            t.entry(table).or_default().insert(key.to_string(), value);
        })
    }

    async fn delete(&self, table: Table, key: &str) -> Result<bool, StoreError> {
        self.with_tables(|t| {
            t.get_mut(&table)
                .map(|rows| rows.remove(key).is_some())
                .unwrap_or(false)
        })
    }

    async fn entries(&self, table: Table) -> Result<Vec<(String, Value)>, StoreError> {
        self.with_tables(|t| {
            t.get(&table)
                .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default()
        })
    }

    async fn replace_all(&self, table: Table, entries: Vec<(String, Value)>) -> Result<(), StoreError> {
        self.with_tables(|t| {
            t.insert(table, entries.into_iter().collect());
        })
    }
}
