//! Durable storage layer for iterlog.
//!
//! Exposes a small key-value abstraction ([`KvStore`]) over named tables,
//! with a SQLite backend ([`Database`]) for real runs and an in-process
//! backend ([`MemoryStore`]) for tests and ephemeral use.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::Database;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors raised by a key-value backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// The logical tables kept in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// agent id -> current session id
    CurrentSessions,
    /// agent id -> archived session history
    Histories,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::CurrentSessions => "current_sessions",
            Table::Histories => "histories",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform key-value access to durable tables.
///
/// Every operation is fallible; callers decide whether a failure is fatal.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Value>, StoreError>;

    async fn put(&self, table: Table, key: &str, value: Value) -> Result<(), StoreError>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, table: Table, key: &str) -> Result<bool, StoreError>;

    /// All entries of a table, ordered by key.
    async fn entries(&self, table: Table) -> Result<Vec<(String, Value)>, StoreError>;

    /// Clear the table and write `entries` in its place, as one unit.
    async fn replace_all(&self, table: Table, entries: Vec<(String, Value)>) -> Result<(), StoreError>;
}
