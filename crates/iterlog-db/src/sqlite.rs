use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::{KvStore, StoreError, Table};

/// SQLite-backed key-value store.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the default location.
    ///
    /// The default location is `~/.local/share/iterlog/iterlog.db`.
    pub fn open() -> Result<Self, StoreError> {
        let db_path = Self::default_path();

        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        Self::open_at(&db_path)
    }

    /// Open or create a database at a specific path.
    pub fn open_at(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        tracing::debug!("opened store at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get the default database path.
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("iterlog")
            .join("iterlog.db")
    }

    fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                tbl TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (tbl, key)
            );
            "#,
        )
    }

    fn get_blocking(&self, table: Table, key: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM kv WHERE tbl = ?1 AND key = ?2",
                params![table.as_str(), key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn put_blocking(&self, table: Table, key: &str, value: &Value) -> Result<(), StoreError> {
        let text = serde_json::to_string(value)?;
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        conn.execute(
            r#"
            INSERT INTO kv (tbl, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(tbl, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![table.as_str(), key, text, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn delete_blocking(&self, table: Table, key: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let rows_affected = conn.execute(
            "DELETE FROM kv WHERE tbl = ?1 AND key = ?2",
            params![table.as_str(), key],
        )?;
        Ok(rows_affected > 0)
    }

    fn entries_blocking(&self, table: Table) -> Result<Vec<(String, Value)>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut stmt = conn.prepare("SELECT key, value FROM kv WHERE tbl = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![table.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, text) = row?;
            entries.push((key, serde_json::from_str(&text)?));
        }

        Ok(entries)
    }

    fn replace_all_blocking(
        &self,
        table: Table,
        entries: &[(String, Value)],
    ) -> Result<(), StoreError> {
        let encoded = entries
            .iter()
            .map(|(k, v)| serde_json::to_string(v).map(|text| (k.as_str(), text)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM kv WHERE tbl = ?1", params![table.as_str()])?;
        let now = Utc::now().to_rfc3339();
        for (key, text) in &encoded {
            tx.execute(
                "INSERT INTO kv (tbl, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![table.as_str(), key, text, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for Database {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Value>, StoreError> {
        self.get_blocking(table, key)
    }

    async fn put(&self, table: Table, key: &str, value: Value) -> Result<(), StoreError> {
        self.put_blocking(table, key, &value)
    }

    async fn delete(&self, table: Table, key: &str) -> Result<bool, StoreError> {
        self.delete_blocking(table, key)
    }

    async fn entries(&self, table: Table) -> Result<Vec<(String, Value)>, StoreError> {
        self.entries_blocking(table)
    }

    async fn replace_all(&self, table: Table, entries: Vec<(String, Value)>) -> Result<(), StoreError> {
        self.replace_all_blocking(table, &entries)
    }
}
