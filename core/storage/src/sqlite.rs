//! SQLite-backed key-value store.
//!
//! Persists records, queued ops and engine metadata in a single database
//! file so a device can restart mid-queue without losing local edits.

use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::kv::{KvStore, Namespace};
use outbox_common::{Error, Result};

/// Key-value store on top of a SQLite database.
///
/// `rusqlite` is blocking, so every call hops onto tokio's blocking pool.
/// Writes use `synchronous=FULL` so a committed put survives power loss.
#[derive(Clone)]
pub struct SqliteKv {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKv {
    /// Create or open a database file.
    ///
    /// # Errors
    /// - Database creation or schema setup failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(sqlite_error)?;
        let kv = Self::init(conn)?;
        info!("SQLite store opened at {}", db_path.as_ref().display());
        Ok(kv)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sqlite_error)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(sqlite_error)?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(sqlite_error)?;
        debug!("SQLite journal mode: {}", mode);

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                ns TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (ns, key)
            ) WITHOUT ROWID;
            "#,
        )
        .map_err(sqlite_error)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| Error::Storage("SQLite connection lock poisoned".to_string()))?;
            f(&guard).map_err(sqlite_error)
        })
        .await
        .map_err(|e| Error::Storage(format!("SQLite task failed: {}", e)))?
    }
}

fn sqlite_error(err: rusqlite::Error) -> Error {
    Error::Storage(format!("SQLite: {}", err))
}

#[async_trait]
impl KvStore for SqliteKv {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let value = conn.query_row(
                "SELECT value FROM kv WHERE ns = ?1 AND key = ?2",
                params![ns.as_str(), key],
                |row| row.get(0),
            );
            match value {
                Ok(v) => Ok(Some(v)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn put(&self, ns: Namespace, key: &str, value: Vec<u8>) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv (ns, key, value) VALUES (?1, ?2, ?3)",
                params![ns.as_str(), key, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, ns: Namespace, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM kv WHERE ns = ?1 AND key = ?2",
                params![ns.as_str(), key],
            )?;
            Ok(())
        })
        .await
    }

    async fn scan(&self, ns: Namespace) -> Result<Vec<(String, Vec<u8>)>> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT key, value FROM kv WHERE ns = ?1 ORDER BY key")?;
            let rows = stmt.query_map([ns.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let entries = rows.collect::<rusqlite::Result<Vec<(String, Vec<u8>)>>>()?;
            Ok(entries)
        })
        .await
    }
}
