//! SQLite database handle.
//!
//! [`Database`] owns a `rusqlite::Connection` behind an `Arc<Mutex<>>`
//! and dispatches every operation onto the tokio blocking pool, so
//! async callers never stall the runtime on file I/O. WAL mode keeps
//! readers concurrent with the single writer, which is the access
//! pattern of the orchestration engine: many status reads, few
//! serialized binding transactions.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// Thread-safe, cheaply cloneable handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database file and apply the connection pragmas.
    ///
    /// Blocks briefly on file I/O; call during startup or wrap in
    /// `spawn_blocking` yourself.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;
        Self::configure(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory database");

        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open the database and bring the schema up to date.
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Self::open(&path)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run all pending schema migrations.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        self.execute_mut(migration::run_all).await
    }

    /// Run a read/write closure against the connection on the blocking pool.
    ///
    /// The primary entry point for store modules:
    ///
    /// ```ignore
    /// let n: i64 = db.execute(|conn| {
    ///     Ok(conn.query_row("SELECT count(*) FROM subtasks", [], |row| row.get(0))?)
    /// }).await?;
    /// ```
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("connection mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    /// Like [`Database::execute`] but with a mutable connection, for
    /// `conn.transaction()` and friends. Multi-row mutations (decompose,
    /// bind, rollback) go through here so they commit or roll back as a
    /// unit.
    pub async fn execute_mut<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("connection mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await?
    }

    /// Connection pragmas applied to every fresh connection.
    fn configure(conn: &Connection) -> StoreResult<()> {
        // Concurrent readers alongside the single writer.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        // NORMAL is durable enough under WAL; a power cut loses at most
        // the last transaction.
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        // 128 MiB mmap keeps hot status reads off the read() syscall path.
        conn.pragma_update(None, "mmap_size", 134_217_728_i64)?;

        // ~32 MiB page cache (negative = KiB).
        conn.pragma_update(None, "cache_size", -32_000_i32)?;

        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Concurrent writers wait instead of failing with SQLITE_BUSY.
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;

        debug!("database pragmas applied");
        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = Database::open_in_memory().unwrap();
        let version: String = db
            .execute(|conn| {
                Ok(conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert!(!version.is_empty());
    }

    #[tokio::test]
    async fn foreign_keys_enforced() {
        let db = Database::open_in_memory().unwrap();
        let on: i64 = db
            .execute(|conn| Ok(conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(on, 1);
    }

    #[tokio::test]
    async fn migrations_run_on_fresh_db() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();

        let count: i64 = db
            .execute(|conn| {
                Ok(conn.query_row("SELECT count(*) FROM tasks", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        db.run_migrations().await.unwrap();
    }
}
