//! SQLite connection management.
//!
//! One process-wide connection behind a mutex; statements run on the
//! blocking pool so the async handlers never touch SQLite directly. WAL
//! mode and foreign keys are enabled at open time - the attempt log relies
//! on `ON DELETE CASCADE`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use tokio::task;

/// Shared database handle.
#[derive(Clone)]
pub struct Database {
    pub(crate) connection: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file and configure pragmas.
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();

        let connection = task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_READ_WRITE,
            )
            .context("failed to open SQLite database")?;

            conn.pragma_update(None, "foreign_keys", "ON")
                .context("failed to enable foreign keys")?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .context("failed to set WAL mode")?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .context("failed to set synchronous mode")?;

            Ok(conn)
        })
        .await??;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self> {
        let connection = task::spawn_blocking(|| -> Result<Connection> {
            let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
            conn.pragma_update(None, "foreign_keys", "ON")
                .context("failed to enable foreign keys")?;
            Ok(conn)
        })
        .await??;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Apply the schema migration.
    pub async fn migrate(&self) -> Result<()> {
        let connection = Arc::clone(&self.connection);

        task::spawn_blocking(move || -> Result<()> {
            let conn = connection.lock().unwrap();
            let migration_sql = include_str!("../../migrations/001_create_voiceprints.up.sql");
            conn.execute_batch(migration_sql)
                .context("failed to execute migration")?;
            Ok(())
        })
        .await?
    }

    /// Cheap liveness probe.
    pub async fn health_check(&self) -> Result<bool> {
        let connection = Arc::clone(&self.connection);

        task::spawn_blocking(move || -> Result<bool> {
            let conn = connection.lock().unwrap();
            let result: i32 = conn.prepare("SELECT 1")?.query_row([], |row| row.get(0))?;
            Ok(result == 1)
        })
        .await?
    }
}
