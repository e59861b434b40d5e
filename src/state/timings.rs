use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Result as SqlResult};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::data::RunMode;

/// The TimingStore keeps the learned processing-time averages in SQLite.
/// One row per (model, run mode) holding the normalized average in
/// milliseconds per reference tile area.
///
/// The connection sits behind a single mutex: writes happen once per
/// completed unit of work, so contention is negligible.
pub struct TimingStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl TimingStore {
    /// Open the store at the default location.
    ///
    /// The database file is created in the user's data directory:
    /// - Linux: ~/.local/share/chunked-restore/timings.db
    /// - macOS: ~/Library/Application Support/chunked-restore/timings.db
    /// - Windows: %APPDATA%\chunked-restore\timings.db
    pub fn new() -> SqlResult<Self> {
        let db_path = Self::default_db_path();

        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("Could not create {}: {}", parent.display(), e);
            }
        }

        Self::open(&db_path)
    }

    /// Open or create a store at an explicit path
    pub fn open(path: &Path) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        tracing::debug!("Timing store opened at {}", path.display());

        let store = TimingStore {
            conn: Mutex::new(conn),
            db_path: Some(path.to_path_buf()),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// A store that lives only as long as this process
    pub fn in_memory() -> SqlResult<Self> {
        let store = TimingStore {
            conn: Mutex::new(Connection::open_in_memory()?),
            db_path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn default_db_path() -> PathBuf {
        let mut path = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(std::env::temp_dir);

        path.push("chunked-restore");
        path.push("timings.db");
        path
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a row half-written,
        // so a poisoned connection is still usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> SqlResult<()> {
        self.connection().execute(
            "CREATE TABLE IF NOT EXISTS timing_averages (
                model           TEXT NOT NULL,
                mode            TEXT NOT NULL,
                avg_ms          REAL NOT NULL,
                samples         INTEGER NOT NULL DEFAULT 0,
                updated_at      INTEGER NOT NULL,
                PRIMARY KEY (model, mode)
            )",
            [],
        )?;
        Ok(())
    }

    /// Path to the database file (None for in-memory stores)
    pub fn path(&self) -> Option<&PathBuf> {
        self.db_path.as_ref()
    }

    /// Read the persisted normalized average for a model
    pub fn load_average(&self, model: &str, mode: RunMode) -> SqlResult<Option<f64>> {
        self.connection()
            .query_row(
                "SELECT avg_ms FROM timing_averages WHERE model = ?1 AND mode = ?2",
                rusqlite::params![model, mode.as_str()],
                |row| row.get(0),
            )
            .optional()
    }

    /// Persist the normalized average for a model, bumping its sample count
    pub fn save_average(&self, model: &str, mode: RunMode, avg_ms: f64) -> SqlResult<()> {
        self.connection().execute(
            "INSERT INTO timing_averages (model, mode, avg_ms, samples, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(model, mode) DO UPDATE SET
                avg_ms = excluded.avg_ms,
                samples = samples + 1,
                updated_at = excluded.updated_at",
            rusqlite::params![model, mode.as_str(), avg_ms, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Forget everything learned about a model
    pub fn clear_model(&self, model: &str) -> SqlResult<usize> {
        self.connection().execute(
            "DELETE FROM timing_averages WHERE model = ?1",
            rusqlite::params![model],
        )
    }
}

// Implement Debug for better error messages
impl std::fmt::Debug for TimingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimingStore")
            .field("db_path", &self.db_path)
            .finish()
    }
}
