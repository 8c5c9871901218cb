//! The SQLite handle behind the message log.
//!
//! Every constructor configures the connection and migrates it before
//! returning, so a [`Database`] is always at the latest schema.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// File name of the message log inside the data directory.
pub const DB_FILE_NAME: &str = "courier.db";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open the log in the platform data directory, creating it if needed
    /// (`~/.local/share/courier/courier.db` on Linux).
    pub fn new() -> Result<Self> {
        let path = default_path()?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        Self::open_at(&path)
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "opening message log");
        let conn = Connection::open(path)?;
        // WAL lets readers proceed while the inbound task appends.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::prepare(conn)
    }

    /// A private database that disappears on drop.
    pub fn open_in_memory() -> Result<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Backing file, `None` for in-memory databases.
    pub fn path(&self) -> Option<PathBuf> {
        self.conn
            .path()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }
}

/// Where [`Database::new`] keeps the message log.
pub fn default_path() -> Result<PathBuf> {
    ProjectDirs::from("com", "courier", "courier")
        .map(|dirs| dirs.data_dir().join(DB_FILE_NAME))
        .ok_or(StoreError::NoDataDir)
}
