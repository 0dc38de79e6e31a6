//! The SQLite file behind the delivery ledger.
//!
//! Every constructor brings the schema up to date before handing out a
//! [`Database`], so the query modules can assume the latest tables.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// One open ledger file, or a private in-memory ledger.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// `unibox.db` in the Unibox data directory (see [`default_data_dir`]).
    pub fn new() -> Result<Self> {
        let db_path = default_data_dir()?.join("unibox.db");
        tracing::info!(path = %db_path.display(), "opening message ledger");
        Self::open_at(&db_path)
    }

    /// Missing parent directories are created. The file runs in WAL mode.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// Nothing survives the connection. Tests and throwaway sessions use this.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // files.message_id cascades on message deletion.
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Needed for transactions.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// `None` for in-memory ledgers.
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().filter(|p| !p.is_empty()).map(PathBuf::from)
    }
}

/// Where Unibox keeps its ledger and default downloads, created on demand.
///
/// `~/.local/share/unibox` on Linux, `~/Library/Application Support/com.unibox.unibox`
/// on macOS, and the roaming app-data folder on Windows.
pub fn default_data_dir() -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("com", "unibox", "unibox").ok_or(StoreError::NoDataDir)?;
    let data_dir = project_dirs.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;
    Ok(data_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.db");

        let db = Database::open_at(&path).expect("should open");
        assert!(db.path().is_some());
        assert!(path.exists());
    }

    #[test]
    fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        drop(Database::open_at(&path).unwrap());
        let db = Database::open_at(&path).expect("reopen should not re-run migrations");
        let version: u32 = db
            .conn()
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, crate::migrations::CURRENT_VERSION);
    }
}
