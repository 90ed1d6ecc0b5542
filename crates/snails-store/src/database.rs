//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// Location string that selects a throwaway in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// Location string that selects `graph.db` in the platform data directory.
pub const DATA_DIR: &str = "data-dir";

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the graph database in the platform data directory
    /// (`~/.local/share/snails/graph.db` on Linux).
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("com", "snails", "snails").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        Self::open_at(&data_dir.join("graph.db"))
    }

    /// Open by location string: [`IN_MEMORY`], [`DATA_DIR`] or a file path.
    pub fn open(location: &str) -> Result<Self> {
        match location {
            IN_MEMORY => Self::open_in_memory(),
            DATA_DIR => Self::new(),
            path => Self::open_at(Path::new(path)),
        }
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "opening graph store");

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// Open a database that lives only as long as this handle.
    pub fn open_in_memory() -> Result<Self> {
        tracing::info!("opening in-memory graph store");
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Filesystem path of the open database, `None` in memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.conn
            .path()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_file_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("graph.db");

        let db = Database::open_at(&path).expect("should open");
        assert!(db.path().is_some());
        assert!(path.exists());
    }

    #[test]
    fn open_memory_has_no_path() {
        let db = Database::open(IN_MEMORY).unwrap();
        assert!(db.path().is_none());
    }
}
