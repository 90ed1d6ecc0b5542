//! Schema migrations.
//!
//! Applied on every [`Database`](crate::Database) open, guarded by
//! `PRAGMA user_version` so each step runs once per file.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Schema version this build writes.
pub const CURRENT_VERSION: u32 = 1;

type Step = fn(&Connection) -> std::result::Result<(), rusqlite::Error>;

const STEPS: &[(u32, &str, Step)] = &[(1, "v001_initial", v001_initial::up)];

pub fn schema_version(conn: &Connection) -> Result<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Bring the schema up to [`CURRENT_VERSION`].
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current = schema_version(conn)?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{current} is newer than supported v{CURRENT_VERSION}"
        )));
    }

    for (version, name, up) in STEPS {
        if current < *version {
            tracing::info!(migration = *name, "applying graph store migration");
            up(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
            conn.pragma_update(None, "user_version", version)?;
        }
    }

    Ok(())
}
