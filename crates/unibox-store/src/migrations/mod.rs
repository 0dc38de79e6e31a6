//! Schema upgrades for the ledger file.
//!
//! The applied version lives in SQLite's `user_version` pragma. Opening a
//! ledger applies every step above it, in order, and nothing below it.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// `(version, name, step)`; versions are contiguous from 1.
const STEPS: &[(u32, &str, Step)] = &[(1, "v001_initial", v001_initial::up)];

pub const CURRENT_VERSION: u32 = STEPS.len() as u32;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let applied: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if applied > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "ledger schema v{applied} is newer than this build (v{CURRENT_VERSION})"
        )));
    }

    for &(version, name, step) in STEPS {
        if version <= applied {
            continue;
        }
        tracing::info!(version, name, "upgrading ledger schema");
        step(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", version)?;
    }
    Ok(())
}
