// src/db/mod.rs

//! SQLite persistence for the artifact cache
//!
//! One database file per cache directory holds the APK records, the agent
//! transform entries and the per-device install records. The file is opened
//! in WAL mode with a busy timeout so concurrent readers never block a
//! deploy, and every write path is idempotent.

pub mod paths;
pub mod schema;

use crate::error::Result;
use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// How long a writer waits on a locked database before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Create (if needed) and migrate the database at `path`
pub fn init(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let conn = open(path)?;
    schema::migrate(&conn)?;
    Ok(conn)
}

/// Open an existing database with the connection settings every caller expects
pub fn open(path: &Path) -> Result<Connection> {
    debug!("Opening cache database at {}", path.display());
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/// Run `f` inside a transaction, committing only when it succeeds
///
/// Connections are never shared across threads here, so the unchecked
/// variant lets callers holding `&Connection` group writes.
pub fn transaction<T, F>(conn: &Connection, f: F) -> Result<T>
where
    F: FnOnce(&Transaction<'_>) -> Result<T>,
{
    let tx = conn.unchecked_transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}
