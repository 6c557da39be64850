// src/db/schema.rs

//! Database schema definitions and migrations for the artifact cache
//!
//! Version 1 holds APK records and agent transform entries. Version 2 adds
//! the per-device install records the diff engine trusts to skip hashing
//! remote content.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current cache schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying cache migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        _ => Err(Error::Config(format!(
            "Unknown cache migration version: {version}"
        ))),
    }
}

/// Initial schema
///
/// - artifacts: one row per APK fingerprint with its serialized entry table
/// - transforms: instrumented bytecode references per (class, segment)
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Artifacts: APK content records keyed by fingerprint
        CREATE TABLE artifacts (
            fingerprint TEXT PRIMARY KEY,
            size INTEGER NOT NULL,
            entries_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        -- Transforms: insert-once agent results, superseded by newer segments
        CREATE TABLE transforms (
            class_name TEXT NOT NULL,
            segment_fingerprint TEXT NOT NULL,
            instrumented_ref TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (class_name, segment_fingerprint)
        );

        CREATE INDEX idx_transforms_segment ON transforms(segment_fingerprint);
        ",
    )?;
    Ok(())
}

/// Install records
///
/// The last fingerprint this cache deployed for each (device, package, unit).
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE installs (
            serial TEXT NOT NULL,
            package TEXT NOT NULL,
            unit TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            size INTEGER NOT NULL,
            version_code INTEGER,
            installed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (serial, package, unit)
        );

        CREATE INDEX idx_installs_package ON installs(serial, package);
        ",
    )?;
    Ok(())
}
