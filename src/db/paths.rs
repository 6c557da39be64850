// src/db/paths.rs
//! Centralized path derivation for the cache directory

use std::path::{Path, PathBuf};

/// Environment variable that overrides the cache directory
pub const CACHE_DIR_ENV: &str = "SWAPDEPLOY_CACHE_DIR";

/// Name of the cache database inside the cache directory
pub const CACHE_DB_NAME: &str = "cache.db";

/// Default cache directory, honoring the environment override
pub fn default_cache_dir() -> PathBuf {
    std::env::var(CACHE_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("swapdeploy")
        })
}

/// Database file for a cache directory
pub fn cache_db(cache_dir: &Path) -> PathBuf {
    cache_dir.join(CACHE_DB_NAME)
}

/// Directory holding per-device lock files
pub fn locks_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join("locks")
}

/// Lock file for one device serial
///
/// Serials such as `emulator-5554` or `192.168.1.4:5555` are sanitized so
/// each maps to a single plain file name.
pub fn device_lock(cache_dir: &Path, serial: &str) -> PathBuf {
    let name: String = serial
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    locks_dir(cache_dir).join(format!("{name}.lock"))
}

/// Local staging area for overlay content before it is pushed
pub fn staging_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join("tmp")
}
