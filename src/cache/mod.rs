// src/cache/mod.rs

//! Content-addressed artifact cache
//!
//! Maps the fingerprint of an APK to its analyzed entry table so unchanged
//! content is never inflated or re-hashed twice. The same database also holds
//! agent transform results ([`transform`]) and what this machine last
//! installed on each device ([`installs`]).
//!
//! Every write is insert-once: storing a fingerprint that is already present
//! is a no-op, so concurrent deployers sharing a cache directory converge on
//! the same rows.

pub mod installs;
pub mod transform;

pub use installs::InstallRecord;
pub use transform::TransformCacheEntry;

use crate::apk::{self, ApkContents, EntryRecord};
use crate::db;
use crate::error::{Error, Result};
use crate::hash::{self, Fingerprint, HashAlgorithm};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Handle to one cache database
pub struct ArtifactCache {
    conn: Connection,
    path: PathBuf,
    algorithm: HashAlgorithm,
}

impl ArtifactCache {
    /// Open (creating and migrating if needed) the cache database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = db::init(&path)?;
        Ok(Self {
            conn,
            path,
            algorithm: HashAlgorithm::default(),
        })
    }

    /// Select the fingerprint algorithm used by [`Self::analyze`]
    pub fn with_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    #[inline]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Look up the record for an APK fingerprint
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<ApkContents>> {
        let row = self
            .conn
            .query_row(
                "SELECT fingerprint, size, entries_json FROM artifacts WHERE fingerprint = ?1",
                [fingerprint.to_string()],
                RawArtifact::from_row,
            )
            .optional()?;
        row.map(RawArtifact::into_contents).transpose()
    }

    /// Store a record; returns false when the fingerprint was already present
    pub fn store(&self, contents: &ApkContents) -> Result<bool> {
        let entries_json = serde_json::to_string(&contents.entries)?;
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO artifacts (fingerprint, size, entries_json) VALUES (?1, ?2, ?3)",
            params![contents.fingerprint.to_string(), contents.size as i64, entries_json],
        )?;

        if inserted == 0 {
            debug!("Artifact already cached: {}", contents.fingerprint);
            return Ok(false);
        }
        debug!(
            "Cached artifact {} ({} entries)",
            contents.fingerprint,
            contents.entries.len()
        );
        Ok(true)
    }

    /// Every cached record, oldest first
    pub fn list_all(&self) -> Result<Vec<ApkContents>> {
        let mut stmt = self.conn.prepare(
            "SELECT fingerprint, size, entries_json FROM artifacts
             ORDER BY created_at, fingerprint",
        )?;
        let rows = stmt
            .query_map([], RawArtifact::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawArtifact::into_contents).collect()
    }

    /// True if any fingerprint appears in more than one row
    pub fn has_duplicate_fingerprints(&self) -> Result<bool> {
        let duplicates: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM (
                SELECT fingerprint FROM artifacts GROUP BY fingerprint HAVING COUNT(*) > 1
            )",
            [],
            |row| row.get(0),
        )?;
        Ok(duplicates > 0)
    }

    /// Write an independent copy of the whole cache to `path` and open it
    ///
    /// `path` must not exist yet.
    pub fn duplicate_to(&self, path: impl AsRef<Path>) -> Result<ArtifactCache> {
        let path = path.as_ref();
        let target = path.to_str().ok_or_else(|| {
            Error::Config(format!("Cache path is not valid UTF-8: {}", path.display()))
        })?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        self.conn.execute("VACUUM INTO ?1", [target])?;
        debug!("Duplicated cache {} to {}", self.path.display(), path.display());

        Ok(ArtifactCache::open(path)?.with_algorithm(self.algorithm))
    }

    /// Analyze a local APK, reusing the cached entry table when its fingerprint is known
    ///
    /// Freshly analyzed content is not stored here; callers store it once the
    /// deploy that used it succeeded.
    pub fn analyze(&self, path: &Path) -> Result<ApkContents> {
        let fingerprint = hash::fingerprint_file(self.algorithm, path)?;
        if let Some(cached) = self.lookup(&fingerprint)? {
            debug!("Cache hit for {} ({})", path.display(), fingerprint.short(12));
            return Ok(cached);
        }
        apk::analyze(self.algorithm, path)
    }
}

struct RawArtifact {
    fingerprint: String,
    size: i64,
    entries_json: String,
}

impl RawArtifact {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            fingerprint: row.get(0)?,
            size: row.get(1)?,
            entries_json: row.get(2)?,
        })
    }

    fn into_contents(self) -> Result<ApkContents> {
        let fingerprint = Fingerprint::parse(&self.fingerprint).map_err(|e| {
            Error::Config(format!("Corrupt fingerprint in cache: {e}"))
        })?;
        let entries: Vec<EntryRecord> = serde_json::from_str(&self.entries_json)?;
        Ok(ApkContents {
            fingerprint,
            size: self.size as u64,
            entries,
        })
    }
}
