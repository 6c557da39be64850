// src/cache/transform.rs

//! Agent transform results
//!
//! When the agent instruments a class it returns a reference to the
//! instrumented bytecode. Keyed by (class, segment fingerprint), an entry is
//! written once and never updated; a class whose segment changes simply gets
//! a new row under the new fingerprint.

use super::ArtifactCache;
use crate::error::Result;
use rusqlite::{OptionalExtension, Row, params};
use tracing::debug;

/// Instrumented bytecode reference for one class in one dex segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformCacheEntry {
    pub class_name: String,
    pub segment_fingerprint: String,
    pub instrumented_ref: String,
}

impl TransformCacheEntry {
    pub fn new(
        class_name: impl Into<String>,
        segment_fingerprint: impl Into<String>,
        instrumented_ref: impl Into<String>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            segment_fingerprint: segment_fingerprint.into(),
            instrumented_ref: instrumented_ref.into(),
        }
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            class_name: row.get(0)?,
            segment_fingerprint: row.get(1)?,
            instrumented_ref: row.get(2)?,
        })
    }
}

impl ArtifactCache {
    pub fn lookup_transform(
        &self,
        class_name: &str,
        segment_fingerprint: &str,
    ) -> Result<Option<TransformCacheEntry>> {
        let entry = self
            .conn()
            .query_row(
                "SELECT class_name, segment_fingerprint, instrumented_ref FROM transforms
                 WHERE class_name = ?1 AND segment_fingerprint = ?2",
                params![class_name, segment_fingerprint],
                TransformCacheEntry::from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Insert an entry; an existing (class, segment) row is left untouched
    pub fn store_transform(&self, entry: &TransformCacheEntry) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO transforms (class_name, segment_fingerprint, instrumented_ref)
             VALUES (?1, ?2, ?3)",
            params![
                entry.class_name,
                entry.segment_fingerprint,
                entry.instrumented_ref
            ],
        )?;
        if inserted == 0 {
            debug!(
                "Transform already cached for {} in {}",
                entry.class_name, entry.segment_fingerprint
            );
        }
        Ok(inserted > 0)
    }

    /// Every entry recorded for any of the given segments
    pub fn transforms_for_segments(
        &self,
        segment_fingerprints: &[String],
    ) -> Result<Vec<TransformCacheEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT class_name, segment_fingerprint, instrumented_ref FROM transforms
             WHERE segment_fingerprint = ?1 ORDER BY class_name",
        )?;

        let mut entries = Vec::new();
        for fingerprint in segment_fingerprints {
            let rows = stmt
                .query_map([fingerprint], TransformCacheEntry::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            entries.extend(rows);
        }
        Ok(entries)
    }
}
