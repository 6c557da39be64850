// src/apk/entries.rs

//! APK entry tables
//!
//! An entry table lists every file inside an APK with its CRC-32 and sizes.
//! Dex segments (`classes.dex`, `classes2.dex`, ...) additionally carry the
//! fingerprint of their uncompressed bytes, which is what the swap path
//! keys transform results on.

use crate::error::{Error, Result};
use crate::hash::{self, Fingerprint, HashAlgorithm};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;
use tracing::debug;
use zip::ZipArchive;
use zip::result::ZipError;

/// Name of the manifest entry
pub const MANIFEST_ENTRY: &str = "AndroidManifest.xml";

/// One file inside an APK
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub name: String,
    pub crc32: u32,
    pub size: u64,
    pub compressed_size: u64,
    /// Prefixed fingerprint of the uncompressed content, dex segments only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_fingerprint: Option<String>,
}

impl EntryRecord {
    pub fn is_dex_segment(&self) -> bool {
        self.segment_fingerprint.is_some()
    }

    pub fn is_manifest(&self) -> bool {
        self.name == MANIFEST_ENTRY
    }
}

/// Analyzed content of one APK file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApkContents {
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub entries: Vec<EntryRecord>,
}

impl ApkContents {
    pub fn entry(&self, name: &str) -> Option<&EntryRecord> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Dex segment entries in archive order
    pub fn segments(&self) -> impl Iterator<Item = &EntryRecord> {
        self.entries.iter().filter(|e| e.is_dex_segment())
    }

    /// Entries that are neither dex segments nor the manifest
    pub fn resources(&self) -> impl Iterator<Item = &EntryRecord> {
        self.entries
            .iter()
            .filter(|e| !e.is_dex_segment() && !e.is_manifest())
    }
}

/// True for `classes.dex` and `classes<N>.dex` at the archive root
pub fn is_dex_segment(name: &str) -> bool {
    name.strip_prefix("classes")
        .and_then(|rest| rest.strip_suffix(".dex"))
        .is_some_and(|index| index.chars().all(|c| c.is_ascii_digit()))
}

fn invalid_apk(path: &Path, reason: impl fmt::Display) -> Error {
    Error::InvalidApk {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Read an APK, fingerprint it and build its entry table
///
/// Dex segments are inflated to fingerprint them; the zip reader checks
/// their CRC-32 while doing so.
pub fn analyze(algorithm: HashAlgorithm, path: &Path) -> Result<ApkContents> {
    let data = std::fs::read(path)?;
    let fingerprint = hash::fingerprint_bytes(algorithm, &data);
    let mut zip =
        ZipArchive::new(Cursor::new(data.as_slice())).map_err(|e| invalid_apk(path, e))?;

    let mut entries = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).map_err(|e| invalid_apk(path, e))?;
        if entry.is_dir() {
            continue;
        }

        let name = entry.name().to_string();
        let segment_fingerprint = if is_dex_segment(&name) {
            let segment = hash::fingerprint_reader(algorithm, &mut entry)
                .map_err(|e| invalid_apk(path, format!("{name}: {e}")))?;
            Some(segment.to_string())
        } else {
            None
        };

        entries.push(EntryRecord {
            crc32: entry.crc32(),
            size: entry.size(),
            compressed_size: entry.compressed_size(),
            name,
            segment_fingerprint,
        });
    }

    debug!(
        "Analyzed {} ({} entries, {} dex segments)",
        path.display(),
        entries.len(),
        entries.iter().filter(|e| e.is_dex_segment()).count()
    );

    Ok(ApkContents {
        fingerprint,
        size: data.len() as u64,
        entries,
    })
}

/// Read the uncompressed bytes of one named entry
pub fn read_entry(path: &Path, name: &str) -> Result<Vec<u8>> {
    let mut zip = ZipArchive::new(File::open(path)?).map_err(|e| invalid_apk(path, e))?;
    let mut entry = zip.by_name(name).map_err(|e| match e {
        ZipError::FileNotFound => invalid_apk(path, format!("missing entry {name}")),
        other => invalid_apk(path, other),
    })?;

    let mut content = Vec::new();
    entry
        .read_to_end(&mut content)
        .map_err(|e| invalid_apk(path, format!("{name}: {e}")))?;
    Ok(content)
}
