// src/diff/mod.rs

//! Compare the desired package against what the device has
//!
//! Units are matched by logical name. Any added or removed unit changes the
//! package topology, which no delta can express, so the whole diff becomes
//! [`DiffResult::CannotGenerateDelta`]. Matched units are UNCHANGED when the
//! local fingerprint equals the one this cache last installed (and the
//! remote size still agrees); otherwise they are MODIFIED and compared entry
//! by entry against the previous revision's cached entry table.

use crate::apk::{self, ApkContents, LocalUnit, PackageSpec, UnitName};
use crate::cache::ArtifactCache;
use crate::error::Result;
use crate::hash::{self, Fingerprint};
use crate::snapshot::RemoteArtifact;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

/// Why no delta can be produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaBlocker {
    /// The device has no APKs for the package
    NoInstalledArtifacts,
    /// Units were added or removed
    TopologyChanged {
        added: Vec<UnitName>,
        removed: Vec<UnitName>,
    },
}

impl fmt::Display for DeltaBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |units: &[UnitName]| {
            units
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            Self::NoInstalledArtifacts => write!(f, "no installed APKs"),
            Self::TopologyChanged { added, removed } => write!(
                f,
                "APK topology changed (added: [{}], removed: [{}])",
                join(added),
                join(removed)
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Unchanged,
    Modified,
}

/// A dex segment whose content is new relative to the previous revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentChange {
    pub entry_name: String,
    pub fingerprint: String,
}

/// What changed inside a MODIFIED unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentChanges {
    pub changed_segments: Vec<SegmentChange>,
    /// Segment entry names present before and gone now
    pub removed_segments: Vec<String>,
    /// Non-dex, non-manifest entries added, removed or rewritten
    pub changed_resources: Vec<String>,
    pub manifest_changed: bool,
    /// False when the previous revision's entry table was not in the cache
    pub remote_known: bool,
}

impl ContentChanges {
    pub fn is_empty(&self) -> bool {
        self.changed_segments.is_empty()
            && self.removed_segments.is_empty()
            && self.changed_resources.is_empty()
            && !self.manifest_changed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDiff {
    pub name: UnitName,
    pub status: UnitStatus,
    pub local: LocalUnit,
    pub local_fingerprint: Fingerprint,
    pub local_size: u64,
    /// Remote artifact, with its fingerprint filled in when an install record vouches for it
    pub remote: RemoteArtifact,
    /// Analyzed local content, MODIFIED units only
    pub local_contents: Option<ApkContents>,
    /// MODIFIED units only
    pub changes: Option<ContentChanges>,
}

/// Per-unit classification of an applicable delta
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDiff {
    pub units: Vec<UnitDiff>,
    /// Identical content at a lower version than the installed one
    pub downgrade: bool,
}

impl PackageDiff {
    pub fn modified(&self) -> impl Iterator<Item = &UnitDiff> {
        self.units.iter().filter(|u| u.status == UnitStatus::Modified)
    }

    pub fn unchanged(&self) -> impl Iterator<Item = &UnitDiff> {
        self.units.iter().filter(|u| u.status == UnitStatus::Unchanged)
    }

    pub fn unit(&self, name: &UnitName) -> Option<&UnitDiff> {
        self.units.iter().find(|u| &u.name == name)
    }

    /// Nothing to send: every unit unchanged and not a downgrade
    pub fn is_noop(&self) -> bool {
        !self.downgrade && self.modified().next().is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffResult {
    CannotGenerateDelta(DeltaBlocker),
    Delta(PackageDiff),
}

/// Diff engine bound to one cache and one device
pub struct DiffEngine<'c> {
    cache: &'c ArtifactCache,
    serial: String,
}

impl<'c> DiffEngine<'c> {
    pub fn new(cache: &'c ArtifactCache, serial: impl Into<String>) -> Self {
        Self {
            cache,
            serial: serial.into(),
        }
    }

    pub fn diff(
        &self,
        spec: &PackageSpec,
        remote: &[RemoteArtifact],
        installed_version: Option<i64>,
    ) -> Result<DiffResult> {
        if remote.is_empty() {
            return Ok(DiffResult::CannotGenerateDelta(
                DeltaBlocker::NoInstalledArtifacts,
            ));
        }

        let remote_by_name: HashMap<&UnitName, &RemoteArtifact> =
            remote.iter().map(|r| (&r.unit, r)).collect();
        let local_names: HashSet<&UnitName> = spec.units.iter().map(|u| &u.name).collect();

        let added: Vec<UnitName> = spec
            .units
            .iter()
            .filter(|u| !remote_by_name.contains_key(&u.name))
            .map(|u| u.name.clone())
            .collect();
        let removed: Vec<UnitName> = remote
            .iter()
            .filter(|r| !local_names.contains(&r.unit))
            .map(|r| r.unit.clone())
            .collect();
        if !added.is_empty() || !removed.is_empty() {
            debug!(
                "Topology of {} changed: {} added, {} removed",
                spec.app_id,
                added.len(),
                removed.len()
            );
            return Ok(DiffResult::CannotGenerateDelta(
                DeltaBlocker::TopologyChanged { added, removed },
            ));
        }

        let mut units = Vec::with_capacity(spec.units.len());
        for local in &spec.units {
            let remote = remote_by_name[&local.name];
            units.push(self.diff_unit(spec, local, remote)?);
        }

        let downgrade = units.iter().all(|u| u.status == UnitStatus::Unchanged)
            && matches!(
                (installed_version, spec.version_code),
                (Some(installed), Some(requested)) if installed > requested
            );

        Ok(DiffResult::Delta(PackageDiff { units, downgrade }))
    }

    fn diff_unit(
        &self,
        spec: &PackageSpec,
        local: &LocalUnit,
        remote: &RemoteArtifact,
    ) -> Result<UnitDiff> {
        let local_fingerprint = hash::fingerprint_file(self.cache.algorithm(), &local.path)?;
        let local_size = local.size()?;

        let mut remote = remote.clone();
        if remote.fingerprint.is_none() {
            remote.fingerprint = self
                .cache
                .installed_unit(&self.serial, &spec.app_id, &local.name)?
                .filter(|record| record.size == remote.size)
                .map(|record| record.fingerprint);
        }

        if remote.fingerprint.as_deref() == Some(local_fingerprint.to_string().as_str()) {
            debug!("{} of {} is unchanged", local.name, spec.app_id);
            return Ok(UnitDiff {
                name: local.name.clone(),
                status: UnitStatus::Unchanged,
                local: local.clone(),
                local_fingerprint,
                local_size,
                remote,
                local_contents: None,
                changes: None,
            });
        }

        let local_contents = match self.cache.lookup(&local_fingerprint)? {
            Some(cached) => cached,
            None => apk::analyze(self.cache.algorithm(), &local.path)?,
        };
        let previous = match remote.fingerprint.as_deref().map(Fingerprint::parse) {
            Some(Ok(fingerprint)) => self.cache.lookup(&fingerprint)?,
            _ => None,
        };
        let changes = compare_contents(&local_contents, previous.as_ref());

        debug!(
            "{} of {} is modified: {} segments, {} resources, manifest {}",
            local.name,
            spec.app_id,
            changes.changed_segments.len(),
            changes.changed_resources.len(),
            changes.manifest_changed
        );

        Ok(UnitDiff {
            name: local.name.clone(),
            status: UnitStatus::Modified,
            local: local.clone(),
            local_fingerprint,
            local_size,
            remote,
            local_contents: Some(local_contents),
            changes: Some(changes),
        })
    }
}

/// Entry-by-entry comparison against the previous revision
pub fn compare_contents(local: &ApkContents, previous: Option<&ApkContents>) -> ContentChanges {
    let Some(previous) = previous else {
        return ContentChanges {
            changed_segments: local
                .segments()
                .map(|e| SegmentChange {
                    entry_name: e.name.clone(),
                    fingerprint: e.segment_fingerprint.clone().unwrap_or_default(),
                })
                .collect(),
            remote_known: false,
            ..ContentChanges::default()
        };
    };

    let previous_segments: HashSet<&str> = previous
        .segments()
        .filter_map(|e| e.segment_fingerprint.as_deref())
        .collect();
    let changed_segments = local
        .segments()
        .filter_map(|e| {
            let fingerprint = e.segment_fingerprint.as_deref()?;
            (!previous_segments.contains(fingerprint)).then(|| SegmentChange {
                entry_name: e.name.clone(),
                fingerprint: fingerprint.to_string(),
            })
        })
        .collect();
    let removed_segments = previous
        .segments()
        .filter(|e| local.entry(&e.name).is_none_or(|l| !l.is_dex_segment()))
        .map(|e| e.name.clone())
        .collect();

    let mut changed_resources: Vec<String> = local
        .resources()
        .filter(|e| {
            previous
                .entry(&e.name)
                .is_none_or(|p| p.crc32 != e.crc32 || p.size != e.size)
        })
        .map(|e| e.name.clone())
        .collect();
    changed_resources.extend(
        previous
            .resources()
            .filter(|e| local.entry(&e.name).is_none())
            .map(|e| e.name.clone()),
    );

    let manifest_changed = match (
        local.entry(apk::MANIFEST_ENTRY),
        previous.entry(apk::MANIFEST_ENTRY),
    ) {
        (Some(l), Some(p)) => l.crc32 != p.crc32 || l.size != p.size,
        (None, None) => false,
        _ => true,
    };

    ContentChanges {
        changed_segments,
        removed_segments,
        changed_resources,
        manifest_changed,
        remote_known: true,
    }
}
