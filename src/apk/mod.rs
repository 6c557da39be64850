// src/apk/mod.rs

//! Local package description and APK content analysis
//!
//! A [`PackageSpec`] names the application and its ordered local APK files.
//! The first file is always the base unit; every other file is a split named
//! after its file stem. [`analyze`](entries::analyze) turns an APK into the
//! entry table the diff engine and the cache work from.

pub mod entries;

pub use entries::{ApkContents, EntryRecord, MANIFEST_ENTRY, analyze, is_dex_segment};

use crate::error::{Error, Result};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Logical name of one installable APK file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnitName {
    Base,
    Split(String),
}

impl UnitName {
    /// Name of this unit as installed on the device (`base.apk`, `split_<name>.apk`)
    pub fn remote_file_name(&self) -> String {
        match self {
            Self::Base => "base.apk".to_string(),
            Self::Split(name) => format!("split_{name}.apk"),
        }
    }

    /// Recover a unit name from an installed file name
    pub fn from_remote_file_name(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(".apk")?;
        if stem == "base" {
            return Some(Self::Base);
        }
        stem.strip_prefix("split_")
            .filter(|name| !name.is_empty())
            .map(|name| Self::Split(name.to_string()))
    }

    /// Key used for install records
    pub fn as_key(&self) -> String {
        match self {
            Self::Base => "base".to_string(),
            Self::Split(name) => format!("split:{name}"),
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "base" => Some(Self::Base),
            _ => key
                .strip_prefix("split:")
                .filter(|name| !name.is_empty())
                .map(|name| Self::Split(name.to_string())),
        }
    }
}

impl fmt::Display for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base => write!(f, "base"),
            Self::Split(name) => write!(f, "split {name}"),
        }
    }
}

/// One local APK file and the unit it provides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUnit {
    pub name: UnitName,
    pub path: PathBuf,
}

impl LocalUnit {
    /// File size on disk
    pub fn size(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }
}

/// The desired package image for one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub app_id: String,
    pub units: Vec<LocalUnit>,
    /// Version code being deployed, when known
    pub version_code: Option<i64>,
}

impl PackageSpec {
    /// Build a package from ordered local paths
    ///
    /// Two paths that resolve to the same unit name are rejected.
    pub fn new(app_id: impl Into<String>, paths: &[PathBuf]) -> Result<Self> {
        let mut units = Vec::with_capacity(paths.len());
        let mut seen = HashSet::new();

        for (index, path) in paths.iter().enumerate() {
            let name = if index == 0 {
                UnitName::Base
            } else {
                split_name_for(path)?
            };
            if !seen.insert(name.clone()) {
                return Err(Error::InvalidApk {
                    path: path.clone(),
                    reason: format!("duplicate unit {name}"),
                });
            }
            units.push(LocalUnit {
                name,
                path: path.clone(),
            });
        }

        Ok(Self {
            app_id: app_id.into(),
            units,
            version_code: None,
        })
    }

    pub fn with_version_code(mut self, version_code: i64) -> Self {
        self.version_code = Some(version_code);
        self
    }

    pub fn unit(&self, name: &UnitName) -> Option<&LocalUnit> {
        self.units.iter().find(|u| &u.name == name)
    }

    /// Number of APK files
    pub fn apk_count(&self) -> usize {
        self.units.len()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.units.iter().map(|u| u.path.as_path())
    }
}

fn split_name_for(path: &Path) -> Result<UnitName> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidApk {
            path: path.to_path_buf(),
            reason: "path has no usable file name".to_string(),
        })?;
    let name = stem.strip_prefix("split_").unwrap_or(stem);
    Ok(UnitName::Split(name.to_string()))
}
