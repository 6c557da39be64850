// src/snapshot/mod.rs

//! What is installed on the device right now
//!
//! Two query tiers, chosen only by API level:
//!
//! - [`SnapshotTier::PackageDump`] (API < 28): `<pm> dump <pkg>` is free-form
//!   text; `versionCode=` and `codePath=` are scraped from it and the APKs
//!   are the `*.apk` files under `codePath`.
//! - [`SnapshotTier::PathQuery`] (API >= 28): `<pm> path <pkg>` prints one
//!   `package:<path>` line per APK.
//!
//! Both tiers then read sizes with a single `stat` call. Any unexpected
//! output is `DUMP_FAILED`; it is never retried.

use crate::apk::UnitName;
use crate::device::{API_PATH_QUERY, Device, shell_quote};
use crate::error::{Error, ErrorKind, Result};
use crate::session::Dialect;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotTier {
    PackageDump,
    PathQuery,
}

impl SnapshotTier {
    pub fn for_api(api_level: u32) -> Self {
        if api_level >= API_PATH_QUERY {
            Self::PathQuery
        } else {
            Self::PackageDump
        }
    }
}

/// One APK file installed on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArtifact {
    pub unit: UnitName,
    pub path: String,
    pub size: u64,
    /// Fingerprint of the installed file, when known from an install record
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub package: String,
    pub artifacts: Vec<RemoteArtifact>,
    /// Only the dump tier reports this
    pub version_code: Option<i64>,
    pub tier: SnapshotTier,
}

impl Snapshot {
    pub fn artifact(&self, unit: &UnitName) -> Option<&RemoteArtifact> {
        self.artifacts.iter().find(|a| &a.unit == unit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotResult {
    Found(Snapshot),
    PackageNotFound,
}

fn dump_failed(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::DumpFailed, message)
}

/// Capture the installed state of `package`
pub fn capture(device: &dyn Device, package: &str) -> Result<SnapshotResult> {
    let api = device.api_level();
    let dialect = Dialect::for_api(api);
    let tier = SnapshotTier::for_api(api);

    let found = match tier {
        SnapshotTier::PathQuery => query_paths(device, dialect, package)?,
        SnapshotTier::PackageDump => dump_package(device, dialect, package)?,
    };
    let Some((paths, version_code)) = found else {
        debug!("{} is not installed on {}", package, device.serial());
        return Ok(SnapshotResult::PackageNotFound);
    };

    let sizes = stat_sizes(device, &paths)?;
    let single = sizes.len() == 1;
    let mut artifacts = Vec::with_capacity(sizes.len());
    for (path, size) in sizes {
        artifacts.push(RemoteArtifact {
            unit: unit_for_remote_path(&path, single),
            path,
            size,
            fingerprint: None,
        });
    }
    artifacts.sort_by(|a, b| a.unit.cmp(&b.unit));

    debug!(
        "Snapshot of {}: {} APKs, version {:?}",
        package,
        artifacts.len(),
        version_code
    );
    Ok(SnapshotResult::Found(Snapshot {
        package: package.to_string(),
        artifacts,
        version_code,
        tier,
    }))
}

/// Process ids of the running app, empty when it is not running
pub fn live_processes(device: &dyn Device, package: &str) -> Result<Vec<u32>> {
    let out = device.exec(&format!("pidof {}", shell_quote(package)))?;
    if out.exit_code == 1 && out.stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    if !out.success() {
        return Err(dump_failed(format!(
            "pidof {package} exited with {}",
            out.exit_code
        )));
    }
    out.stdout
        .split_whitespace()
        .map(|pid| {
            pid.parse()
                .map_err(|_| dump_failed(format!("Unexpected pidof output: {pid}")))
        })
        .collect()
}

/// Tier B; None when the package is unknown
fn query_paths(
    device: &dyn Device,
    dialect: Dialect,
    package: &str,
) -> Result<Option<(Vec<String>, Option<i64>)>> {
    let out = device.exec(&format!("{} path {}", dialect.prefix(), shell_quote(package)))?;
    if out.stdout.trim().is_empty() {
        return Ok(None);
    }
    if !out.success() {
        return Err(dump_failed(format!(
            "path query exited with {}: {}",
            out.exit_code,
            out.stdout.trim()
        )));
    }

    let paths = out
        .lines()
        .map(|line| {
            line.strip_prefix("package:")
                .map(str::to_string)
                .ok_or_else(|| dump_failed(format!("Unexpected path output: {line}")))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Some((paths, None)))
}

/// Tier A; None when the dump has no section for the package
fn dump_package(
    device: &dyn Device,
    dialect: Dialect,
    package: &str,
) -> Result<Option<(Vec<String>, Option<i64>)>> {
    let out = device.exec(&format!("{} dump {}", dialect.prefix(), shell_quote(package)))?;
    if !out.success() {
        return Err(dump_failed(format!("dump exited with {}", out.exit_code)));
    }

    let Some(parsed) = parse_dump(&out.stdout, package) else {
        return Ok(None);
    };
    let code_path = parsed
        .code_path
        .ok_or_else(|| dump_failed(format!("dump of {package} has no codePath")))?;

    let pattern = if code_path.ends_with(".apk") {
        shell_quote(&code_path)
    } else {
        format!("{}/*.apk", shell_quote(code_path.trim_end_matches('/')))
    };
    Ok(Some((vec![pattern], parsed.version_code)))
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ParsedDump {
    code_path: Option<String>,
    version_code: Option<i64>,
}

/// Scrape the package section of `dump` output
///
/// Only the first `Package [<name>]` section counts; later sections may
/// describe hidden system copies of the same package.
fn parse_dump(text: &str, package: &str) -> Option<ParsedDump> {
    let header = format!("Package [{package}]");
    let mut lines = text.lines().skip_while(|line| !line.trim_start().starts_with(&header));
    lines.next()?;

    let mut parsed = ParsedDump::default();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.starts_with("Package [") {
            break;
        }
        if parsed.code_path.is_none()
            && let Some(path) = trimmed.strip_prefix("codePath=")
        {
            parsed.code_path = Some(path.to_string());
        }
        if parsed.version_code.is_none()
            && let Some(version) = field_value(trimmed, "versionCode=")
        {
            parsed.version_code = version.parse().ok();
        }
    }
    Some(parsed)
}

fn field_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.split_whitespace().find_map(|token| token.strip_prefix(key))
}

/// Sizes of the given paths (or globs) in one `stat` call
fn stat_sizes(device: &dyn Device, paths: &[String]) -> Result<Vec<(String, u64)>> {
    if paths.is_empty() {
        return Ok(Vec::new());
    }

    let args: Vec<String> = paths
        .iter()
        .map(|p| if p.contains('*') || p.starts_with('\'') { p.clone() } else { shell_quote(p) })
        .collect();
    let out = device.exec(&format!("stat -c '%s %n' {}", args.join(" ")))?;
    if !out.success() {
        return Err(dump_failed(format!(
            "stat exited with {}: {}",
            out.exit_code,
            out.stdout.trim()
        )));
    }

    let mut sizes: HashMap<String, u64> = HashMap::new();
    let mut order = Vec::new();
    for line in out.lines() {
        let (size, path) = line
            .split_once(' ')
            .ok_or_else(|| dump_failed(format!("Unexpected stat output: {line}")))?;
        let size: u64 = size
            .parse()
            .map_err(|_| dump_failed(format!("Unexpected stat size: {line}")))?;
        if sizes.insert(path.to_string(), size).is_none() {
            order.push(path.to_string());
        }
    }
    if order.is_empty() {
        return Err(dump_failed("stat reported no APK files"));
    }

    Ok(order
        .into_iter()
        .map(|path| {
            let size = sizes[&path];
            (path, size)
        })
        .collect())
}

fn unit_for_remote_path(path: &str, single: bool) -> UnitName {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    match UnitName::from_remote_file_name(file_name) {
        Some(unit) => unit,
        None if single => UnitName::Base,
        None => UnitName::Split(
            file_name
                .strip_suffix(".apk")
                .unwrap_or(file_name)
                .to_string(),
        ),
    }
}
