// src/swap/mod.rs

//! Live code swap
//!
//! Patches a running process instead of reinstalling it:
//!
//! ```text
//! REQUESTED -> DUMPED -> DIFFED -> PREINSTALLED -> VERIFIED -> COMPARED -> SWAPPED
//!     \_________\__________\____________\_____________\___________\____> FAILED
//! ```
//!
//! Each stage records `<STAGE>:Success` or `<STAGE>:Failed`. The first failure
//! is terminal and the returned error names its stage. The preinstall stage
//! writes the changed APKs to a session only so the device validates them;
//! the session is always abandoned, never committed.

pub mod agent;

pub use agent::{
    AgentClient, AgentError, AttachRequest, ClassOutcome, HelperAgentClient, HelperInstaller,
    OverlaySegment, TransformMode,
};

use crate::apk::{ApkContents, PackageSpec, entries};
use crate::cache::{ArtifactCache, TransformCacheEntry};
use crate::device::{API_SWAP, DEVICE_TMP, Device, shell_quote};
use crate::diff::{DeltaBlocker, DiffEngine, DiffResult, PackageDiff, UnitDiff};
use crate::error::{Error, ErrorKind, Result};
use crate::metrics::MetricsLedger;
use crate::session::{CreateOptions, Dialect, InstallSession};
use crate::snapshot::{self, SnapshotResult};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Stages that emit metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwapStage {
    Dump,
    Diff,
    Preinstall,
    Verify,
    Compare,
    Swap,
}

impl SwapStage {
    pub const fn metric_name(self) -> &'static str {
        match self {
            Self::Dump => "DUMP",
            Self::Diff => "DIFF",
            Self::Preinstall => "PREINSTALL",
            Self::Verify => "VERIFY",
            Self::Compare => "COMPARE",
            Self::Swap => "SWAP",
        }
    }

    /// State reached when this stage succeeds
    pub const fn completed_state(self) -> SwapState {
        match self {
            Self::Dump => SwapState::Dumped,
            Self::Diff => SwapState::Diffed,
            Self::Preinstall => SwapState::Preinstalled,
            Self::Verify => SwapState::Verified,
            Self::Compare => SwapState::Compared,
            Self::Swap => SwapState::Swapped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapState {
    Requested,
    Dumped,
    Diffed,
    Preinstalled,
    Verified,
    Compared,
    Swapped,
    Failed,
}

impl SwapState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Swapped | Self::Failed)
    }

    pub fn can_transition_to(self, next: SwapState) -> bool {
        use SwapState::*;
        match (self, next) {
            (Swapped | Failed, _) => false,
            (_, Failed) => true,
            (Requested, Dumped)
            | (Dumped, Diffed)
            | (Diffed, Preinstalled)
            | (Preinstalled, Verified)
            | (Verified, Compared)
            | (Compared, Swapped) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapMode {
    /// Dex segments only; resource changes are rejected
    Code,
    /// Dex segments and resources; the activity is restarted
    Full,
}

/// Result of a successful swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapReport {
    pub package: String,
    pub pid: u32,
    pub redefined: Vec<String>,
    pub retransformed: Vec<String>,
    /// Nothing differed from the installed APKs, so nothing was attached
    pub no_changes: bool,
    pub state: SwapState,
}

/// A file collected for the overlay
#[derive(Debug)]
struct OverlayFile {
    /// Path relative to the overlay root
    relative: String,
    local: PathBuf,
}

/// Runs one swap against one device
pub struct SwapOrchestrator<'a> {
    device: &'a dyn Device,
    cache: &'a ArtifactCache,
    agent: &'a dyn AgentClient,
    helper: &'a HelperInstaller,
    state: SwapState,
}

impl<'a> SwapOrchestrator<'a> {
    pub fn new(
        device: &'a dyn Device,
        cache: &'a ArtifactCache,
        agent: &'a dyn AgentClient,
        helper: &'a HelperInstaller,
    ) -> Self {
        Self {
            device,
            cache,
            agent,
            helper,
            state: SwapState::Requested,
        }
    }

    pub fn state(&self) -> SwapState {
        self.state
    }

    /// Run every stage in order
    pub fn run(
        &mut self,
        spec: &PackageSpec,
        mode: SwapMode,
        metrics: &mut MetricsLedger,
    ) -> Result<SwapReport> {
        let api = self.device.api_level();
        if api < API_SWAP {
            return Err(Error::new(
                ErrorKind::CannotSwapBeforeApi26,
                format!("device {} runs API {api}", self.device.serial()),
            ));
        }

        info!("Swapping {} on {} ({:?})", spec.app_id, self.device.serial(), mode);

        let snapshot = self.stage(metrics, SwapStage::Dump, |this, _| {
            match snapshot::capture(this.device, &spec.app_id)? {
                SnapshotResult::Found(snapshot) => Ok(snapshot),
                SnapshotResult::PackageNotFound => Err(Error::new(
                    ErrorKind::DumpUnknownPackage,
                    format!("{} is not installed", spec.app_id),
                )),
            }
        })?;

        let diff = self.stage(metrics, SwapStage::Diff, |this, _| {
            let engine = DiffEngine::new(this.cache, this.device.serial());
            match engine.diff(spec, &snapshot.artifacts, snapshot.version_code)? {
                DiffResult::Delta(diff) => Ok(diff),
                DiffResult::CannotGenerateDelta(blocker @ DeltaBlocker::TopologyChanged { .. }) => {
                    Err(Error::new(ErrorKind::DifferentApkTopology, blocker.to_string()))
                }
                DiffResult::CannotGenerateDelta(blocker) => {
                    Err(Error::new(ErrorKind::DumpUnknownPackage, blocker.to_string()))
                }
            }
        })?;

        self.stage(metrics, SwapStage::Preinstall, |this, metrics| {
            this.preinstall(spec, &diff, metrics)
        })?;

        self.stage(metrics, SwapStage::Verify, |_, _| verify(&diff, mode))?;

        let (pid, staging, overlay) = self.stage(metrics, SwapStage::Compare, |this, _| {
            let pids = snapshot::live_processes(this.device, &spec.app_id)?;
            let pid = *pids.first().ok_or_else(|| {
                Error::new(
                    ErrorKind::DumpUnknownProcess,
                    format!("{} is not running", spec.app_id),
                )
            })?;
            let staging = tempfile::Builder::new().prefix("swapdeploy-overlay").tempdir()?;
            let overlay = collect_overlay(&diff, mode, staging.path())?;
            Ok((pid, staging, overlay))
        })?;

        let report = self.stage(metrics, SwapStage::Swap, |this, _| {
            this.swap(spec, mode, &diff, pid, &overlay)
        })?;
        drop(staging);

        for unit in diff.modified() {
            if let Some(contents) = &unit.local_contents {
                self.cache.store(contents)?;
            }
        }
        Ok(report)
    }

    fn advance(&mut self, next: SwapState) {
        if self.state.can_transition_to(next) {
            debug!("Swap state {:?} -> {:?}", self.state, next);
            self.state = next;
        } else {
            warn!("Ignoring swap transition {:?} -> {:?}", self.state, next);
        }
    }

    fn stage<T>(
        &mut self,
        metrics: &mut MetricsLedger,
        stage: SwapStage,
        f: impl FnOnce(&mut Self, &mut MetricsLedger) -> Result<T>,
    ) -> Result<T> {
        match f(self, metrics) {
            Ok(value) => {
                metrics.record_status(stage.metric_name(), "Success");
                self.advance(stage.completed_state());
                Ok(value)
            }
            Err(err) => {
                metrics.record_status(stage.metric_name(), "Failed");
                self.advance(SwapState::Failed);
                warn!("Swap failed at {}: {}", stage.metric_name(), err);
                Err(err.at_stage(stage))
            }
        }
    }
}

impl SwapOrchestrator<'_> {
    /// Write the modified units to a non-killing session and abandon it
    fn preinstall(
        &self,
        spec: &PackageSpec,
        diff: &PackageDiff,
        metrics: &mut MetricsLedger,
    ) -> Result<()> {
        let modified: Vec<&UnitDiff> = diff.modified().collect();
        if modified.is_empty() {
            debug!("Nothing to preinstall for {}", spec.app_id);
            return Ok(());
        }

        let options = CreateOptions {
            inherit_package: (diff.units.len() > modified.len()).then(|| spec.app_id.clone()),
            dont_kill: true,
        };
        let dialect = Dialect::for_api(self.device.api_level());
        let mut session =
            InstallSession::create(self.device, dialect, &options).map_err(preinstall_failed)?;

        let write = metrics.start("DELTAPREINSTALL_WRITE");
        for unit in &modified {
            session
                .write(&unit.name, &unit.local.path, unit.local_size)
                .map_err(preinstall_failed)?;
        }
        metrics.finish(write);

        session.abandon()
    }

    fn swap(
        &self,
        spec: &PackageSpec,
        mode: SwapMode,
        diff: &PackageDiff,
        pid: u32,
        overlay: &[OverlayFile],
    ) -> Result<SwapReport> {
        let segments: Vec<OverlaySegment> = diff
            .modified()
            .flat_map(|unit| {
                unit.changes
                    .iter()
                    .flat_map(|c| c.changed_segments.iter())
                    .map(move |segment| OverlaySegment {
                        unit: unit.name.clone(),
                        entry_name: segment.entry_name.clone(),
                        fingerprint: segment.fingerprint.clone(),
                    })
            })
            .collect();
        let resources: Vec<String> = match mode {
            SwapMode::Code => Vec::new(),
            SwapMode::Full => overlay
                .iter()
                .filter(|f| !segments.iter().any(|s| f.relative == segment_path(s)))
                .map(|f| f.relative.clone())
                .collect(),
        };

        let mut report = SwapReport {
            package: spec.app_id.clone(),
            pid,
            redefined: Vec::new(),
            retransformed: Vec::new(),
            no_changes: false,
            state: SwapState::Swapped,
        };
        if segments.is_empty() && resources.is_empty() {
            info!("{} matches the installed APKs, nothing to swap", spec.app_id);
            report.no_changes = true;
            return Ok(report);
        }

        self.helper.ensure(self.device)?;
        let overlay_dir = self.stage_overlay(&spec.app_id, overlay)?;

        let fingerprints: Vec<String> = segments.iter().map(|s| s.fingerprint.clone()).collect();
        let request = AttachRequest {
            package: spec.app_id.clone(),
            pid,
            overlay_dir,
            segments,
            resources,
            cached: self.cache.transforms_for_segments(&fingerprints)?,
            restart_activity: mode == SwapMode::Full,
        };
        debug!(
            "Attaching to {} (pid {}) with {} segments, {} cached transforms",
            request.package,
            pid,
            request.segments.len(),
            request.cached.len()
        );

        let outcomes = self
            .agent
            .attach(&request)
            .map_err(|e| Error::new(ErrorKind::AgentAttachFailed, e.to_string()))?;

        for outcome in outcomes {
            if let Some(instrumented_ref) = &outcome.instrumented_ref {
                self.cache.store_transform(&TransformCacheEntry::new(
                    outcome.class_name.clone(),
                    outcome.segment_fingerprint.clone(),
                    instrumented_ref.clone(),
                ))?;
            }
            match outcome.mode {
                TransformMode::Redefined => report.redefined.push(outcome.class_name),
                TransformMode::Retransformed => report.retransformed.push(outcome.class_name),
            }
        }

        info!(
            "Swapped {}: {} redefined, {} retransformed",
            spec.app_id,
            report.redefined.len(),
            report.retransformed.len()
        );
        Ok(report)
    }

    /// Push the overlay and copy it into the app's code cache
    ///
    /// Returns the absolute overlay directory as the app sees it.
    fn stage_overlay(&self, package: &str, overlay: &[OverlayFile]) -> Result<String> {
        let uid = uuid::Uuid::new_v4().simple().to_string();
        let remote_root = format!("{DEVICE_TMP}/{uid}");

        let mut dirs: Vec<String> = overlay
            .iter()
            .map(|f| match f.relative.rsplit_once('/') {
                Some((parent, _)) => format!("{remote_root}/{parent}"),
                None => remote_root.clone(),
            })
            .collect();
        dirs.sort();
        dirs.dedup();
        let quoted: Vec<String> = dirs.iter().map(|d| shell_quote(d)).collect();
        self.device.exec(&format!("mkdir -p {}", quoted.join(" ")))?;

        for file in overlay {
            self.device
                .push(&file.local, &format!("{remote_root}/{}", file.relative))?;
        }

        let app_dir = format!("code_cache/.swapdeploy/{uid}");
        let copied = self
            .run_as(package, &format!("mkdir -p {app_dir}"))
            .and_then(|_| self.run_as(package, &format!("cp -r {remote_root}/. {app_dir}/")));
        let _ = self.device.exec(&format!("rm -rf {}", shell_quote(&remote_root)));
        copied?;

        Ok(format!("/data/data/{package}/{app_dir}"))
    }

    fn run_as(&self, package: &str, command: &str) -> Result<()> {
        let out = self
            .device
            .exec(&format!("run-as {} {}", shell_quote(package), command))?;
        if out.success() {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::AgentAttachFailed,
                format!("run-as {package} {command}: {}", out.stdout.trim()),
            ))
        }
    }
}

fn preinstall_failed(err: Error) -> Error {
    match err.kind() {
        ErrorKind::SessionCreateFailed | ErrorKind::SessionWriteFailed => {
            Error::new(ErrorKind::PreinstallFailed, err.to_string())
        }
        _ => err,
    }
}

/// Reject changes a live swap cannot apply
fn verify(diff: &PackageDiff, mode: SwapMode) -> Result<()> {
    for unit in diff.modified() {
        let Some(changes) = &unit.changes else {
            continue;
        };
        if !changes.remote_known {
            return Err(Error::new(
                ErrorKind::RemoteApkNotFoundInDb,
                format!("no cached record of the installed {}", unit.name),
            ));
        }
        if changes.manifest_changed {
            return Err(Error::new(
                ErrorKind::CannotSwapManifest,
                format!("manifest of {} changed", unit.name),
            ));
        }
        if mode == SwapMode::Code && !changes.changed_resources.is_empty() {
            return Err(Error::new(
                ErrorKind::CannotSwapResource,
                format!(
                    "{} resources of {} changed (first: {})",
                    changes.changed_resources.len(),
                    unit.name,
                    changes.changed_resources[0]
                ),
            ));
        }
    }
    Ok(())
}

fn segment_path(segment: &OverlaySegment) -> String {
    format!("{}/{}", segment.unit.remote_file_name(), segment.entry_name)
}

/// Extract the content to ship into `staging`
fn collect_overlay(diff: &PackageDiff, mode: SwapMode, staging: &Path) -> Result<Vec<OverlayFile>> {
    let mut files = Vec::new();
    for unit in diff.modified() {
        let Some(changes) = &unit.changes else {
            continue;
        };

        let mut names: Vec<&str> = changes
            .changed_segments
            .iter()
            .map(|s| s.entry_name.as_str())
            .collect();
        if mode == SwapMode::Full {
            let present = |name: &&String| {
                unit.local_contents
                    .as_ref()
                    .is_some_and(|c: &ApkContents| c.entry(name).is_some())
            };
            names.extend(changes.changed_resources.iter().filter(present).map(String::as_str));
        }

        for name in names {
            let relative = format!("{}/{}", unit.name.remote_file_name(), name);
            let local = staging.join(&relative);
            if let Some(parent) = local.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&local, entries::read_entry(&unit.local.path, name)?)?;
            files.push(OverlayFile { relative, local });
        }
    }
    Ok(files)
}
