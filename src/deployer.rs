// src/deployer.rs

//! Top-level install and swap requests
//!
//! [`Deployer::install`] tries a delta first and falls back to a full
//! install whenever a delta is not applicable:
//!
//! | Condition | Metric |
//! |-----------|--------|
//! | `force_full_install` | `DELTAINSTALL:DISABLED` |
//! | API < 24 | `DELTAINSTALL:API_NOT_SUPPORTED` |
//! | package not installed | `DELTAINSTALL:DUMP_UNKNOWN_PACKAGE` |
//! | units added or removed | `DELTAINSTALL:CANNOT_GENERATE_DELTA` |
//! | downgrade confirmed, app uninstalled | `DELTAINSTALL:DOWNGRADE` |
//!
//! A requested version below the installed one is confirmed once, before
//! any of these checks, whatever the API level. A delta that reaches the
//! device and fails is terminal; it is never retried as a full install.
//! Every request holds the device lock for its whole duration and appends
//! to one [`MetricsLedger`].

use crate::apk::PackageSpec;
use crate::cache::{ArtifactCache, InstallRecord};
use crate::config::DeployerOptions;
use crate::db::paths;
use crate::device::{API_DELTA_INSTALL, API_MULTI_APK, Device, shell_quote};
use crate::diff::{DiffEngine, DiffResult, PackageDiff};
use crate::error::{Error, ErrorKind, Result};
use crate::lock::DeviceLock;
use crate::metrics::MetricsLedger;
use crate::session::{self, Dialect, FullInstaller};
use crate::snapshot::{self, SnapshotResult};
use crate::swap::{AgentClient, HelperInstaller, SwapMode, SwapOrchestrator, SwapReport};
use crate::ui::UiService;
use strum_macros::IntoStaticStr;
use tracing::{debug, info, warn};

/// Why the delta path was not taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DeltaSkipReason {
    Disabled,
    ApiNotSupported,
    DumpUnknownPackage,
    CannotGenerateDelta,
    Downgrade,
}

impl DeltaSkipReason {
    /// Status of the `DELTAINSTALL` event
    pub fn metric_status(self) -> &'static str {
        self.into()
    }
}

/// How a successful install reached the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Only modified units were written to an inheriting session
    DeltaInstalled,
    FullInstalled { reason: DeltaSkipReason },
    /// Everything already matched; the app was only restarted
    Skipped,
}

/// Outcome of the delta attempt
enum DeltaAttempt {
    Done(InstallOutcome),
    Fallback(DeltaSkipReason),
}

/// Orchestrates installs and swaps against one device
pub struct Deployer<'a> {
    device: &'a dyn Device,
    cache: &'a ArtifactCache,
    ui: &'a dyn UiService,
    installer: &'a dyn FullInstaller,
    options: DeployerOptions,
    metrics: MetricsLedger,
}

impl<'a> Deployer<'a> {
    pub fn new(
        device: &'a dyn Device,
        cache: &'a ArtifactCache,
        ui: &'a dyn UiService,
        installer: &'a dyn FullInstaller,
        options: DeployerOptions,
    ) -> Self {
        Self {
            device,
            cache,
            ui,
            installer,
            options,
            metrics: MetricsLedger::new(),
        }
    }

    pub fn options(&self) -> &DeployerOptions {
        &self.options
    }

    /// Events recorded so far, including those of a failed request
    pub fn metrics(&self) -> &MetricsLedger {
        &self.metrics
    }

    pub fn into_metrics(self) -> MetricsLedger {
        self.metrics
    }

    /// Install the package, by delta when possible
    pub fn install(&mut self, spec: &PackageSpec) -> Result<InstallOutcome> {
        let _lock = self.lock()?;
        self.log_session("install", spec);

        let recorded = self
            .cache
            .installed_version(self.device.serial(), &spec.app_id)?;
        let mut asked = false;
        if let (Some(requested), Some(installed)) = (spec.version_code, recorded)
            && requested < installed
        {
            asked = true;
            if self.confirm_downgrade(spec, requested, installed)? {
                return self.fall_back(spec, DeltaSkipReason::Downgrade);
            }
        }

        match self.try_delta(spec, recorded, asked)? {
            DeltaAttempt::Done(outcome) => Ok(outcome),
            DeltaAttempt::Fallback(reason) => self.fall_back(spec, reason),
        }
    }

    fn fall_back(
        &mut self,
        spec: &PackageSpec,
        reason: DeltaSkipReason,
    ) -> Result<InstallOutcome> {
        info!(
            "Delta install of {} not possible ({}), installing in full",
            spec.app_id,
            reason.metric_status()
        );
        self.metrics
            .record_status("DELTAINSTALL", reason.metric_status());
        self.full_install(spec)?;
        Ok(InstallOutcome::FullInstalled { reason })
    }

    /// Swap changed dex segments into the running app
    pub fn code_swap(
        &mut self,
        spec: &PackageSpec,
        agent: &dyn AgentClient,
        helper: &HelperInstaller,
    ) -> Result<SwapReport> {
        self.swap(spec, SwapMode::Code, agent, helper)
    }

    /// Swap dex segments and resources, then restart the activity
    pub fn full_swap(
        &mut self,
        spec: &PackageSpec,
        agent: &dyn AgentClient,
        helper: &HelperInstaller,
    ) -> Result<SwapReport> {
        self.swap(spec, SwapMode::Full, agent, helper)
    }

    /// Read what the device has installed for `package`
    pub fn dump(&self, package: &str) -> Result<SnapshotResult> {
        let _lock = self.lock()?;
        snapshot::capture(self.device, package)
    }

    fn swap(
        &mut self,
        spec: &PackageSpec,
        mode: SwapMode,
        agent: &dyn AgentClient,
        helper: &HelperInstaller,
    ) -> Result<SwapReport> {
        let _lock = self.lock()?;
        self.log_session(
            match mode {
                SwapMode::Code => "codeswap",
                SwapMode::Full => "fullswap",
            },
            spec,
        );

        let mut orchestrator = SwapOrchestrator::new(self.device, self.cache, agent, helper);
        orchestrator.run(spec, mode, &mut self.metrics)
    }

    fn lock(&self) -> Result<DeviceLock> {
        DeviceLock::acquire(paths::device_lock(
            &self.options.cache_path,
            self.device.serial(),
        ))
    }

    fn log_session(&self, request: &str, spec: &PackageSpec) {
        let session_id = uuid::Uuid::new_v4();
        info!(
            "Deploy session {}: {} {} ({} APKs) on {} (API {})",
            session_id,
            request,
            spec.app_id,
            spec.apk_count(),
            self.device.serial(),
            self.device.api_level()
        );
    }

    /// `asked` is true when the downgrade question was already put to the user
    fn try_delta(
        &mut self,
        spec: &PackageSpec,
        recorded: Option<i64>,
        asked: bool,
    ) -> Result<DeltaAttempt> {
        if self.options.force_full_install {
            return Ok(DeltaAttempt::Fallback(DeltaSkipReason::Disabled));
        }
        if self.device.api_level() < API_DELTA_INSTALL {
            return Ok(DeltaAttempt::Fallback(DeltaSkipReason::ApiNotSupported));
        }

        let snapshot = match snapshot::capture(self.device, &spec.app_id)? {
            SnapshotResult::Found(snapshot) => snapshot,
            SnapshotResult::PackageNotFound => {
                return Ok(DeltaAttempt::Fallback(DeltaSkipReason::DumpUnknownPackage));
            }
        };

        let installed_version = snapshot.version_code.max(recorded);
        if !asked
            && let (Some(requested), Some(installed)) = (spec.version_code, installed_version)
            && requested < installed
            && self.confirm_downgrade(spec, requested, installed)?
        {
            return Ok(DeltaAttempt::Fallback(DeltaSkipReason::Downgrade));
        }

        let engine = DiffEngine::new(self.cache, self.device.serial());
        let diff = match engine.diff(spec, &snapshot.artifacts, installed_version)? {
            DiffResult::Delta(diff) => diff,
            DiffResult::CannotGenerateDelta(blocker) => {
                debug!("No delta for {}: {}", spec.app_id, blocker);
                return Ok(DeltaAttempt::Fallback(DeltaSkipReason::CannotGenerateDelta));
            }
        };

        if diff.is_noop() {
            self.skip_install(spec)?;
            return Ok(DeltaAttempt::Done(InstallOutcome::Skipped));
        }

        match session::delta_install(self.device, spec, &diff, &mut self.metrics) {
            Ok(()) => {
                self.metrics.record_status("DELTAINSTALL", "SUCCESS");
                self.remember_delta(spec, &diff)?;
                info!("Delta installed {}", spec.app_id);
                Ok(DeltaAttempt::Done(InstallOutcome::DeltaInstalled))
            }
            Err(err) => {
                let code = err
                    .device_status()
                    .map(str::to_string)
                    .unwrap_or_else(|| err.kind().to_string());
                self.metrics
                    .record_status("DELTAINSTALL", format!("ERROR.{code}"));
                warn!("Delta install of {} failed: {}", spec.app_id, err);
                Err(err)
            }
        }
    }

    /// Ask once whether to uninstall before a downgrade
    ///
    /// Returns true when the app was uninstalled and a full install must follow.
    fn confirm_downgrade(
        &mut self,
        spec: &PackageSpec,
        requested: i64,
        installed: i64,
    ) -> Result<bool> {
        let question = format!(
            "{} version {} is installed but {} was requested. Uninstall the app first? \
             This deletes its data.",
            spec.app_id, installed, requested
        );
        if !self.ui.prompt(&question) {
            info!("Keeping installed {}, the device decides on the downgrade", spec.app_id);
            return Ok(false);
        }

        let dialect = Dialect::for_api(self.device.api_level());
        let out = self.device.exec(&format!(
            "{} uninstall {}",
            dialect.prefix(),
            shell_quote(&spec.app_id)
        ))?;
        if out.stdout.contains("Success") {
            self.metrics.record_status("UNINSTALL", "OK");
        } else {
            warn!("Uninstall of {} failed: {}", spec.app_id, out.stdout.trim());
            self.metrics.record_status("UNINSTALL", "FAILED");
        }
        self.cache
            .forget_install(self.device.serial(), &spec.app_id)?;
        Ok(true)
    }

    fn skip_install(&mut self, spec: &PackageSpec) -> Result<()> {
        info!("{} is up to date, restarting it", spec.app_id);
        let out = self
            .device
            .exec(&format!("am force-stop {}", shell_quote(&spec.app_id)))?;
        if !out.success() {
            warn!("force-stop of {} exited with {}", spec.app_id, out.exit_code);
        }
        self.metrics.record_status("INSTALL", "SKIPPED_INSTALL");
        Ok(())
    }

    fn full_install(&mut self, spec: &PackageSpec) -> Result<()> {
        let api = self.device.api_level();
        if api < API_MULTI_APK && spec.apk_count() > 1 {
            let kind = ErrorKind::MultiApksNotSupportedBelow21;
            self.metrics.record_status("INSTALL", kind.to_string());
            return Err(Error::new(
                kind,
                format!(
                    "{} has {} APKs but API {} installs only one",
                    spec.app_id,
                    spec.apk_count(),
                    api
                ),
            ));
        }

        if let Err(failure) = self.installer.install_full(spec) {
            warn!("Full install of {} failed: {}", spec.app_id, failure);
            self.metrics.record_status("INSTALL", failure.status.clone());
            return Err(failure.into());
        }
        self.metrics.record_status("INSTALL", "OK");
        info!("Installed {}", spec.app_id);

        let version_code = self.version_to_record(spec)?;
        let mut records = Vec::with_capacity(spec.units.len());
        for unit in &spec.units {
            let contents = self.cache.analyze(&unit.path)?;
            self.cache.store(&contents)?;
            records.push(InstallRecord {
                serial: self.device.serial().to_string(),
                package: spec.app_id.clone(),
                unit: unit.name.clone(),
                fingerprint: contents.fingerprint.to_string(),
                size: contents.size,
                version_code,
            });
        }
        self.cache
            .replace_installs(self.device.serial(), &spec.app_id, &records)
    }

    /// Version stored with install records, never below the one already recorded
    fn version_to_record(&self, spec: &PackageSpec) -> Result<Option<i64>> {
        let recorded = self
            .cache
            .installed_version(self.device.serial(), &spec.app_id)?;
        Ok(spec.version_code.max(recorded))
    }

    fn remember_delta(&self, spec: &PackageSpec, diff: &PackageDiff) -> Result<()> {
        let version_code = self.version_to_record(spec)?;
        let mut records = Vec::with_capacity(diff.units.len());
        for unit in &diff.units {
            if let Some(contents) = &unit.local_contents {
                self.cache.store(contents)?;
            }
            records.push(InstallRecord {
                serial: self.device.serial().to_string(),
                package: spec.app_id.clone(),
                unit: unit.name.clone(),
                fingerprint: unit.local_fingerprint.to_string(),
                size: unit.local_size,
                version_code,
            });
        }
        self.cache
            .replace_installs(self.device.serial(), &spec.app_id, &records)
    }
}
