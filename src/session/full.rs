// src/session/full.rs

//! Full install delegate
//!
//! Used whenever a delta is not possible. Below API 21 a single APK goes
//! through `pm install`; everywhere else every unit is written to a fresh,
//! non-inheriting session.

use super::{CreateOptions, Dialect, InstallSession, parse_failure_code};
use crate::apk::PackageSpec;
use crate::device::{API_MULTI_APK, DEVICE_TMP, Device, shell_quote};
use crate::error::{Error, ErrorKind};
use std::fmt;
use tracing::info;

/// A rejected full install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallFailure {
    /// Device status token, e.g. `INSTALL_FAILED_VERSION_DOWNGRADE`
    pub status: String,
    pub message: String,
}

impl InstallFailure {
    pub fn new(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for InstallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl From<Error> for InstallFailure {
    fn from(err: Error) -> Self {
        let status = err
            .device_status()
            .map(str::to_string)
            .unwrap_or_else(|| err.kind().to_string());
        Self::new(status, err.message())
    }
}

/// Statuses naming one of our own kinds keep that kind; anything else is a
/// device rejection
impl From<InstallFailure> for Error {
    fn from(failure: InstallFailure) -> Self {
        match failure.status.parse::<ErrorKind>() {
            Ok(kind) if kind != ErrorKind::InstallFailed => Error::new(kind, failure.message),
            _ => Error::with_device_status(
                ErrorKind::InstallFailed,
                failure.status,
                failure.message,
            ),
        }
    }
}

/// Installs a whole package, replacing whatever is on the device
pub trait FullInstaller {
    fn install_full(&self, spec: &PackageSpec) -> Result<(), InstallFailure>;
}

/// Default full installer driving the device package manager
pub struct PackageManagerInstaller<'d> {
    device: &'d dyn Device,
}

impl<'d> PackageManagerInstaller<'d> {
    pub fn new(device: &'d dyn Device) -> Self {
        Self { device }
    }

    fn install_single_legacy(&self, spec: &PackageSpec) -> Result<(), InstallFailure> {
        let unit = &spec.units[0];
        let remote = format!("{DEVICE_TMP}/{}", unit.name.remote_file_name());

        self.device.exec(&format!("mkdir -p {DEVICE_TMP}")).map_err(Error::from)?;
        self.device.push(&unit.path, &remote).map_err(Error::from)?;
        let out = self
            .device
            .exec(&format!("pm install -r -t {}", shell_quote(&remote)))
            .map_err(Error::from);
        let _ = self.device.exec(&format!("rm -f {}", shell_quote(&remote)));
        let out = out?;

        if out.stdout.contains("Success") {
            return Ok(());
        }
        let status =
            parse_failure_code(&out.stdout).unwrap_or_else(|| "INSTALL_FAILED".to_string());
        Err(InstallFailure::new(status, out.stdout.trim()))
    }

    fn install_session(&self, spec: &PackageSpec) -> Result<(), InstallFailure> {
        let dialect = Dialect::for_api(self.device.api_level());
        let mut session = InstallSession::create(self.device, dialect, &CreateOptions::default())?;
        for unit in &spec.units {
            let size = unit.size()?;
            session.write(&unit.name, &unit.path, size)?;
        }
        session.commit()?;
        Ok(())
    }
}

impl FullInstaller for PackageManagerInstaller<'_> {
    fn install_full(&self, spec: &PackageSpec) -> Result<(), InstallFailure> {
        if spec.units.is_empty() {
            return Err(InstallFailure::new(
                "INSTALL_FAILED_INVALID_APK",
                "no APK files to install",
            ));
        }

        let api = self.device.api_level();
        info!(
            "Full install of {} ({} APKs, API {})",
            spec.app_id,
            spec.apk_count(),
            api
        );

        if api < API_MULTI_APK {
            if spec.apk_count() > 1 {
                return Err(InstallFailure::new(
                    ErrorKind::MultiApksNotSupportedBelow21.to_string(),
                    format!("API {api} cannot install split APKs"),
                ));
            }
            return self.install_single_legacy(spec);
        }
        self.install_session(spec)
    }
}
