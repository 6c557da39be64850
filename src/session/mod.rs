// src/session/mod.rs

//! Install session protocol
//!
//! A session moves through create, zero or more writes, then exactly one
//! commit or abandon:
//!
//! ```text
//! Created ──write──> Writing ──write──> Writing
//!    │                  │
//!    ├──commit──────────┴──commit──> Committed
//!    └──abandon─────────┴─abandon──> Abandoned
//! ```
//!
//! A session dropped before reaching a terminal state (early return, device
//! timeout) is abandoned best-effort so the device never keeps a half-written
//! session around.

pub mod delta_install;
pub mod full;

pub use delta_install::delta_install;
pub use full::{FullInstaller, InstallFailure, PackageManagerInstaller};

use crate::apk::UnitName;
use crate::device::{API_DELTA_INSTALL, DEVICE_TMP, Device, DeviceError, shell_quote};
use crate::error::{Error, ErrorKind, Result};
use std::path::Path;
use tracing::{debug, info, warn};

/// Package manager command family, chosen once from the API level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `pm ...`
    Legacy,
    /// `cmd package ...`
    Modern,
}

impl Dialect {
    pub fn for_api(api_level: u32) -> Self {
        if api_level >= API_DELTA_INSTALL {
            Self::Modern
        } else {
            Self::Legacy
        }
    }

    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Legacy => "pm",
            Self::Modern => "cmd package",
        }
    }

    pub const fn supports_dont_kill(self) -> bool {
        matches!(self, Self::Modern)
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Writing,
    Committed,
    Abandoned,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Abandoned)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Writing)
                | (Created, Committed)
                | (Created, Abandoned)
                | (Writing, Writing)
                | (Writing, Committed)
                | (Writing, Abandoned)
        )
    }
}

/// Flags for `install-create`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Keep units of the installed package that this session does not write (`-p`)
    pub inherit_package: Option<String>,
    /// Do not kill the running app when the session is committed
    pub dont_kill: bool,
}

/// An open session on one device
pub struct InstallSession<'d> {
    device: &'d dyn Device,
    dialect: Dialect,
    id: String,
    state: SessionState,
}

impl<'d> InstallSession<'d> {
    /// Create a session on the device
    pub fn create(
        device: &'d dyn Device,
        dialect: Dialect,
        options: &CreateOptions,
    ) -> Result<Self> {
        let mut command = format!("{} install-create -t -r", dialect.prefix());
        if let Some(package) = &options.inherit_package {
            command.push_str(&format!(" -p {}", shell_quote(package)));
        }
        if options.dont_kill && dialect.supports_dont_kill() {
            command.push_str(" --dont-kill");
        }

        let out = device.exec(&command)?;
        let id = parse_session_id(&out.stdout)
            .filter(|_| out.success())
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::SessionCreateFailed,
                    format!("install-create failed: {}", out.stdout.trim()),
                )
            })?;

        let session = Self {
            device,
            dialect,
            id,
            state: SessionState::Created,
        };
        device.exec(&format!("mkdir -p {DEVICE_TMP}"))?;
        debug!("Created install session {} on {}", session.id, device.serial());
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::new(
                ErrorKind::InternalError,
                format!(
                    "Invalid session transition {:?} -> {:?} for session {}",
                    self.state, next, self.id
                ),
            ));
        }
        self.state = next;
        Ok(())
    }

    /// Upload one unit in full
    ///
    /// A write that the device does not acknowledge abandons the session, as
    /// does a transport failure, which is returned unchanged.
    pub fn write(&mut self, unit: &UnitName, local: &Path, size: u64) -> Result<()> {
        self.transition(SessionState::Writing)?;

        let file_name = unit.remote_file_name();
        let remote = format!("{DEVICE_TMP}/{}_{}", self.id, file_name);

        let written = self.push_and_write(local, &remote, &file_name, size);
        let _ = self.device.exec(&format!("rm -f {}", shell_quote(&remote)));

        match written {
            Ok(()) => {
                debug!("Wrote {} ({} bytes) to session {}", file_name, size, self.id);
                Ok(())
            }
            Err(WriteError::Rejected(reply)) => {
                warn!("Write of {} to session {} rejected: {}", file_name, self.id, reply);
                self.abandon_quietly();
                Err(Error::new(
                    ErrorKind::SessionWriteFailed,
                    format!("install-write {file_name}: {reply}"),
                ))
            }
            Err(WriteError::Device(err)) => {
                warn!("Write of {} to session {} failed: {}", file_name, self.id, err);
                self.abandon_quietly();
                Err(err.into())
            }
        }
    }

    fn push_and_write(
        &self,
        local: &Path,
        remote: &str,
        file_name: &str,
        size: u64,
    ) -> std::result::Result<(), WriteError> {
        self.device.push(local, remote).map_err(WriteError::Device)?;
        let out = self
            .device
            .exec(&format!(
                "{} install-write -S {} {} {} {}",
                self.dialect.prefix(),
                size,
                self.id,
                shell_quote(file_name),
                shell_quote(remote)
            ))
            .map_err(WriteError::Device)?;
        if out.success() && out.stdout.contains("Success") {
            Ok(())
        } else {
            Err(WriteError::Rejected(out.stdout.trim().to_string()))
        }
    }

    /// Commit the session
    ///
    /// The session is COMMITTED afterwards whatever the device answers; a
    /// rejection carries the device's status code verbatim. When no answer
    /// arrives at all the session is abandoned and the transport error returned.
    pub fn commit(mut self) -> Result<()> {
        if !self.state.can_transition_to(SessionState::Committed) {
            return self.transition(SessionState::Committed);
        }

        let command = format!("{} install-commit {}", self.dialect.prefix(), self.id);
        let out = match self.device.exec(&command) {
            Ok(out) => out,
            Err(err) => {
                warn!("Commit of session {} interrupted: {}", self.id, err);
                self.abandon_quietly();
                return Err(err.into());
            }
        };
        self.transition(SessionState::Committed)?;

        if out.success() && out.stdout.contains("Success") {
            info!("Committed install session {}", self.id);
            return Ok(());
        }

        let status =
            parse_failure_code(&out.stdout).unwrap_or_else(|| "INSTALL_FAILED".to_string());
        warn!("Session {} rejected at commit: {}", self.id, status);
        Err(Error::with_device_status(
            ErrorKind::InstallFailed,
            status,
            format!("install-commit: {}", out.stdout.trim()),
        ))
    }

    /// Abandon the session
    pub fn abandon(mut self) -> Result<()> {
        self.transition(SessionState::Abandoned)?;
        let out = self
            .device
            .exec(&format!("{} install-abandon {}", self.dialect.prefix(), self.id))?;
        if out.success() && out.stdout.contains("Success") {
            debug!("Abandoned install session {}", self.id);
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::SessionAbandonFailed,
                format!("install-abandon {}: {}", self.id, out.stdout.trim()),
            ))
        }
    }

    fn abandon_quietly(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = SessionState::Abandoned;
        match self
            .device
            .exec(&format!("{} install-abandon {}", self.dialect.prefix(), self.id))
        {
            Ok(out) if out.stdout.contains("Success") => {
                debug!("Abandoned install session {}", self.id)
            }
            Ok(out) => warn!(
                "Abandon of session {} not acknowledged: {}",
                self.id,
                out.stdout.trim()
            ),
            Err(e) => warn!("Failed to abandon session {}: {}", self.id, e),
        }
    }
}

/// Why a unit did not reach the session
enum WriteError {
    Device(DeviceError),
    Rejected(String),
}

impl Drop for InstallSession<'_> {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            warn!("Session {} dropped while open, abandoning", self.id);
            self.abandon_quietly();
        }
    }
}

/// Extract `1234` from `Success: created install session [1234]`
fn parse_session_id(output: &str) -> Option<String> {
    let start = output.find('[')? + 1;
    let end = start + output[start..].find(']')?;
    let id = output[start..end].trim();
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then(|| id.to_string())
}

/// Extract `CODE` from `Failure [CODE: message]` or `Failure [CODE]`
pub fn parse_failure_code(output: &str) -> Option<String> {
    let rest = &output[output.find("Failure [")? + "Failure [".len()..];
    let code: String = rest
        .chars()
        .take_while(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '_')
        .collect();
    (!code.is_empty()).then_some(code)
}
