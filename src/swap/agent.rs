// src/swap/agent.rs

//! On-device agent seam and helper bootstrap
//!
//! The agent that redefines classes inside the running process is opaque to
//! the orchestrator: it hands over an [`AttachRequest`] and gets back one
//! [`ClassOutcome`] per class. [`HelperAgentClient`] is the implementation
//! that drives the `installer` helper binary over the device shell; the
//! helper and agent library are bootstrapped once by [`HelperInstaller`] and
//! reused while their version tag matches.

use crate::apk::UnitName;
use crate::cache::TransformCacheEntry;
use crate::device::{DEVICE_BIN, Device, DeviceError, shell_quote};
use crate::error::{Error, ErrorKind, Result};
use crate::hash::{self, HashAlgorithm};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use strum_macros::{Display, EnumString};
use thiserror::Error;
use tracing::{debug, info};

/// File name of the helper binary, locally and on the device
pub const INSTALLER_NAME: &str = "installer";
/// File name of the agent library, locally and on the device
pub const AGENT_NAME: &str = "agent.so";

/// Digits of the installer's SHA-256 used as its version tag
const VERSION_DIGITS: usize = 16;

/// One dex segment shipped in the overlay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlaySegment {
    pub unit: UnitName,
    pub entry_name: String,
    pub fingerprint: String,
}

/// Everything the agent needs to patch one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    pub package: String,
    pub pid: u32,
    /// Absolute overlay directory inside the app's code cache
    pub overlay_dir: String,
    pub segments: Vec<OverlaySegment>,
    /// Resource entries shipped in the overlay (full swap only)
    pub resources: Vec<String>,
    /// Transform results already known for the overlay's segments
    pub cached: Vec<TransformCacheEntry>,
    pub restart_activity: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TransformMode {
    /// Applied from a cached transform
    Redefined,
    /// Instrumented from scratch by the agent
    Retransformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassOutcome {
    pub class_name: String,
    pub segment_fingerprint: String,
    pub mode: TransformMode,
    pub instrumented_ref: Option<String>,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent attach failed: {0}")]
    Attach(String),

    #[error("Unexpected agent response: {0}")]
    Protocol(String),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Attaches the agent to a running process
pub trait AgentClient {
    fn attach(&self, request: &AttachRequest) -> std::result::Result<Vec<ClassOutcome>, AgentError>;
}

/// Installs the helper binary and agent library under the device bin directory
pub struct HelperInstaller {
    local_dir: PathBuf,
}

impl HelperInstaller {
    /// `local_dir` must contain `installer` and `agent.so`
    pub fn new(local_dir: impl Into<PathBuf>) -> Self {
        Self {
            local_dir: local_dir.into(),
        }
    }

    fn local(&self, name: &str) -> Result<PathBuf> {
        let path = self.local_dir.join(name);
        if !path.is_file() {
            return Err(Error::new(
                ErrorKind::InstallerUnavailable,
                format!("{} not found", path.display()),
            ));
        }
        Ok(path)
    }

    /// Version tag of the local installer
    pub fn version(&self) -> Result<String> {
        let installer = self.local(INSTALLER_NAME)?;
        let fingerprint = hash::fingerprint_file(HashAlgorithm::Sha256, &installer)?;
        Ok(fingerprint.short(VERSION_DIGITS).to_string())
    }

    /// Make sure the matching helper is present on the device
    ///
    /// Returns the version tag; nothing is pushed when the device already
    /// reports that version.
    pub fn ensure(&self, device: &dyn Device) -> Result<String> {
        let version = self.version()?;
        if probe(device, &version)? {
            debug!("Helper {} already installed on {}", version, device.serial());
            return Ok(version);
        }

        info!("Installing helper {} on {}", version, device.serial());
        let installer = self.local(INSTALLER_NAME)?;
        let agent = self.local(AGENT_NAME)?;
        let remote_installer = format!("{DEVICE_BIN}/{INSTALLER_NAME}");

        device.exec(&format!("mkdir -p {DEVICE_BIN}"))?;
        device.push(&installer, &remote_installer)?;
        device.push(&agent, &format!("{DEVICE_BIN}/{AGENT_NAME}"))?;
        device.exec(&format!("chmod +x {remote_installer}"))?;

        if !probe(device, &version)? {
            return Err(Error::new(
                ErrorKind::InstallerUnavailable,
                format!("helper {version} does not run on {}", device.serial()),
            ));
        }
        Ok(version)
    }
}

fn installer_command(version: &str) -> String {
    format!("{DEVICE_BIN}/{INSTALLER_NAME} -version={version}")
}

fn probe(device: &dyn Device, version: &str) -> Result<bool> {
    let out = device.exec(&format!("{} version", installer_command(version)))?;
    Ok(out.success() && out.stdout.trim() == version)
}

/// [`AgentClient`] that runs `installer swap` on the device
///
/// Each output line is `<MODE> <class> <segment-fingerprint> [<ref>]`.
pub struct HelperAgentClient<'d> {
    device: &'d dyn Device,
    version: String,
}

impl<'d> HelperAgentClient<'d> {
    pub fn new(device: &'d dyn Device, version: impl Into<String>) -> Self {
        Self {
            device,
            version: version.into(),
        }
    }

    /// Client for the helper found in `local_dir`
    pub fn for_helper(device: &'d dyn Device, helper: &HelperInstaller) -> Result<Self> {
        Ok(Self::new(device, helper.version()?))
    }

    fn command(&self, request: &AttachRequest) -> String {
        let mut command = format!(
            "{} swap --package {} --pid {} --overlay {} --agent {}",
            installer_command(&self.version),
            shell_quote(&request.package),
            request.pid,
            shell_quote(&request.overlay_dir),
            shell_quote(&format!("{DEVICE_BIN}/{AGENT_NAME}")),
        );
        for segment in &request.segments {
            command.push_str(&format!(
                " --segment {}",
                shell_quote(&format!(
                    "{}/{}={}",
                    segment.unit.remote_file_name(),
                    segment.entry_name,
                    segment.fingerprint
                ))
            ));
        }
        for resource in &request.resources {
            command.push_str(&format!(" --resource {}", shell_quote(resource)));
        }
        for entry in &request.cached {
            command.push_str(&format!(
                " --cached {}",
                shell_quote(&format!(
                    "{}@{}={}",
                    entry.class_name, entry.segment_fingerprint, entry.instrumented_ref
                ))
            ));
        }
        if request.restart_activity {
            command.push_str(" --restart");
        }
        command
    }
}

impl AgentClient for HelperAgentClient<'_> {
    fn attach(
        &self,
        request: &AttachRequest,
    ) -> std::result::Result<Vec<ClassOutcome>, AgentError> {
        let out = self.device.exec(&self.command(request))?;
        if !out.success() {
            return Err(AgentError::Attach(out.stdout.trim().to_string()));
        }
        out.lines().map(parse_outcome).collect()
    }
}

fn parse_outcome(line: &str) -> std::result::Result<ClassOutcome, AgentError> {
    let mut fields = line.split_whitespace();
    let (Some(mode), Some(class_name), Some(segment)) =
        (fields.next(), fields.next(), fields.next())
    else {
        return Err(AgentError::Protocol(line.to_string()));
    };
    let mode = TransformMode::from_str(mode).map_err(|_| AgentError::Protocol(line.to_string()))?;
    Ok(ClassOutcome {
        class_name: class_name.to_string(),
        segment_fingerprint: segment.to_string(),
        mode,
        instrumented_ref: fields.next().map(str::to_string),
    })
}

/// Local helper directory, if one is configured and present
pub fn helper_dir(configured: Option<&Path>) -> Option<PathBuf> {
    configured
        .map(Path::to_path_buf)
        .filter(|dir| dir.join(INSTALLER_NAME).is_file())
}
