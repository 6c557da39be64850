// src/device/mod.rs

//! Device transport seam
//!
//! The deploy core never talks to a device directly. It needs three things:
//! run a shell command and get its stdout and exit code, push a local file,
//! and pull a remote one. [`Device`] is that contract; [`adb::AdbDevice`] is
//! the implementation the command-line tool uses.
//!
//! The API level is read once when the device handle is created and every
//! protocol branch is chosen from it.

pub mod adb;

pub use adb::AdbDevice;

use std::io;
use std::path::Path;
use thiserror::Error;

/// First API level that accepts more than one APK per package
pub const API_MULTI_APK: u32 = 21;
/// First API level with `cmd package` and inheriting install sessions
pub const API_DELTA_INSTALL: u32 = 24;
/// First API level where a running process can be patched in place
pub const API_SWAP: u32 = 26;
/// First API level where `path` reports every installed APK reliably
pub const API_PATH_QUERY: u32 = 28;

/// Root of everything this tool writes on the device
pub const DEVICE_ROOT: &str = "/data/local/tmp/.swapdeploy";
/// Staging directory for pushed APKs and overlay content
pub const DEVICE_TMP: &str = "/data/local/tmp/.swapdeploy/tmp";
/// Helper binaries
pub const DEVICE_BIN: &str = "/data/local/tmp/.swapdeploy/bin";

/// Transport failures
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Command '{command}' timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result of one shell command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub exit_code: i32,
}

impl ShellOutput {
    pub fn new(stdout: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Non-empty trimmed output lines
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|l| !l.is_empty())
    }
}

/// A connected device
pub trait Device {
    fn serial(&self) -> &str;

    fn api_level(&self) -> u32;

    /// Run a shell command on the device
    fn exec(&self, command: &str) -> Result<ShellOutput, DeviceError>;

    /// Copy a local file to a remote path
    fn push(&self, local: &Path, remote: &str) -> Result<(), DeviceError>;

    /// Read a remote file
    fn pull(&self, remote: &str) -> Result<Vec<u8>, DeviceError>;
}

/// Quote one argument for the device shell
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:=+,@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
