// src/device/adb.rs

//! [`Device`] over the `adb` executable
//!
//! Each operation runs one `adb -s <serial> ...` child with a bounded wait.
//! Output is drained on reader threads so a large `dump` cannot fill the pipe
//! and stall the child before the timeout fires.

use super::{Device, DeviceError, ShellOutput};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

pub struct AdbDevice {
    adb: PathBuf,
    serial: String,
    api_level: u32,
    timeout: Duration,
}

struct Finished {
    stdout: String,
    stderr: String,
    exit_code: i32,
}

impl AdbDevice {
    /// Connect to a device, picking the only attached one when `serial` is None
    pub fn connect(serial: Option<&str>, timeout: Duration) -> Result<Self, DeviceError> {
        let adb = which::which("adb")
            .map_err(|e| DeviceError::Transport(format!("adb not found in PATH: {e}")))?;

        let serial = match serial {
            Some(serial) => serial.to_string(),
            None => only_attached_device(&adb, timeout)?,
        };

        let mut device = Self {
            adb,
            serial,
            api_level: 0,
            timeout,
        };
        let sdk = device.exec("getprop ro.build.version.sdk")?;
        device.api_level = sdk.stdout.trim().parse().map_err(|_| {
            DeviceError::Transport(format!(
                "Unexpected API level from {}: {:?}",
                device.serial,
                sdk.stdout.trim()
            ))
        })?;

        info!(
            "Connected to {} (API {})",
            device.serial, device.api_level
        );
        Ok(device)
    }

    fn run(&self, args: &[&str]) -> Result<Finished, DeviceError> {
        let mut command = Command::new(&self.adb);
        command.arg("-s").arg(&self.serial).args(args);
        run_with_timeout(command, &args.join(" "), self.timeout)
    }
}

impl Device for AdbDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn api_level(&self) -> u32 {
        self.api_level
    }

    fn exec(&self, command: &str) -> Result<ShellOutput, DeviceError> {
        debug!("[{}] $ {}", self.serial, command);
        let finished = self.run(&["shell", command])?;
        if !finished.stderr.trim().is_empty() {
            debug!("[{}] stderr: {}", self.serial, finished.stderr.trim());
        }
        Ok(ShellOutput::new(finished.stdout, finished.exit_code))
    }

    fn push(&self, local: &Path, remote: &str) -> Result<(), DeviceError> {
        let local_str = local.to_str().ok_or_else(|| {
            DeviceError::Transport(format!("Local path is not UTF-8: {}", local.display()))
        })?;
        debug!("[{}] push {} -> {}", self.serial, local.display(), remote);

        let finished = self.run(&["push", local_str, remote])?;
        if finished.exit_code != 0 {
            return Err(DeviceError::Transport(format!(
                "push {} failed: {}",
                local.display(),
                finished.stderr.trim()
            )));
        }
        Ok(())
    }

    fn pull(&self, remote: &str) -> Result<Vec<u8>, DeviceError> {
        let dir = tempfile::tempdir()?;
        let local = dir.path().join("pulled");
        let local_str = local.to_string_lossy().to_string();

        let finished = self.run(&["pull", remote, &local_str])?;
        if finished.exit_code != 0 {
            return Err(DeviceError::Transport(format!(
                "pull {remote} failed: {}",
                finished.stderr.trim()
            )));
        }
        Ok(std::fs::read(&local)?)
    }
}

fn only_attached_device(adb: &Path, timeout: Duration) -> Result<String, DeviceError> {
    let mut command = Command::new(adb);
    command.arg("devices");
    let finished = run_with_timeout(command, "devices", timeout)?;

    let serials: Vec<&str> = finished
        .stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(serial), Some("device")) => Some(serial),
                _ => None,
            }
        })
        .collect();

    match serials.as_slice() {
        [serial] => Ok((*serial).to_string()),
        [] => Err(DeviceError::Transport("No device attached".to_string())),
        _ => Err(DeviceError::Transport(format!(
            "More than one device attached ({}); pass a serial",
            serials.join(", ")
        ))),
    }
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut out = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut out);
        }
        String::from_utf8_lossy(&out).into_owned()
    })
}

fn run_with_timeout(
    mut command: Command,
    label: &str,
    timeout: Duration,
) -> Result<Finished, DeviceError> {
    let mut child: Child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| DeviceError::Transport(format!("Failed to spawn adb {label}: {e}")))?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    match child.wait_timeout(timeout)? {
        Some(status) => {
            let stdout = stdout.join().unwrap_or_default();
            let stderr = stderr.join().unwrap_or_default();
            Ok(Finished {
                stdout,
                stderr,
                exit_code: status.code().unwrap_or(-1),
            })
        }
        None => {
            warn!("adb {} timed out after {}s", label, timeout.as_secs());
            let _ = child.kill();
            let _ = child.wait();
            Err(DeviceError::Timeout {
                command: label.to_string(),
                seconds: timeout.as_secs(),
            })
        }
    }
}
