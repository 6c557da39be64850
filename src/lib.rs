// src/lib.rs

//! swapdeploy
//!
//! Delta installs and live code swap for applications on attached devices.
//!
//! # Architecture
//!
//! - Snapshot: read what the device has installed for a package
//! - Diff: classify each APK unit as unchanged or modified, dex segment by dex segment
//! - Sessions: create, write, then commit or abandon, in the dialect the API level allows
//! - Swap: stage changed code next to the running process and attach an agent
//! - Cache: SQLite store of APK entry tables, install records and agent transforms
//!
//! Every request appends to an ordered metrics ledger and ends in one
//! [`Error`] with a stable exit code, or success.

pub mod apk;
pub mod cache;
pub mod config;
pub mod db;
pub mod deployer;
pub mod device;
pub mod diff;
mod error;
pub mod hash;
pub mod lock;
pub mod metrics;
pub mod session;
pub mod snapshot;
pub mod swap;
pub mod ui;

pub use apk::{PackageSpec, UnitName};
pub use cache::ArtifactCache;
pub use config::DeployerOptions;
pub use deployer::{DeltaSkipReason, Deployer, InstallOutcome};
pub use device::{Device, DeviceError, ShellOutput};
pub use error::{Error, ErrorKind, FailureClass, Result, SUCCESS_CODE};
pub use hash::{Fingerprint, HashAlgorithm};
pub use metrics::{LogSink, MetricEvent, MetricsLedger, MetricsSink};
pub use swap::{SwapMode, SwapReport, SwapStage, SwapState};
pub use ui::UiService;
