// src/error.rs

//! Error types for deploy operations
//!
//! Every failure inside an install or swap is folded into a single [`Error`]
//! at the boundary of the component that owns it. Each error maps to exactly
//! one [`ErrorKind`], and each kind has a stable integer code so scripted
//! callers can branch on the process exit status.

use crate::device::DeviceError;
use crate::swap::SwapStage;
use std::io;
use std::path::PathBuf;
use strum_macros::{Display, EnumString, IntoStaticStr};
use thiserror::Error;

/// Exit code reported for a successful invocation
pub const SUCCESS_CODE: i32 = 0;

/// Named failure kinds with stable codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The device rejected the final commit (or the full install)
    InstallFailed,
    #[strum(to_string = "CANNOT_SWAP_BEFORE_API_26")]
    CannotSwapBeforeApi26,
    #[strum(to_string = "MULTI_APKS_NO_SUPPORTED_BELOW21")]
    MultiApksNotSupportedBelow21,
    DumpUnknownPackage,
    DumpFailed,
    DumpUnknownProcess,
    /// A session write was not acknowledged; the session was abandoned
    #[strum(to_string = "DELTAINSTALL_WRITE_FAILED")]
    SessionWriteFailed,
    SessionCreateFailed,
    SessionAbandonFailed,
    PreinstallFailed,
    CannotSwapResource,
    CannotSwapManifest,
    RemoteApkNotFoundInDb,
    DifferentApkTopology,
    AgentAttachFailed,
    InstallerUnavailable,
    DeviceTimeout,
    InvalidApk,
    InternalError,
}

impl ErrorKind {
    /// Stable exit code for scripted consumers
    pub const fn code(self) -> i32 {
        match self {
            Self::InstallFailed => 1,
            Self::CannotSwapBeforeApi26 => 2,
            Self::MultiApksNotSupportedBelow21 => 3,
            Self::DumpUnknownPackage => 4,
            Self::DumpFailed => 5,
            Self::DumpUnknownProcess => 6,
            Self::SessionWriteFailed => 7,
            Self::SessionCreateFailed => 8,
            Self::SessionAbandonFailed => 9,
            Self::PreinstallFailed => 10,
            Self::CannotSwapResource => 11,
            Self::CannotSwapManifest => 12,
            Self::RemoteApkNotFoundInDb => 13,
            Self::DifferentApkTopology => 14,
            Self::AgentAttachFailed => 15,
            Self::InstallerUnavailable => 16,
            Self::DeviceTimeout => 17,
            Self::InvalidApk => 18,
            Self::InternalError => 19,
        }
    }

    /// Kinds that are decided before any device command is issued
    pub const fn is_precondition(self) -> bool {
        matches!(
            self,
            Self::CannotSwapBeforeApi26 | Self::MultiApksNotSupportedBelow21
        )
    }

    /// How much of the operation reached the device before it stopped
    pub const fn failure_class(self) -> FailureClass {
        match self {
            Self::InstallFailed => FailureClass::RejectedAtCommit,
            Self::SessionWriteFailed
            | Self::SessionAbandonFailed
            | Self::PreinstallFailed
            | Self::AgentAttachFailed => FailureClass::AbandonedPartial,
            _ => FailureClass::NothingApplied,
        }
    }
}

/// Coarse user-visible classification of a failed invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Nothing was changed on the device
    NothingApplied,
    /// Content reached the device but the session or overlay was abandoned
    AbandonedPartial,
    /// The device accepted the upload but rejected the final commit
    RejectedAtCommit,
}

/// Error type for all deploy operations
#[derive(Debug, Error)]
pub enum Error {
    /// A classified deploy failure
    #[error("{kind}: {message}")]
    Deploy {
        kind: ErrorKind,
        /// Swap stage at which the failure occurred
        stage: Option<SwapStage>,
        /// Status token returned verbatim by the device, e.g. INSTALL_FAILED_INVALID_APK
        device_status: Option<String>,
        message: String,
    },

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Invalid APK {path}: {reason}")]
    InvalidApk { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using the deploy error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a classified error
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Deploy {
            kind,
            stage: None,
            device_status: None,
            message: message.into(),
        }
    }

    /// Create an error carrying the device's own status token
    pub fn with_device_status(
        kind: ErrorKind,
        status: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Deploy {
            kind,
            stage: None,
            device_status: Some(status.into()),
            message: message.into(),
        }
    }

    /// Attach the swap stage at which this error surfaced
    ///
    /// Errors that already carry a stage keep the original one.
    pub fn at_stage(self, at: SwapStage) -> Self {
        match self {
            Self::Deploy {
                kind,
                stage,
                device_status,
                message,
            } => Self::Deploy {
                kind,
                stage: stage.or(Some(at)),
                device_status,
                message,
            },
            other => {
                let kind = other.kind();
                Self::Deploy {
                    kind,
                    stage: Some(at),
                    device_status: None,
                    message: other.to_string(),
                }
            }
        }
    }

    /// The kind this error maps to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Deploy { kind, .. } => *kind,
            Self::Device(DeviceError::Timeout { .. }) => ErrorKind::DeviceTimeout,
            Self::InvalidApk { .. } => ErrorKind::InvalidApk,
            Self::Device(_)
            | Self::Io(_)
            | Self::Database(_)
            | Self::Serialization(_)
            | Self::Config(_) => ErrorKind::InternalError,
        }
    }

    /// Stable exit code
    pub fn code(&self) -> i32 {
        self.kind().code()
    }

    /// Swap stage at which the failure occurred, if any
    pub fn stage(&self) -> Option<SwapStage> {
        match self {
            Self::Deploy { stage, .. } => *stage,
            _ => None,
        }
    }

    /// Status token returned by the device, if any
    /// Description without the kind prefix
    pub fn message(&self) -> String {
        match self {
            Self::Deploy { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn device_status(&self) -> Option<&str> {
        match self {
            Self::Deploy { device_status, .. } => device_status.as_deref(),
            _ => None,
        }
    }

    /// Name used in metrics and CLI output, e.g. `COMPARE/DUMP_UNKNOWN_PROCESS`
    pub fn qualified_name(&self) -> String {
        let kind: &'static str = self.kind().into();
        match self.stage() {
            Some(stage) => format!("{}/{}", stage.metric_name(), kind),
            None => kind.to_string(),
        }
    }

    pub fn failure_class(&self) -> FailureClass {
        self.kind().failure_class()
    }

    /// True when content reached the device before the operation was abandoned
    pub fn is_partial_apply(&self) -> bool {
        self.failure_class() == FailureClass::AbandonedPartial
    }
}
