// src/config.rs
//! Deployer options
//!
//! Options come from an optional TOML file (`$XDG_CONFIG_HOME/swapdeploy/config.toml`)
//! and are then overridden by command-line flags:
//!
//! ```toml
//! force_full_install = false
//! installers_path = "/opt/swapdeploy/bin"
//! cache_path = "/home/dev/.cache/swapdeploy"
//! command_timeout_secs = 120
//! fingerprint_algorithm = "sha256"
//! ```

use crate::db::paths;
use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Options that shape one deployer
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeployerOptions {
    /// Never attempt a delta install
    pub force_full_install: bool,

    /// Local directory containing the `installer` helper and the agent library
    pub installers_path: Option<PathBuf>,

    /// Cache directory; the database and device locks live here
    pub cache_path: PathBuf,

    /// Upper bound for any single device command
    pub command_timeout_secs: u64,

    /// Algorithm used to fingerprint APKs and dex segments
    pub fingerprint_algorithm: String,
}

impl Default for DeployerOptions {
    fn default() -> Self {
        Self {
            force_full_install: false,
            installers_path: None,
            cache_path: paths::default_cache_dir(),
            command_timeout_secs: 120,
            fingerprint_algorithm: HashAlgorithm::default().name().to_string(),
        }
    }
}

impl DeployerOptions {
    /// Default location of the configuration file
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("swapdeploy").join("config.toml"))
    }

    /// Load options from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Load the default configuration file when it exists, otherwise use defaults
    ///
    /// The cache directory environment override always wins over the file.
    pub fn load_default() -> Result<Self> {
        let mut options = match Self::default_config_path() {
            Some(path) if path.exists() => {
                debug!("Loading options from {}", path.display());
                Self::load(&path)?
            }
            _ => Self::default(),
        };
        if let Ok(dir) = std::env::var(paths::CACHE_DIR_ENV) {
            options.cache_path = PathBuf::from(dir);
        }
        Ok(options)
    }

    /// Parse options from TOML text and validate them
    pub fn parse(content: &str) -> Result<Self> {
        let options: DeployerOptions =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 {
            return Err(Error::Config(
                "command_timeout_secs must be greater than zero".to_string(),
            ));
        }
        self.fingerprint_algorithm()?;
        Ok(())
    }

    pub fn fingerprint_algorithm(&self) -> Result<HashAlgorithm> {
        self.fingerprint_algorithm
            .parse()
            .map_err(|e| Error::Config(format!("fingerprint_algorithm: {e}")))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Options rooted at an explicit cache directory
    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = path.into();
        self
    }
}
