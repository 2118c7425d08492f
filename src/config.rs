//! Driver configuration.
//!
//! Every field has a default taken from [`crate::constants`], so an empty
//! YAML document is a valid configuration. Host-specific tool locations can
//! also be overridden through `JAILRUN_*` environment variables:
//!
//! | Variable               | Field               |
//! |------------------------|---------------------|
//! | `JAILRUN_JAIL_BIN`     | `tools.jail`        |
//! | `JAILRUN_JLS_BIN`      | `tools.jls`         |
//! | `JAILRUN_RCTL_BIN`     | `tools.rctl`        |
//! | `JAILRUN_JEXEC_BIN`    | `tools.jexec`       |
//! | `JAILRUN_SCRATCH_DIR`  | `scratch_dir`       |
//! | `JAILRUN_REGISTRY_URL` | `registry.url`      |

use crate::constants::{
    COMMAND_TIMEOUT, CREATE_SETTLE_PERIOD, DEFAULT_AUTH_URL, DEFAULT_REGISTRY_SERVICE,
    DEFAULT_REGISTRY_URL, DESTROY_GRACE_PERIOD, ENV_PREFIX, JAIL_BIN, JEXEC_BIN, JLS_BIN,
    MAX_CONFIG_SIZE, MONITOR_INTERVAL, RCTL_BIN, REGISTRY_REQUEST_TIMEOUT, SCRATCH_DIR_NAME,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level driver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    pub tools: ToolPaths,
    /// Monitor poll interval in milliseconds.
    pub monitor_interval_ms: u64,
    /// Grace period before a forced destroy removes the jail, in seconds.
    pub destroy_grace_secs: u64,
    /// Timeout for each `jail`/`jls`/`rctl` invocation, in seconds.
    pub command_timeout_secs: u64,
    /// How long `jail -c` is watched for an early failure, in milliseconds.
    pub create_settle_ms: u64,
    /// Directory for in-flight layer downloads.
    pub scratch_dir: PathBuf,
    /// Write `<rootfs>.tar.gz` after each image pull.
    pub repackage_images: bool,
    pub registry: RegistryConfig,
}

/// Locations of the FreeBSD jail tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolPaths {
    pub jail: String,
    pub jls: String,
    pub rctl: String,
    pub jexec: String,
}

/// Registry endpoints used by the image pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Registry API base URL for Docker Hub references.
    pub url: String,
    /// Token endpoint for Docker Hub references.
    pub auth_url: String,
    /// `service` parameter of token requests.
    pub service: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tools: ToolPaths::default(),
            monitor_interval_ms: MONITOR_INTERVAL.as_millis() as u64,
            destroy_grace_secs: DESTROY_GRACE_PERIOD.as_secs(),
            command_timeout_secs: COMMAND_TIMEOUT.as_secs(),
            create_settle_ms: CREATE_SETTLE_PERIOD.as_millis() as u64,
            scratch_dir: std::env::temp_dir().join(SCRATCH_DIR_NAME),
            repackage_images: false,
            registry: RegistryConfig::default(),
        }
    }
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            jail: JAIL_BIN.to_string(),
            jls: JLS_BIN.to_string(),
            rctl: RCTL_BIN.to_string(),
            jexec: JEXEC_BIN.to_string(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REGISTRY_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            service: DEFAULT_REGISTRY_SERVICE.to_string(),
            request_timeout_secs: REGISTRY_REQUEST_TIMEOUT.as_secs(),
        }
    }
}

impl RegistryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl DriverConfig {
    /// Loads a YAML config file and applies environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut config = Self::from_yaml(&bytes).map_err(|e| match e {
            Error::Config { reason, .. } => Error::Config {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        debug!("loaded driver config from {}", path.display());
        Ok(config)
    }

    /// Parses a YAML document. Missing fields take their defaults.
    pub fn from_yaml(yaml: &[u8]) -> Result<Self> {
        if yaml.len() > MAX_CONFIG_SIZE {
            return Err(Error::Config {
                path: PathBuf::new(),
                reason: format!(
                    "config size {} exceeds limit of {}",
                    yaml.len(),
                    MAX_CONFIG_SIZE
                ),
            });
        }
        if yaml.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_yaml::from_slice(yaml).map_err(|e| Error::Config {
            path: PathBuf::new(),
            reason: e.to_string(),
        })
    }

    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Applies `JAILRUN_*` overrides obtained through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
        };
        if let Some(v) = var("JAIL_BIN") {
            self.tools.jail = v;
        }
        if let Some(v) = var("JLS_BIN") {
            self.tools.jls = v;
        }
        if let Some(v) = var("RCTL_BIN") {
            self.tools.rctl = v;
        }
        if let Some(v) = var("JEXEC_BIN") {
            self.tools.jexec = v;
        }
        if let Some(v) = var("SCRATCH_DIR") {
            self.scratch_dir = PathBuf::from(v);
        }
        if let Some(v) = var("REGISTRY_URL") {
            self.registry.url = v;
        }
    }

    /// Rejects values that would make the driver spin or never time out.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Error::Config {
            path: PathBuf::new(),
            reason: reason.to_string(),
        };
        if self.monitor_interval_ms == 0 {
            return Err(invalid("monitor_interval_ms must be positive"));
        }
        if self.command_timeout_secs == 0 {
            return Err(invalid("command_timeout_secs must be positive"));
        }
        if self.registry.request_timeout_secs == 0 {
            return Err(invalid("registry.request_timeout_secs must be positive"));
        }
        Ok(())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn destroy_grace(&self) -> Duration {
        Duration::from_secs(self.destroy_grace_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn create_settle(&self) -> Duration {
        Duration::from_millis(self.create_settle_ms)
    }
}
