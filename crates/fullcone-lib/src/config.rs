//! Daemon configuration
//!
//! Settings come from an optional YAML file and are then overridden by
//! command-line flags. Everything is fixed once the daemon starts.

use fullcone_control::{PortPool, PortRangeError};
use fullcone_proto::{AllowedNetworks, NetworkError};
use fullcone_reload::{CommandReload, ReloadError, ReloadSettings};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Missing required setting '{0}'")]
    Missing(&'static str),

    #[error("At least one allowed network is required")]
    NoNetworks,

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("Invalid port range: {0}")]
    PortRange(#[from] PortRangeError),

    #[error("Invalid reload command: {0}")]
    ReloadCommand(#[source] ReloadError),

    #[error("Invalid timing '{field}': {reason}")]
    Timing { field: &'static str, reason: String },
}

/// Upper bound for every timing, so deadlines stay within `Instant` range
const MAX_TIMING_SECS: u64 = 365 * 24 * 60 * 60;
const MAX_TIMING_MS: u64 = MAX_TIMING_SECS * 1000;

/// Timers and backoff parameters; units are in the field names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub debounce_ms: u64,
    pub max_debounce_ms: u64,
    pub flow_grace_secs: u64,
    pub allocation_cooldown_secs: u64,
    pub stale_after_secs: u64,
    pub sweep_interval_ms: u64,
    pub reload_timeout_secs: u64,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            debounce_ms: 200,
            max_debounce_ms: 2000,
            flow_grace_secs: 5,
            allocation_cooldown_secs: 120,
            stale_after_secs: 300,
            sweep_interval_ms: 1000,
            reload_timeout_secs: 10,
            retry_initial_ms: 1000,
            retry_max_ms: 60000,
        }
    }
}

impl Timings {
    pub fn flow_grace(&self) -> Duration {
        Duration::from_secs(self.flow_grace_secs)
    }

    pub fn allocation_cooldown(&self) -> Duration {
        Duration::from_secs(self.allocation_cooldown_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout_secs)
    }

    pub fn reload_settings(&self) -> ReloadSettings {
        ReloadSettings {
            debounce: Duration::from_millis(self.debounce_ms),
            max_debounce: Duration::from_millis(self.max_debounce_ms),
            retry_initial: Duration::from_millis(self.retry_initial_ms),
            retry_max: Duration::from_millis(self.retry_max_ms),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("debounce_ms", self.debounce_ms, MAX_TIMING_MS),
            ("max_debounce_ms", self.max_debounce_ms, MAX_TIMING_MS),
            ("flow_grace_secs", self.flow_grace_secs, MAX_TIMING_SECS),
            ("allocation_cooldown_secs", self.allocation_cooldown_secs, MAX_TIMING_SECS),
            ("stale_after_secs", self.stale_after_secs, MAX_TIMING_SECS),
            ("sweep_interval_ms", self.sweep_interval_ms, MAX_TIMING_MS),
            ("reload_timeout_secs", self.reload_timeout_secs, MAX_TIMING_SECS),
            ("retry_initial_ms", self.retry_initial_ms, MAX_TIMING_MS),
            ("retry_max_ms", self.retry_max_ms, MAX_TIMING_MS),
        ];
        for (field, value, max) in fields {
            if value == 0 {
                return Err(ConfigError::Timing {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
            if value > max {
                return Err(ConfigError::Timing {
                    field,
                    reason: format!("must not exceed {} (one year)", max),
                });
            }
        }

        if self.max_debounce_ms < self.debounce_ms {
            return Err(ConfigError::Timing {
                field: "max_debounce_ms",
                reason: format!("must be at least debounce_ms ({})", self.debounce_ms),
            });
        }
        if self.retry_max_ms < self.retry_initial_ms {
            return Err(ConfigError::Timing {
                field: "retry_max_ms",
                reason: format!("must be at least retry_initial_ms ({})", self.retry_initial_ms),
            });
        }

        Ok(())
    }
}

fn default_conntrack_bin() -> PathBuf {
    PathBuf::from("conntrack")
}

fn default_port_range() -> String {
    "1024-65535".to_string()
}

fn default_bootstrap() -> bool {
    true
}

/// Full daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Generated proxy include file
    pub proxy_conf: Option<PathBuf>,

    /// Command run after every configuration write
    pub reload_command: Option<String>,

    #[serde(default = "default_conntrack_bin")]
    pub conntrack_bin: PathBuf,

    /// CIDR ranges whose hosts get full-cone mappings
    #[serde(default)]
    pub allowed_networks: Vec<String>,

    /// Directives copied into every generated server block
    #[serde(default)]
    pub additional_conf: String,

    /// Listen on this address instead of the translated one
    #[serde(default)]
    pub listen_address: Option<IpAddr>,

    #[serde(default = "default_port_range")]
    pub port_range: String,

    /// Seed state from the kernel table at startup
    #[serde(default = "default_bootstrap")]
    pub bootstrap: bool,

    #[serde(default)]
    pub timings: Timings,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            proxy_conf: None,
            reload_command: None,
            conntrack_bin: default_conntrack_bin(),
            allowed_networks: Vec::new(),
            additional_conf: String::new(),
            listen_address: None,
            port_range: default_port_range(),
            bootstrap: default_bootstrap(),
            timings: Timings::default(),
        }
    }
}

impl DaemonConfig {
    /// Load config from a YAML file
    ///
    /// The result is not validated; flags may still fill in missing values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn proxy_conf(&self) -> Result<&Path, ConfigError> {
        self.proxy_conf
            .as_deref()
            .ok_or(ConfigError::Missing("proxy_conf"))
    }

    pub fn networks(&self) -> Result<AllowedNetworks, ConfigError> {
        if self.allowed_networks.is_empty() {
            return Err(ConfigError::NoNetworks);
        }
        Ok(AllowedNetworks::parse(&self.allowed_networks)?)
    }

    pub fn port_pool(&self) -> Result<PortPool, ConfigError> {
        let (start, end) = PortPool::parse_range(&self.port_range)?;
        Ok(PortPool::new(start, end))
    }

    pub fn reload_action(&self) -> Result<CommandReload, ConfigError> {
        let command = self
            .reload_command
            .as_deref()
            .ok_or(ConfigError::Missing("reload_command"))?;
        CommandReload::parse(command, self.timings.reload_timeout()).map_err(ConfigError::ReloadCommand)
    }

    /// Check everything the daemon needs before it touches the system
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.proxy_conf()?;
        self.networks()?;
        self.port_pool()?;
        self.timings.validate()?;
        self.reload_action()?;
        Ok(())
    }
}
