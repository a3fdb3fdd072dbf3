//! State engine configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("parse error: {0}")]
    Parse(String),

    /// Environment variable error
    #[error("environment variable error: {0}")]
    EnvVar(String),

    /// Validation error
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// Field name
        field: String,
        /// Error message
        message: String,
    },
}

/// NFSv4 state engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Lease time in seconds
    pub lease_time_secs: u64,
    /// Grace period after restart in seconds
    pub grace_period_secs: u64,
    /// Timeout for a single callback RPC in milliseconds
    pub callback_timeout_ms: u64,
    /// How long an opener waits for a recalled delegation to come back
    pub recall_wait_ms: u64,
    /// Bound on acquiring a per-file decision lock in milliseconds
    pub file_lock_timeout_ms: u64,
    /// Interval of the lease sweeper in milliseconds
    pub sweep_interval_ms: u64,
    /// Idle time after which a state owner without state is reaped
    pub owner_idle_timeout_secs: u64,
    /// Grant delegations at all
    pub delegations_enabled: bool,
    /// Grant read delegations on repeated opens by the same owner
    pub opportunistic_delegations: bool,
    /// Directory of the client recovery ledger (in-memory ledger if unset)
    pub recovery_dir: Option<PathBuf>,
    /// Networks whose clients must prove callback reachability
    pub verify_networks: Vec<IpNet>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            lease_time_secs: 90,
            grace_period_secs: 90,
            callback_timeout_ms: 5_000,
            recall_wait_ms: 100,
            file_lock_timeout_ms: 2_000,
            sweep_interval_ms: 10_000,
            owner_idle_timeout_secs: 180,
            delegations_enabled: true,
            opportunistic_delegations: true,
            recovery_dir: None,
            verify_networks: Vec::new(),
        }
    }
}

impl StateConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `<PREFIX>_*` environment overrides
    pub fn with_env_overrides(mut self, prefix: &str) -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(key: &str, val: &str) -> Result<T, ConfigError> {
            val.parse()
                .map_err(|_| ConfigError::EnvVar(format!("Invalid {key} value: {val}")))
        }

        let var = |name: &str| std::env::var(format!("{prefix}_{name}")).ok();

        if let Some(val) = var("LEASE_TIME_SECS") {
            self.lease_time_secs = parse("lease_time_secs", &val)?;
        }
        if let Some(val) = var("GRACE_PERIOD_SECS") {
            self.grace_period_secs = parse("grace_period_secs", &val)?;
        }
        if let Some(val) = var("CALLBACK_TIMEOUT_MS") {
            self.callback_timeout_ms = parse("callback_timeout_ms", &val)?;
        }
        if let Some(val) = var("DELEGATIONS_ENABLED") {
            self.delegations_enabled = parse("delegations_enabled", &val)?;
        }
        if let Some(val) = var("RECOVERY_DIR") {
            self.recovery_dir = Some(PathBuf::from(val));
        }
        if let Some(val) = var("VERIFY_NETWORKS") {
            self.verify_networks = val
                .split(',')
                .map(str::trim)
                .filter(|net| !net.is_empty())
                .map(|net| parse("verify_networks", net))
                .collect::<Result<_, _>>()?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_time_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lease_time_secs".to_string(),
                message: "lease time must be positive".to_string(),
            });
        }
        if self.callback_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "callback_timeout_ms".to_string(),
                message: "callbacks need a bounded, non-zero timeout".to_string(),
            });
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sweep_interval_ms".to_string(),
                message: "sweep interval must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Set lease time
    pub fn lease_time(mut self, lease: Duration) -> Self {
        self.lease_time_secs = lease.as_secs().max(1);
        self
    }

    /// Set grace period
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_secs = grace.as_secs();
        self
    }

    /// Set callback timeout
    pub fn callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set recall wait
    pub fn recall_wait(mut self, wait: Duration) -> Self {
        self.recall_wait_ms = wait.as_millis() as u64;
        self
    }

    /// Set the recovery ledger directory
    pub fn with_recovery_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recovery_dir = Some(dir.into());
        self
    }

    /// Disable delegations
    pub fn disable_delegations(mut self) -> Self {
        self.delegations_enabled = false;
        self
    }

    /// Disable opportunistic read delegations
    pub fn disable_opportunistic_delegations(mut self) -> Self {
        self.opportunistic_delegations = false;
        self
    }

    /// Lease duration
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_time_secs)
    }

    /// Grace period duration
    pub fn grace_duration(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Callback RPC timeout
    pub fn callback_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    /// Recall wait duration
    pub fn recall_wait_duration(&self) -> Duration {
        Duration::from_millis(self.recall_wait_ms)
    }

    /// Per-file lock timeout
    pub fn file_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.file_lock_timeout_ms)
    }

    /// Sweeper interval
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Owner idle timeout
    pub fn owner_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.owner_idle_timeout_secs)
    }
}
