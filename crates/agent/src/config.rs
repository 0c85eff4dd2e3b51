//! Agent Configuration
//!
//! Loaded from an optional TOML file, then overridden by `OBD_`-prefixed
//! environment variables with `__` between nesting levels, e.g.
//! `OBD_MANAGER__RETRY__MAX_ATTEMPTS=3` or `OBD_TRANSPORT__TYPE=serial`.

use config::{Config, Environment, File, FileFormat};
use obd_connection::ManagerConfig;
use obd_protocol::{DtcLayout, PidRegistry, TransportSettings, VehicleInfo};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use storage::RetentionConfig;
use thiserror::Error;

pub const ENV_PREFIX: &str = "OBD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset (default: info)
    pub level: String,
    /// Emit JSON lines instead of plain text (default: false)
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Everything the agent needs to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Adapter channel (default: simulated)
    pub transport: TransportSettings,
    /// Vehicle the adapter is plugged into
    pub vehicle: VehicleInfo,
    pub manager: ManagerConfig,
    /// Mode 01 PIDs read on every poll
    pub pids: Vec<String>,
    /// Poll period while ready in milliseconds (default: 5000)
    pub poll_interval_ms: u64,
    /// Read stored trouble codes after each successful connect (default: true)
    pub read_dtc_on_connect: bool,
    /// Fresh connect cycles started after the manager gives up; reset once
    /// the adapter is ready again (default: 0, stay in error)
    pub error_reconnects: u32,
    /// Wait after a failed cycle before starting another (default: 60000)
    pub error_cooldown_ms: u64,
    /// Trouble code byte layout (default: sae)
    pub dtc_layout: DtcLayout,
    pub logging: LoggingConfig,
    /// Serve Prometheus metrics on this address when set
    pub metrics_addr: Option<SocketAddr>,
    pub retention: RetentionConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            transport: TransportSettings::default(),
            vehicle: VehicleInfo::default(),
            manager: ManagerConfig::default(),
            pids: ["0C", "0D", "05", "42"].iter().map(|p| p.to_string()).collect(),
            poll_interval_ms: 5_000,
            read_dtc_on_connect: true,
            error_reconnects: 0,
            error_cooldown_ms: 60_000,
            dtc_layout: DtcLayout::default(),
            logging: LoggingConfig::default(),
            metrics_addr: None,
            retention: RetentionConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load from `path` (if given) and the environment, then validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        let config: AgentConfig = builder
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_millis(self.error_cooldown_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport.validate().map_err(ConfigError::Invalid)?;

        let retry = &self.manager.retry;
        if retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry multiplier {} must be at least 1.0",
                retry.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(ConfigError::Invalid(format!(
                "retry jitter {} must be within 0.0..=1.0",
                retry.jitter
            )));
        }
        if retry.max_delay_ms < retry.base_delay_ms {
            return Err(ConfigError::Invalid(
                "retry max_delay_ms is below base_delay_ms".into(),
            ));
        }
        if self.manager.engine.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid("engine timeout must be positive".into()));
        }
        if self.manager.health_check_interval_ms == 0 || self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("intervals must be positive".into()));
        }

        let registry = PidRegistry::standard();
        if let Some(unknown) = self.pids.iter().find(|pid| registry.get(pid).is_none()) {
            return Err(ConfigError::Invalid(format!("unknown PID '{}'", unknown)));
        }
        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("pids")
}
