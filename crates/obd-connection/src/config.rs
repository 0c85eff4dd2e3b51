//! Connection Manager Configuration

use crate::retry::RetryPolicy;
use obd_protocol::EngineConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use storage::DeviceKind;

/// Configuration for one managed device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Device the records are attributed to (default: obd)
    pub device: DeviceKind,
    /// Start a new connect cycle when a ready link is lost (default: true)
    pub auto_reconnect: bool,
    /// Backoff for both the open and the init phase
    pub retry: RetryPolicy,
    /// Health-check cadence while ready in milliseconds (default: 30000)
    pub health_check_interval_ms: u64,
    /// Command engine settings
    pub engine: EngineConfig,
    /// Transitions kept in memory for `transitions()` (default: 256)
    pub transition_log_limit: usize,
    /// Subscriber channel capacity (default: 64)
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            device: DeviceKind::Obd,
            auto_reconnect: true,
            retry: RetryPolicy::default(),
            health_check_interval_ms: 30_000,
            engine: EngineConfig::default(),
            transition_log_limit: 256,
            event_capacity: 64,
        }
    }
}

impl ManagerConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }
}
