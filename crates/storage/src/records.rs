//! Record Types

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which physical device a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// OBD-II adapter
    Obd,
    /// Paint thickness gauge
    Thickness,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Obd => f.write_str("obd"),
            DeviceKind::Thickness => f.write_str("thickness"),
        }
    }
}

/// One state transition of a device connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: String,
    pub to: String,
    pub timestamp_ms: i64,
    pub reason: Option<String>,
}

/// State change event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEventRecord {
    /// Assigned by the repository on insert
    pub id: i64,
    pub device: DeviceKind,
    pub timestamp_ms: i64,
    pub from_state: String,
    pub to_state: String,
    pub reason: Option<String>,
    /// Session the transition happened in, if any
    pub session_id: Option<Uuid>,
}

/// A connect cycle from first attempt to disconnect or failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSessionRecord {
    pub id: Uuid,
    pub device: DeviceKind,
    /// Port path or Bluetooth address
    pub endpoint: String,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub duration_ms: Option<i64>,
    pub success: bool,
    pub error: Option<String>,
    /// JSON array of [`TransitionRecord`]
    pub transitions_json: String,
}

impl ConnectionSessionRecord {
    /// A freshly started session
    pub fn start(device: DeviceKind, endpoint: &str, started_at_ms: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            device,
            endpoint: endpoint.to_string(),
            started_at_ms,
            ended_at_ms: None,
            duration_ms: None,
            success: false,
            error: None,
            transitions_json: "[]".to_string(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at_ms.is_none()
    }

    pub fn transitions(&self) -> Result<Vec<TransitionRecord>, serde_json::Error> {
        serde_json::from_str(&self.transitions_json)
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub ended_at_ms: i64,
    /// Reached a usable connection at some point
    pub success: bool,
    pub error: Option<String>,
    pub transitions: Vec<TransitionRecord>,
}

/// A numeric measurement attributed to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetricRecord {
    /// Assigned by the repository on insert
    pub id: i64,
    pub device: DeviceKind,
    pub timestamp_ms: i64,
    pub name: String,
    pub value: f64,
    pub unit: Option<String>,
}

impl DeviceMetricRecord {
    pub fn new(
        device: DeviceKind,
        timestamp_ms: i64,
        name: &str,
        value: f64,
        unit: Option<&str>,
    ) -> Self {
        Self {
            id: 0,
            device,
            timestamp_ms,
            name: name.to_string(),
            value,
            unit: unit.map(str::to_string),
        }
    }
}
