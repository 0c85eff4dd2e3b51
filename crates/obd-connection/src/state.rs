//! Connection States and Legal Transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one device connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Initializing,
    Ready,
    Error,
    /// Waiting out a retry delay
    Backoff,
    /// Link lost while ready; a new connect cycle follows
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Initializing => "initializing",
            ConnectionState::Ready => "ready",
            ConnectionState::Error => "error",
            ConnectionState::Backoff => "backoff",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    /// Whether `self -> to` is an allowed edge
    pub fn can_transition_to(&self, to: ConnectionState) -> bool {
        use ConnectionState::*;

        // disconnect() is allowed from anywhere
        if to == Disconnected {
            return true;
        }
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Error, Connecting)
                | (Connecting, Initializing)
                | (Connecting, Backoff)
                | (Connecting, Error)
                | (Backoff, Connecting)
                | (Backoff, Initializing)
                | (Backoff, Error)
                | (Initializing, Ready)
                | (Initializing, Backoff)
                | (Initializing, Error)
                | (Ready, Reconnecting)
                | (Ready, Error)
                | (Reconnecting, Connecting)
                | (Reconnecting, Error)
        )
    }

    /// A connect cycle is running
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Initializing
                | ConnectionState::Backoff
                | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the transition log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl Transition {
    pub fn to_record(&self) -> storage::TransitionRecord {
        storage::TransitionRecord {
            from: self.from.to_string(),
            to: self.to.to_string(),
            timestamp_ms: self.at.timestamp_millis(),
            reason: self.reason.clone(),
        }
    }
}
