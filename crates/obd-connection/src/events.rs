//! Observer notifications

use crate::state::{ConnectionState, Transition};
use obd_protocol::{AdapterInfo, DtcEntry, PidReading};
use serde::Serialize;

/// Broadcast to every subscriber of a manager
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    StateChanged(Transition),
    Connected {
        adapter: AdapterInfo,
    },
    Disconnected {
        reason: String,
    },
    Error {
        message: String,
        attempts: u32,
    },
    PidRead(PidReading),
    DtcRead {
        pending: bool,
        codes: Vec<DtcEntry>,
    },
    DtcCleared {
        acknowledged: bool,
    },
    /// Periodic nudge to check liveness; sent only while ready
    HealthCheckRequested,
}

impl ConnectionEvent {
    /// The new state, for `StateChanged`
    pub fn state(&self) -> Option<ConnectionState> {
        match self {
            ConnectionEvent::StateChanged(transition) => Some(transition.to),
            _ => None,
        }
    }
}
