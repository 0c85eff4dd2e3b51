//! Byte channels to the adapter
//!
//! A transport owns exactly one physical (or simulated) channel. Incoming
//! bytes are pushed to the receiver returned by [`Transport::open`]; the
//! command engine is the only consumer.

mod bluetooth;
mod serial;
mod simulated;

pub use bluetooth::{is_valid_address, BluetoothTransport};
pub use serial::SerialTransport;
pub use simulated::{SimulatedAdapter, SimulatedLink, SimulatedTransport};

use crate::error::ObdError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Capacity of the event channel between a transport and its reader
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// What happened on the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A chunk of bytes; may hold any fraction of a response
    Data(Vec<u8>),
    /// The peer or the OS closed the channel
    Closed,
    /// Read failure; the channel is unusable afterwards
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Serial,
    Bluetooth,
    Simulated,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => f.write_str("serial"),
            TransportKind::Bluetooth => f.write_str("bluetooth"),
            TransportKind::Simulated => f.write_str("simulated"),
        }
    }
}

/// Identity of an open (or openable) channel, for logs and status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub kind: TransportKind,
    /// Device path, Bluetooth address or simulator name
    pub endpoint: String,
    pub baud_rate: Option<u32>,
}

/// An exclusively-owned byte channel
#[async_trait]
pub trait Transport: Send {
    /// Open the channel and hand back the stream of incoming events
    ///
    /// Fails with `ObdError::Connection` when the endpoint is missing or
    /// refuses, and `ObdError::Timeout` when opening exceeds its deadline.
    async fn open(&mut self) -> Result<mpsc::Receiver<TransportEvent>, ObdError>;

    /// Write raw bytes to the channel
    async fn write(&mut self, data: &[u8]) -> Result<(), ObdError>;

    /// Close the channel. Idempotent.
    async fn close(&mut self);

    fn is_open(&self) -> bool;

    fn connection_info(&self) -> ConnectionInfo;
}

/// Produces a fresh transport for every connect attempt
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn Transport>;

    /// Where the transports connect to, without opening anything
    fn endpoint(&self) -> ConnectionInfo {
        self.create().connection_info()
    }
}

impl<F> TransportFactory for F
where
    F: Fn() -> Box<dyn Transport> + Send + Sync,
{
    fn create(&self) -> Box<dyn Transport> {
        self()
    }
}

fn default_baud_rate() -> u32 {
    38400
}

fn default_open_timeout_ms() -> u64 {
    5000
}

fn default_rfcomm_channel() -> u8 {
    1
}

/// Channel selection as it appears in configuration files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportSettings {
    Serial {
        path: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_open_timeout_ms")]
        open_timeout_ms: u64,
    },
    /// RFCOMM link bound to a TTY with `rfcomm bind`
    Bluetooth {
        address: String,
        #[serde(default = "default_rfcomm_channel")]
        channel: u8,
        /// The bound TTY, e.g. `/dev/rfcomm0`
        device: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_open_timeout_ms")]
        open_timeout_ms: u64,
    },
    Simulated {
        #[serde(default)]
        latency_ms: u64,
    },
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings::Simulated { latency_ms: 20 }
    }
}

impl TransportSettings {
    /// Check the endpoint description without touching the device
    pub fn validate(&self) -> Result<(), String> {
        match self {
            TransportSettings::Serial { path, baud_rate, .. } => {
                if path.trim().is_empty() {
                    return Err("serial path must not be empty".into());
                }
                if *baud_rate == 0 {
                    return Err("serial baud rate must be positive".into());
                }
            }
            TransportSettings::Bluetooth {
                address,
                channel,
                device,
                ..
            } => {
                if !is_valid_address(address) {
                    return Err(format!("invalid Bluetooth address '{}'", address));
                }
                if !(1..=30).contains(channel) {
                    return Err(format!("RFCOMM channel {} out of range 1-30", channel));
                }
                if device.trim().is_empty() {
                    return Err("Bluetooth device path must not be empty".into());
                }
            }
            TransportSettings::Simulated { .. } => {}
        }
        Ok(())
    }
}

impl TransportFactory for TransportSettings {
    fn create(&self) -> Box<dyn Transport> {
        match self {
            TransportSettings::Serial {
                path,
                baud_rate,
                open_timeout_ms,
            } => Box::new(
                SerialTransport::new(path, *baud_rate)
                    .with_open_timeout(Duration::from_millis(*open_timeout_ms)),
            ),
            TransportSettings::Bluetooth {
                address,
                channel,
                device,
                baud_rate,
                open_timeout_ms,
            } => Box::new(
                BluetoothTransport::new(address, *channel, device)
                    .with_baud_rate(*baud_rate)
                    .with_open_timeout(Duration::from_millis(*open_timeout_ms)),
            ),
            TransportSettings::Simulated { latency_ms } => Box::new(
                SimulatedTransport::new(SimulatedAdapter::default())
                    .with_latency(Duration::from_millis(*latency_ms)),
            ),
        }
    }

    fn endpoint(&self) -> ConnectionInfo {
        match self {
            TransportSettings::Serial {
                path, baud_rate, ..
            } => ConnectionInfo {
                kind: TransportKind::Serial,
                endpoint: path.clone(),
                baud_rate: Some(*baud_rate),
            },
            TransportSettings::Bluetooth {
                address,
                channel,
                baud_rate,
                ..
            } => ConnectionInfo {
                kind: TransportKind::Bluetooth,
                endpoint: format!("{}#{}", address.to_uppercase(), channel),
                baud_rate: Some(*baud_rate),
            },
            TransportSettings::Simulated { .. } => self.create().connection_info(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_tagged_json() {
        let settings: TransportSettings =
            serde_json::from_str(r#"{"type":"serial","path":"/dev/ttyUSB0"}"#).unwrap();
        assert_eq!(
            settings,
            TransportSettings::Serial {
                path: "/dev/ttyUSB0".to_string(),
                baud_rate: 38400,
                open_timeout_ms: 5000,
            }
        );
    }

    #[test]
    fn test_factory_builds_matching_kind() {
        let bt = TransportSettings::Bluetooth {
            address: "00:1D:A5:68:98:8B".to_string(),
            channel: 2,
            device: "/dev/rfcomm0".to_string(),
            baud_rate: 38400,
            open_timeout_ms: 1000,
        };
        let transport = bt.create();
        assert_eq!(transport.connection_info().kind, TransportKind::Bluetooth);
        assert_eq!(bt.endpoint(), transport.connection_info());
        assert!(!transport.is_open());

        let sim = TransportSettings::default().create();
        assert_eq!(sim.connection_info().kind, TransportKind::Simulated);
    }

    #[test]
    fn test_validate_settings() {
        assert!(TransportSettings::default().validate().is_ok());

        let bad_address = TransportSettings::Bluetooth {
            address: "00:1D:A5".to_string(),
            channel: 1,
            device: "/dev/rfcomm0".to_string(),
            baud_rate: 38400,
            open_timeout_ms: 1000,
        };
        assert!(bad_address.validate().unwrap_err().contains("address"));

        let bad_channel = TransportSettings::Bluetooth {
            address: "00:1D:A5:68:98:8B".to_string(),
            channel: 31,
            device: "/dev/rfcomm0".to_string(),
            baud_rate: 38400,
            open_timeout_ms: 1000,
        };
        assert!(bad_channel.validate().is_err());

        let no_device = TransportSettings::Bluetooth {
            address: "00:1D:A5:68:98:8B".to_string(),
            channel: 1,
            device: String::new(),
            baud_rate: 38400,
            open_timeout_ms: 1000,
        };
        assert!(no_device.validate().unwrap_err().contains("device"));

        let empty_path = TransportSettings::Serial {
            path: " ".to_string(),
            baud_rate: 38400,
            open_timeout_ms: 1000,
        };
        assert!(empty_path.validate().is_err());
    }

    #[test]
    fn test_closure_factory() {
        let factory =
            || -> Box<dyn Transport> { Box::new(SerialTransport::new("/dev/null", 9600)) };
        let transport = factory.create();
        assert_eq!(transport.connection_info().baud_rate, Some(9600));
    }
}
