//! Bluetooth Classic (SPP/RFCOMM) transport
//!
//! The adapter is reached through the kernel's RFCOMM TTY binding. The
//! device path is whatever `rfcomm bind <n> <address> <channel>` created,
//! so it is always configured explicitly; the byte stream itself is handled
//! by [`SerialTransport`].

use super::{ConnectionInfo, SerialTransport, Transport, TransportEvent, TransportKind};
use crate::error::ObdError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

pub struct BluetoothTransport {
    address: String,
    channel: u8,
    inner: SerialTransport,
}

impl BluetoothTransport {
    /// Transport for `address`/`channel` bound on the RFCOMM TTY `device`
    pub fn new(address: &str, channel: u8, device: &str) -> Self {
        Self {
            address: address.to_uppercase(),
            channel,
            inner: SerialTransport::new(device, 38400).reporting_as(TransportKind::Bluetooth),
        }
    }

    pub fn with_baud_rate(self, baud_rate: u32) -> Self {
        let device = self.inner.path().to_string();
        Self {
            inner: SerialTransport::new(&device, baud_rate).reporting_as(TransportKind::Bluetooth),
            ..self
        }
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.inner = self.inner.with_open_timeout(timeout);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn device(&self) -> &str {
        self.inner.path()
    }
}

/// Six colon-separated hex octets
pub fn is_valid_address(address: &str) -> bool {
    let octets: Vec<&str> = address.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

#[async_trait]
impl Transport for BluetoothTransport {
    async fn open(&mut self) -> Result<mpsc::Receiver<TransportEvent>, ObdError> {
        if !is_valid_address(&self.address) {
            return Err(ObdError::Connection(format!(
                "Invalid Bluetooth address '{}'",
                self.address
            )));
        }
        if self.channel == 0 || self.channel > 30 {
            return Err(ObdError::Connection(format!(
                "Invalid RFCOMM channel {}",
                self.channel
            )));
        }

        let rx = self.inner.open().await.map_err(|e| match e {
            ObdError::Connection(msg) => ObdError::Connection(format!(
                "{} (is {} channel {} bound to {} with rfcomm?)",
                msg,
                self.address,
                self.channel,
                self.inner.path()
            )),
            other => other,
        })?;
        info!(
            "Bluetooth adapter {} connected on channel {} via {}",
            self.address,
            self.channel,
            self.inner.path()
        );
        Ok(rx)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ObdError> {
        self.inner.write(data).await
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            endpoint: format!("{}#{}", self.address, self.channel),
            ..self.inner.connection_info()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_validation() {
        assert!(is_valid_address("00:1D:A5:68:98:8B"));
        assert!(is_valid_address("aa:bb:cc:dd:ee:ff"));
        assert!(!is_valid_address("00:1D:A5:68:98"));
        assert!(!is_valid_address("00-1D-A5-68-98-8B"));
        assert!(!is_valid_address("GG:1D:A5:68:98:8B"));
    }

    #[test]
    fn test_connection_info() {
        let transport = BluetoothTransport::new("00:1d:a5:68:98:8b", 3, "/dev/rfcomm0");
        assert_eq!(transport.device(), "/dev/rfcomm0");
        let info = transport.connection_info();
        assert_eq!(info.kind, TransportKind::Bluetooth);
        assert_eq!(info.endpoint, "00:1D:A5:68:98:8B#3");
        assert_eq!(info.baud_rate, Some(38400));
    }

    #[tokio::test]
    async fn test_invalid_address_rejected_before_open() {
        let mut transport = BluetoothTransport::new("not-an-address", 1, "/dev/rfcomm0");
        let err = transport.open().await.unwrap_err();
        assert!(matches!(err, ObdError::Connection(ref msg) if msg.contains("Invalid Bluetooth")));
    }

    #[tokio::test]
    async fn test_unbound_device_is_connection_error() {
        let mut transport =
            BluetoothTransport::new("00:1D:A5:68:98:8B", 4, "/dev/rfcomm-missing");
        let err = transport.open().await.unwrap_err();
        match err {
            ObdError::Connection(msg) => {
                assert!(msg.contains("channel 4"));
                assert!(msg.contains("/dev/rfcomm-missing"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
