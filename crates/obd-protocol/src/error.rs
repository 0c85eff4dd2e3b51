//! OBD-II Error Types

use thiserror::Error;

/// Errors that can occur during OBD-II communication
///
/// Variants carry owned strings so a single outcome can be cloned out to every
/// caller waiting on the same connect attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObdError {
    /// Channel unavailable, adapter rejected init, or bus init failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// The channel was closed while the command was queued or in flight
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Command or connect-phase deadline exceeded
    #[error("Timeout waiting for '{command}' after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    /// PID or mode not present in the decoder registry
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Garbled or truncated adapter response
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ObdError {
    /// Whether this error means the channel itself is gone
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, ObdError::Connection(_) | ObdError::ConnectionClosed(_))
    }
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::Connection(err.to_string())
    }
}

impl From<tokio_serial::Error> for ObdError {
    fn from(err: tokio_serial::Error) -> Self {
        ObdError::Connection(format!("Serial port error: {}", err))
    }
}
