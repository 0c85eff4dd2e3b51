//! Storage Layer
//!
//! Append-only record of device connection activity: state transitions,
//! connection sessions and device metrics, keyed by device kind.

mod records;
mod repository;

pub use records::{
    ConnectionSessionRecord, DeviceEventRecord, DeviceKind, DeviceMetricRecord, SessionOutcome,
    TransitionRecord,
};
pub use repository::{DeviceRepository, RetentionConfig};

use thiserror::Error;
use uuid::Uuid;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}

/// Receiver of connection lifecycle data
///
/// Implementations must be cheap and non-blocking; they are called inline
/// from the connection manager.
pub trait DeviceEventSink: Send + Sync {
    fn record_event(&self, event: DeviceEventRecord) -> Result<(), StorageError>;

    fn start_session(&self, session: ConnectionSessionRecord) -> Result<(), StorageError>;

    fn finish_session(&self, id: Uuid, outcome: SessionOutcome) -> Result<(), StorageError>;

    fn record_metric(&self, metric: DeviceMetricRecord) -> Result<(), StorageError>;
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DeviceEventSink for NullSink {
    fn record_event(&self, _event: DeviceEventRecord) -> Result<(), StorageError> {
        Ok(())
    }

    fn start_session(&self, _session: ConnectionSessionRecord) -> Result<(), StorageError> {
        Ok(())
    }

    fn finish_session(&self, _id: Uuid, _outcome: SessionOutcome) -> Result<(), StorageError> {
        Ok(())
    }

    fn record_metric(&self, _metric: DeviceMetricRecord) -> Result<(), StorageError> {
        Ok(())
    }
}
