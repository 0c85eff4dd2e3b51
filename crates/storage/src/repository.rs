//! Repository Implementation

use crate::records::{
    ConnectionSessionRecord, DeviceEventRecord, DeviceKind, DeviceMetricRecord, SessionOutcome,
};
use crate::{DeviceEventSink, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

/// Retention limits per record type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_events: usize,
    pub max_sessions: usize,
    pub max_metrics: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_events: 10_000,
            max_sessions: 1_000,
            max_metrics: 50_000,
        }
    }
}

/// In-memory device repository, oldest records evicted first
pub struct DeviceRepository {
    events: Mutex<VecDeque<DeviceEventRecord>>,
    sessions: Mutex<VecDeque<ConnectionSessionRecord>>,
    metrics: Mutex<VecDeque<DeviceMetricRecord>>,
    retention: RetentionConfig,
    /// Next event/metric ID
    next_id: Mutex<i64>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StorageError> {
    mutex
        .lock()
        .map_err(|e| StorageError::DatabaseError(format!("Lock error: {}", e)))
}

fn push_bounded<T>(queue: &mut VecDeque<T>, record: T, max: usize) {
    while queue.len() >= max.max(1) {
        queue.pop_front();
    }
    queue.push_back(record);
}

impl DeviceRepository {
    pub fn new() -> Self {
        Self::with_retention(RetentionConfig::default())
    }

    pub fn with_retention(retention: RetentionConfig) -> Self {
        info!(
            "Creating in-memory device repository (events {}, sessions {}, metrics {})",
            retention.max_events, retention.max_sessions, retention.max_metrics
        );
        Self {
            events: Mutex::new(VecDeque::new()),
            sessions: Mutex::new(VecDeque::new()),
            metrics: Mutex::new(VecDeque::new()),
            retention,
            next_id: Mutex::new(1),
        }
    }

    fn allocate_id(&self) -> Result<i64, StorageError> {
        let mut id = lock(&self.next_id)?;
        let allocated = *id;
        *id += 1;
        Ok(allocated)
    }

    /// Most recent events for a device, newest first
    pub fn recent_events(
        &self,
        device: DeviceKind,
        limit: usize,
    ) -> Result<Vec<DeviceEventRecord>, StorageError> {
        let events = lock(&self.events)?;
        Ok(events
            .iter()
            .rev()
            .filter(|e| e.device == device)
            .take(limit)
            .cloned()
            .collect())
    }

    /// Events for a device at or after `since_ms`, oldest first
    pub fn events_since(
        &self,
        device: DeviceKind,
        since_ms: i64,
    ) -> Result<Vec<DeviceEventRecord>, StorageError> {
        let events = lock(&self.events)?;
        Ok(events
            .iter()
            .filter(|e| e.device == device && e.timestamp_ms >= since_ms)
            .cloned()
            .collect())
    }

    /// Most recent sessions for a device, newest first
    pub fn recent_sessions(
        &self,
        device: DeviceKind,
        limit: usize,
    ) -> Result<Vec<ConnectionSessionRecord>, StorageError> {
        let sessions = lock(&self.sessions)?;
        Ok(sessions
            .iter()
            .rev()
            .filter(|s| s.device == device)
            .take(limit)
            .cloned()
            .collect())
    }

    pub fn session(&self, id: Uuid) -> Result<ConnectionSessionRecord, StorageError> {
        let sessions = lock(&self.sessions)?;
        sessions
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("session {}", id)))
    }

    /// Metrics for a device, optionally filtered by name, newest first
    pub fn recent_metrics(
        &self,
        device: DeviceKind,
        name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DeviceMetricRecord>, StorageError> {
        let metrics = lock(&self.metrics)?;
        Ok(metrics
            .iter()
            .rev()
            .filter(|m| m.device == device && name.map_or(true, |n| m.name == n))
            .take(limit)
            .cloned()
            .collect())
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn metric_count(&self) -> usize {
        self.metrics.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.clear();
        }
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.clear();
        }
    }
}

impl Default for DeviceRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceEventSink for DeviceRepository {
    fn record_event(&self, mut event: DeviceEventRecord) -> Result<(), StorageError> {
        event.id = self.allocate_id()?;
        debug!(
            "{} {} -> {}",
            event.device, event.from_state, event.to_state
        );
        let mut events = lock(&self.events)?;
        push_bounded(&mut events, event, self.retention.max_events);
        Ok(())
    }

    fn start_session(&self, session: ConnectionSessionRecord) -> Result<(), StorageError> {
        debug!("Session {} started for {}", session.id, session.device);
        let mut sessions = lock(&self.sessions)?;
        push_bounded(&mut sessions, session, self.retention.max_sessions);
        Ok(())
    }

    fn finish_session(&self, id: Uuid, outcome: SessionOutcome) -> Result<(), StorageError> {
        let transitions_json = serde_json::to_string(&outcome.transitions)?;
        let mut sessions = lock(&self.sessions)?;
        let session = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StorageError::NotFound(format!("session {}", id)))?;

        session.ended_at_ms = Some(outcome.ended_at_ms);
        session.duration_ms = Some((outcome.ended_at_ms - session.started_at_ms).max(0));
        session.success = outcome.success;
        session.error = outcome.error;
        session.transitions_json = transitions_json;
        debug!(
            "Session {} finished (success: {})",
            session.id, session.success
        );
        Ok(())
    }

    fn record_metric(&self, mut metric: DeviceMetricRecord) -> Result<(), StorageError> {
        metric.id = self.allocate_id()?;
        let mut metrics = lock(&self.metrics)?;
        push_bounded(&mut metrics, metric, self.retention.max_metrics);
        Ok(())
    }
}
