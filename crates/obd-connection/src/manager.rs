//! Connection Manager
//!
//! Drives one device through `Disconnected → Connecting → Initializing →
//! Ready`, retrying with backoff, reconnecting after link loss and asking
//! its owner for periodic health checks. Concurrent `connect()` calls share a
//! single attempt.

use crate::clock::{Clock, TokioClock};
use crate::config::ManagerConfig;
use crate::events::ConnectionEvent;
use crate::state::{ConnectionState, Transition};
use chrono::{DateTime, Utc};
use metrics::counter;
use obd_protocol::{
    AdapterInfo, DtcDatabase, DtcEntry, EngineStats, LinkStatus, ObdClient, ObdError, PidReading,
    PidRegistry, ProtocolSelector, TransportFactory, VehicleInfo, VehicleProfile,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use storage::{
    ConnectionSessionRecord, DeviceEventRecord, DeviceEventSink, DeviceMetricRecord, NullSink,
    SessionOutcome,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type Outcome = Option<Result<(), ObdError>>;

/// Point-in-time view for status displays
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub device: storage::DeviceKind,
    pub state: ConnectionState,
    /// Failed attempts since the last time the device was ready
    pub reconnect_attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    /// A connect cycle is running after at least one failure
    pub retrying: bool,
    /// Attempts exhausted; operator action needed
    pub failed: bool,
    /// Vehicle-specific hint for the operator
    pub guidance: Option<String>,
    pub vehicle: Option<VehicleInfo>,
    pub adapter: Option<AdapterInfo>,
    pub session_id: Option<Uuid>,
    pub connected_since: Option<DateTime<Utc>>,
    pub engine: Option<EngineStats>,
}

struct Session {
    id: Uuid,
    reached_ready: bool,
    transitions: Vec<Transition>,
}

#[derive(Default)]
struct Shared {
    state: ConnectionState,
    transitions: VecDeque<Transition>,
    reconnect_attempts: u32,
    last_error: Option<String>,
    /// Bumped on disconnect and on every new cycle; stale work checks it
    generation: u64,
    vehicle: Option<VehicleInfo>,
    guidance: Option<String>,
    client: Option<ObdClient>,
    adapter: Option<AdapterInfo>,
    connected_since: Option<DateTime<Utc>>,
    session: Option<Session>,
    in_flight: Option<watch::Receiver<Outcome>>,
    cycle_task: Option<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
    monitor_task: Option<JoinHandle<()>>,
}

impl Shared {
    fn stop_ready_tasks(&mut self) {
        if let Some(task) = self.health_task.take() {
            task.abort();
        }
        if let Some(task) = self.monitor_task.take() {
            task.abort();
        }
    }
}

struct Inner {
    config: ManagerConfig,
    factory: Arc<dyn TransportFactory>,
    sink: Arc<dyn DeviceEventSink>,
    clock: Arc<dyn Clock>,
    selector: ProtocolSelector,
    registry: Arc<PidRegistry>,
    dtc_database: Arc<DtcDatabase>,
    events: broadcast::Sender<ConnectionEvent>,
    shared: Mutex<Shared>,
}

/// Builder for [`ConnectionManager`]
pub struct ConnectionManagerBuilder {
    config: ManagerConfig,
    factory: Arc<dyn TransportFactory>,
    sink: Arc<dyn DeviceEventSink>,
    clock: Arc<dyn Clock>,
    selector: ProtocolSelector,
    registry: Arc<PidRegistry>,
    dtc_database: Arc<DtcDatabase>,
}

impl ConnectionManagerBuilder {
    pub fn sink(mut self, sink: Arc<dyn DeviceEventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn selector(mut self, selector: ProtocolSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn pid_registry(mut self, registry: PidRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn dtc_database(mut self, database: DtcDatabase) -> Self {
        self.dtc_database = Arc::new(database);
        self
    }

    pub fn build(self) -> ConnectionManager {
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        ConnectionManager {
            inner: Arc::new(Inner {
                config: self.config,
                factory: self.factory,
                sink: self.sink,
                clock: self.clock,
                selector: self.selector,
                registry: self.registry,
                dtc_database: self.dtc_database,
                events,
                shared: Mutex::new(Shared::default()),
            }),
        }
    }
}

/// Lifecycle owner for one device; cheap to clone
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn builder(
        config: ManagerConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            config,
            factory,
            sink: Arc::new(NullSink),
            clock: Arc::new(TokioClock),
            selector: ProtocolSelector::new(),
            registry: Arc::new(PidRegistry::standard()),
            dtc_database: Arc::new(DtcDatabase::standard()),
        }
    }

    pub fn new(config: ManagerConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self::builder(config, factory).build()
    }

    /// Connect to `vehicle`, or join the attempt already running
    ///
    /// Returns at once when the device is already ready.
    pub async fn connect(&self, vehicle: VehicleInfo) -> Result<(), ObdError> {
        let mut outcome = {
            let mut shared = self.inner.lock();
            if shared.state == ConnectionState::Ready {
                return Ok(());
            }
            match shared.in_flight.clone() {
                Some(outcome) => {
                    debug!("Joining connect attempt already in progress");
                    outcome
                }
                None => self.inner.start_cycle(&mut shared, vehicle),
            }
        };

        let result = outcome
            .wait_for(|outcome| outcome.is_some())
            .await
            .map(|outcome| outcome.clone());
        match result {
            Ok(Some(result)) => result,
            _ => Err(ObdError::ConnectionClosed(
                "Connect attempt was cancelled".into(),
            )),
        }
    }

    /// Drop the connection from any state. Idempotent.
    pub async fn disconnect(&self) {
        let client = {
            let mut shared = self.inner.lock();
            shared.generation += 1;
            shared.stop_ready_tasks();
            if let Some(task) = shared.cycle_task.take() {
                task.abort();
            }
            shared.in_flight = None;
            shared.connected_since = None;
            shared.adapter = None;

            if shared.state != ConnectionState::Disconnected {
                self.inner.transition(
                    &mut shared,
                    ConnectionState::Disconnected,
                    "Disconnect requested",
                );
                self.inner.finish_session(&mut shared, None);
                shared.reconnect_attempts = 0;
                self.inner.emit(ConnectionEvent::Disconnected {
                    reason: "Disconnect requested".into(),
                });
            }
            shared.client.take()
        };

        if let Some(client) = client {
            client.close().await;
        }
    }

    pub fn status(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Transition log, oldest first
    pub fn transitions(&self) -> Vec<Transition> {
        self.inner.lock().transitions.iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let shared = self.inner.lock();
        let state = shared.state;
        let retrying = state.is_busy()
            && (shared.reconnect_attempts > 0
                || matches!(state, ConnectionState::Backoff | ConnectionState::Reconnecting));

        ConnectionSnapshot {
            device: self.inner.config.device,
            state,
            reconnect_attempts: shared.reconnect_attempts,
            max_attempts: self.inner.config.retry.attempts(),
            last_error: shared.last_error.clone(),
            retrying,
            failed: state == ConnectionState::Error,
            guidance: shared.guidance.clone(),
            vehicle: shared.vehicle.clone(),
            adapter: shared.adapter.clone(),
            session_id: shared.session.as_ref().map(|s| s.id),
            connected_since: shared.connected_since,
            engine: shared.client.as_ref().map(|c| c.stats()),
        }
    }

    /// Read and decode a Mode 01 PID
    pub async fn read_pid(&self, pid: &str) -> Result<PidReading, ObdError> {
        let client = self.inner.ready_client()?;
        let reading = client.read_pid(pid).await?;
        if let Some(value) = reading.value {
            self.inner
                .record_metric(&format!("pid_{}", reading.pid), value, Some(&reading.unit));
        }
        self.inner.emit(ConnectionEvent::PidRead(reading.clone()));
        Ok(reading)
    }

    pub async fn read_dtc(&self) -> Result<Vec<DtcEntry>, ObdError> {
        let codes = self.inner.ready_client()?.read_dtc().await?;
        self.inner.record_metric("dtc_count", codes.len() as f64, None);
        self.inner.emit(ConnectionEvent::DtcRead {
            pending: false,
            codes: codes.clone(),
        });
        Ok(codes)
    }

    pub async fn read_pending_dtc(&self) -> Result<Vec<DtcEntry>, ObdError> {
        let codes = self.inner.ready_client()?.read_pending_dtc().await?;
        self.inner.emit(ConnectionEvent::DtcRead {
            pending: true,
            codes: codes.clone(),
        });
        Ok(codes)
    }

    pub async fn clear_dtc(&self) -> Result<bool, ObdError> {
        let acknowledged = self.inner.ready_client()?.clear_dtc().await?;
        self.inner.emit(ConnectionEvent::DtcCleared { acknowledged });
        Ok(acknowledged)
    }

    pub async fn read_vin(&self) -> Result<String, ObdError> {
        self.inner.ready_client()?.read_vin().await
    }

    /// Liveness check: adapter supply voltage via `ATRV`
    pub async fn read_voltage(&self) -> Result<f64, ObdError> {
        let volts = self.inner.ready_client()?.read_voltage().await?;
        self.inner.record_metric("battery_voltage", volts, Some("V"));
        Ok(volts)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn ready_client(&self) -> Result<ObdClient, ObdError> {
        let shared = self.lock();
        match (&shared.client, shared.state) {
            (Some(client), ConnectionState::Ready) => Ok(client.clone()),
            (_, state) => Err(ObdError::Connection(format!(
                "{} device not ready (state: {})",
                self.config.device, state
            ))),
        }
    }

    fn record_metric(&self, name: &str, value: f64, unit: Option<&str>) {
        let metric = DeviceMetricRecord::new(
            self.config.device,
            self.clock.now().timestamp_millis(),
            name,
            value,
            unit,
        );
        if let Err(e) = self.sink.record_metric(metric) {
            warn!("Failed to record metric {}: {}", name, e);
        }
    }

    /// Apply a state change if the edge is legal; returns whether it was
    fn transition(&self, shared: &mut Shared, to: ConnectionState, reason: &str) -> bool {
        let from = shared.state;
        if from == to {
            return true;
        }
        if !from.can_transition_to(to) {
            warn!("Refusing illegal transition {} -> {} ({})", from, to, reason);
            return false;
        }

        let transition = Transition {
            from,
            to,
            at: self.clock.now(),
            reason: Some(reason.to_string()),
        };
        shared.state = to;
        info!("State transition: {} -> {} ({})", from, to, reason);
        counter!(
            "device_state_transitions_total",
            "device" => self.config.device.to_string(),
            "to" => to.as_str()
        )
        .increment(1);

        while shared.transitions.len() >= self.config.transition_log_limit.max(1) {
            shared.transitions.pop_front();
        }
        shared.transitions.push_back(transition.clone());

        let session_id = shared.session.as_mut().map(|session| {
            session.transitions.push(transition.clone());
            if to == ConnectionState::Ready {
                session.reached_ready = true;
            }
            session.id
        });

        let record = DeviceEventRecord {
            id: 0,
            device: self.config.device,
            timestamp_ms: transition.at.timestamp_millis(),
            from_state: from.to_string(),
            to_state: to.to_string(),
            reason: transition.reason.clone(),
            session_id,
        };
        if let Err(e) = self.sink.record_event(record) {
            warn!("Failed to record state event: {}", e);
        }

        self.emit(ConnectionEvent::StateChanged(transition));
        true
    }

    /// Apply a transition on behalf of cycle `generation`
    fn transition_for(
        &self,
        generation: u64,
        to: ConnectionState,
        reason: &str,
    ) -> Result<(), ObdError> {
        let mut shared = self.lock();
        if shared.generation != generation {
            return Err(ObdError::ConnectionClosed("Connect attempt was cancelled".into()));
        }
        self.transition(&mut shared, to, reason);
        Ok(())
    }

    fn start_session(&self, shared: &mut Shared, endpoint: &str) {
        let record = ConnectionSessionRecord::start(
            self.config.device,
            endpoint,
            self.clock.now().timestamp_millis(),
        );
        let id = record.id;
        if let Err(e) = self.sink.start_session(record) {
            warn!("Failed to record session start: {}", e);
        }
        shared.session = Some(Session {
            id,
            reached_ready: false,
            transitions: Vec::new(),
        });
    }

    fn finish_session(&self, shared: &mut Shared, error: Option<String>) {
        let Some(session) = shared.session.take() else {
            return;
        };
        let outcome = SessionOutcome {
            ended_at_ms: self.clock.now().timestamp_millis(),
            success: session.reached_ready,
            error,
            transitions: session.transitions.iter().map(Transition::to_record).collect(),
        };
        if let Err(e) = self.sink.finish_session(session.id, outcome) {
            warn!("Failed to record session end: {}", e);
        }
    }

    /// Spawn a connect cycle and return the receiver for its outcome
    fn start_cycle(
        self: &Arc<Self>,
        shared: &mut Shared,
        vehicle: VehicleInfo,
    ) -> watch::Receiver<Outcome> {
        shared.generation += 1;
        let generation = shared.generation;

        let profile = self.selector.get_profile(&vehicle.make, vehicle.year).clone();
        shared.guidance = profile.guidance();
        shared.vehicle = Some(vehicle);
        if shared.session.is_none() {
            shared.reconnect_attempts = 0;
            let endpoint = self.factory.endpoint();
            self.start_session(shared, &endpoint.endpoint);
        }

        let (done, outcome) = watch::channel(None);
        shared.in_flight = Some(outcome.clone());

        let inner = Arc::clone(self);
        shared.cycle_task = Some(tokio::spawn(async move {
            let result = inner.run_cycle(generation, &profile).await;
            {
                let mut shared = inner.lock();
                if shared.generation == generation {
                    shared.in_flight = None;
                    shared.cycle_task = None;
                }
            }
            let _ = done.send(Some(result));
        }));
        outcome
    }

    async fn open_client(&self) -> Result<ObdClient, ObdError> {
        let transport = self.factory.create();
        let engine =
            obd_protocol::EngineHandle::start(transport, self.config.engine.clone()).await?;
        Ok(ObdClient::new(
            engine,
            Arc::clone(&self.registry),
            Arc::clone(&self.dtc_database),
        ))
    }

    /// Count a failed attempt; `true` when the budget is used up
    fn attempt_failed(
        &self,
        generation: u64,
        phase: &str,
        attempt: u32,
        err: &ObdError,
    ) -> Result<bool, ObdError> {
        let mut shared = self.lock();
        if shared.generation != generation {
            return Err(ObdError::ConnectionClosed("Connect attempt was cancelled".into()));
        }
        shared.reconnect_attempts += 1;
        shared.last_error = Some(err.to_string());
        counter!(
            "device_connect_failures_total",
            "device" => self.config.device.to_string(),
            "phase" => phase.to_string()
        )
        .increment(1);
        warn!(
            "{} attempt {}/{} failed: {}",
            phase,
            attempt,
            self.config.retry.attempts(),
            err
        );
        Ok(attempt >= self.config.retry.attempts())
    }

    async fn backoff(
        &self,
        generation: u64,
        phase: ConnectionState,
        attempt: u32,
    ) -> Result<(), ObdError> {
        let delay = self.config.retry.delay(attempt);
        self.transition_for(
            generation,
            ConnectionState::Backoff,
            &format!("Retrying {} in {}ms", phase, delay.as_millis()),
        )?;
        self.clock.sleep(delay).await;
        self.transition_for(
            generation,
            phase,
            &format!("{} attempt {}", phase, attempt + 1),
        )
    }

    async fn run_cycle(
        self: &Arc<Self>,
        generation: u64,
        profile: &VehicleProfile,
    ) -> Result<(), ObdError> {
        self.transition_for(generation, ConnectionState::Connecting, "Opening transport")?;

        let mut attempt = 0;
        let mut client = loop {
            attempt += 1;
            match self.open_client().await {
                Ok(client) => break client,
                Err(e) => {
                    if self.attempt_failed(generation, "connect", attempt, &e)? {
                        return self.fail(generation, e);
                    }
                    self.backoff(generation, ConnectionState::Connecting, attempt).await?;
                }
            }
        };

        self.transition_for(
            generation,
            ConnectionState::Initializing,
            "Transport open, initializing adapter",
        )?;

        attempt = 0;
        loop {
            attempt += 1;
            let result = if client.is_open() {
                client.initialize(profile).await
            } else {
                match self.open_client().await {
                    Ok(fresh) => {
                        client = fresh;
                        client.initialize(profile).await
                    }
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok(adapter) => return self.become_ready(generation, client, adapter),
                Err(e) => {
                    let exhausted = match self.attempt_failed(generation, "init", attempt, &e) {
                        Ok(exhausted) => exhausted,
                        Err(cancelled) => {
                            client.close().await;
                            return Err(cancelled);
                        }
                    };
                    if exhausted {
                        client.close().await;
                        return self.fail(generation, e);
                    }
                    let waited = self
                        .backoff(generation, ConnectionState::Initializing, attempt)
                        .await;
                    if let Err(cancelled) = waited {
                        client.close().await;
                        return Err(cancelled);
                    }
                }
            }
        }
    }

    fn fail(&self, generation: u64, err: ObdError) -> Result<(), ObdError> {
        let mut shared = self.lock();
        if shared.generation != generation {
            return Err(err);
        }
        error!("{} connection failed: {}", self.config.device, err);
        shared.last_error = Some(err.to_string());
        self.transition(&mut shared, ConnectionState::Error, &err.to_string());
        self.finish_session(&mut shared, Some(err.to_string()));
        self.emit(ConnectionEvent::Error {
            message: err.to_string(),
            attempts: shared.reconnect_attempts,
        });
        Err(err)
    }

    fn become_ready(
        self: &Arc<Self>,
        generation: u64,
        client: ObdClient,
        adapter: AdapterInfo,
    ) -> Result<(), ObdError> {
        let mut shared = self.lock();
        if shared.generation != generation {
            tokio::spawn(async move { client.close().await });
            return Err(ObdError::ConnectionClosed("Connect attempt was cancelled".into()));
        }

        shared.reconnect_attempts = 0;
        shared.last_error = None;
        shared.connected_since = Some(self.clock.now());
        shared.adapter = Some(adapter.clone());
        let link = client.link_status();
        shared.client = Some(client);
        self.transition(
            &mut shared,
            ConnectionState::Ready,
            &format!("Adapter ready on {}", adapter.protocol),
        );

        shared.stop_ready_tasks();
        shared.health_task = Some(tokio::spawn(health_check_loop(
            Arc::downgrade(self),
            generation,
            self.config.health_check_interval(),
        )));
        shared.monitor_task = Some(tokio::spawn(monitor_link(
            Arc::downgrade(self),
            generation,
            link,
        )));

        self.emit(ConnectionEvent::Connected { adapter });
        Ok(())
    }

    fn on_link_lost(self: &Arc<Self>, generation: u64, reason: String) {
        let mut shared = self.lock();
        if shared.generation != generation || shared.state != ConnectionState::Ready {
            return;
        }
        warn!("{} link lost: {}", self.config.device, reason);
        counter!("device_link_lost_total", "device" => self.config.device.to_string()).increment(1);

        shared.stop_ready_tasks();
        shared.client = None;
        shared.adapter = None;
        shared.connected_since = None;
        shared.last_error = Some(reason.clone());

        let lost = format!("Connection lost: {}", reason);
        if !self.config.auto_reconnect {
            self.transition(&mut shared, ConnectionState::Disconnected, &lost);
            self.finish_session(&mut shared, Some(reason.clone()));
            self.emit(ConnectionEvent::Disconnected { reason });
            return;
        }

        self.transition(&mut shared, ConnectionState::Reconnecting, &lost);
        match shared.vehicle.clone() {
            Some(vehicle) => {
                self.start_cycle(&mut shared, vehicle);
            }
            None => {
                self.transition(&mut shared, ConnectionState::Error, "No vehicle to reconnect to");
            }
        }
    }
}

async fn health_check_loop(inner: Weak<Inner>, generation: u64, period: std::time::Duration) {
    loop {
        let Some(clock) = inner.upgrade().map(|inner| Arc::clone(&inner.clock)) else {
            return;
        };
        clock.tick(period).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        {
            let shared = inner.lock();
            if shared.generation != generation || shared.state != ConnectionState::Ready {
                return;
            }
        }
        debug!("Requesting {} health check", inner.config.device);
        inner.emit(ConnectionEvent::HealthCheckRequested);
    }
}

async fn monitor_link(inner: Weak<Inner>, generation: u64, mut link: watch::Receiver<LinkStatus>) {
    let status = link
        .wait_for(|status| *status != LinkStatus::Open)
        .await
        .map(|status| status.clone());
    let reason = match status {
        Ok(LinkStatus::Lost(reason)) => reason,
        Ok(_) => return,
        Err(_) => "Command engine stopped".to_string(),
    };
    if let Some(inner) = inner.upgrade() {
        inner.on_link_lost(generation, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RecordingClock;
    use crate::retry::RetryPolicy;
    use obd_protocol::transport::{SimulatedAdapter, SimulatedLink, SimulatedTransport};
    use obd_protocol::{ConnectionInfo, Transport, TransportKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use storage::{DeviceKind, DeviceRepository};

    fn simulated_factory(
        link: &SimulatedLink,
        adapter: SimulatedAdapter,
    ) -> Arc<dyn TransportFactory> {
        let link = link.clone();
        Arc::new(move || -> Box<dyn Transport> {
            Box::new(SimulatedTransport::new(adapter.clone()).with_link(link.clone()))
        })
    }

    fn default_factory(link: &SimulatedLink) -> Arc<dyn TransportFactory> {
        simulated_factory(link, SimulatedAdapter::default())
    }

    fn config(max_attempts: u32) -> ManagerConfig {
        ManagerConfig {
            retry: RetryPolicy {
                max_attempts,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn toyota() -> VehicleInfo {
        VehicleInfo::new("Toyota", Some(2015))
    }

    #[tokio::test]
    async fn test_connect_reaches_ready() {
        let link = SimulatedLink::new();
        let repo = Arc::new(DeviceRepository::new());
        let manager = ConnectionManager::builder(config(3), default_factory(&link))
            .sink(repo.clone())
            .build();

        manager.connect(toyota()).await.unwrap();
        assert_eq!(manager.status(), ConnectionState::Ready);

        let states: Vec<ConnectionState> =
            manager.transitions().iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Initializing,
                ConnectionState::Ready
            ]
        );
        assert_eq!(repo.recent_events(DeviceKind::Obd, 10).unwrap().len(), 3);

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert!(!snapshot.retrying);
        assert!(snapshot.adapter.is_some());
        assert!(snapshot.session_id.is_some());
    }

    #[tokio::test]
    async fn test_open_failures_then_success_resets_attempts() {
        let link = SimulatedLink::new();
        link.fail_next_opens(2);
        let clock = Arc::new(RecordingClock::new());
        let manager = ConnectionManager::builder(config(5), default_factory(&link))
            .clock(clock.clone())
            .build();

        manager.connect(toyota()).await.unwrap();
        assert_eq!(manager.status(), ConnectionState::Ready);
        assert_eq!(link.opens(), 3);
        assert_eq!(manager.snapshot().reconnect_attempts, 0);
        assert_eq!(clock.sleeps().len(), 2);

        let backoffs = manager
            .transitions()
            .iter()
            .filter(|t| t.to == ConnectionState::Backoff)
            .count();
        assert_eq!(backoffs, 2);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_settle_in_error() {
        let link = SimulatedLink::new();
        link.fail_next_opens(100);
        let repo = Arc::new(DeviceRepository::new());
        let manager = ConnectionManager::builder(config(3), default_factory(&link))
            .clock(Arc::new(RecordingClock::new()))
            .sink(repo.clone())
            .build();
        let mut events = manager.subscribe();

        let err = manager.connect(toyota()).await.unwrap_err();
        assert!(matches!(err, ObdError::Connection(_)));
        assert_eq!(manager.status(), ConnectionState::Error);
        assert_eq!(link.opens(), 3);

        let snapshot = manager.snapshot();
        assert!(snapshot.failed);
        assert!(!snapshot.retrying);
        assert_eq!(snapshot.reconnect_attempts, 3);
        assert!(snapshot.last_error.is_some());

        tokio::task::yield_now().await;
        assert_eq!(link.opens(), 3);

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::Error { attempts, .. } = event {
                assert_eq!(attempts, 3);
                saw_error = true;
            }
        }
        assert!(saw_error);

        let session = &repo.recent_sessions(DeviceKind::Obd, 1).unwrap()[0];
        assert!(!session.success);
        assert!(session.error.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_attempt() {
        let link = SimulatedLink::new();
        let adapter = SimulatedAdapter::default();
        let manager = ConnectionManager::new(config(3), simulated_factory(&link, adapter));

        let (first, second) = tokio::join!(manager.connect(toyota()), manager.connect(toyota()));
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(link.opens(), 1);
    }

    #[tokio::test]
    async fn test_init_failure_retries_then_errors() {
        let link = SimulatedLink::new();
        let adapter = SimulatedAdapter::default().with_response("ATZ", "?");
        let clock = Arc::new(RecordingClock::new());
        let manager = ConnectionManager::builder(config(2), simulated_factory(&link, adapter))
            .clock(clock.clone())
            .build();

        let err = manager.connect(toyota()).await.unwrap_err();
        assert!(matches!(err, ObdError::Connection(ref msg) if msg.contains("reset")));
        assert_eq!(manager.status(), ConnectionState::Error);
        assert_eq!(clock.sleeps().len(), 1);

        let resets = link.writes().iter().filter(|w| *w == "ATZ").count();
        assert_eq!(resets, 2);
    }

    #[tokio::test]
    async fn test_operations_require_ready() {
        let link = SimulatedLink::new();
        let manager = ConnectionManager::new(config(1), default_factory(&link));
        let err = manager.read_pid("0C").await.unwrap_err();
        assert!(matches!(err, ObdError::Connection(ref msg) if msg.contains("not ready")));
        assert!(link.writes().is_empty());
    }

    #[tokio::test]
    async fn test_reads_emit_events() {
        let link = SimulatedLink::new();
        let manager = ConnectionManager::new(config(1), default_factory(&link));
        manager.connect(toyota()).await.unwrap();
        let mut events = manager.subscribe();

        let rpm = manager.read_pid("0C").await.unwrap();
        assert_eq!(rpm.value, Some(1726.0));
        let codes = manager.read_dtc().await.unwrap();
        assert_eq!(codes.len(), 3);
        assert!(manager.clear_dtc().await.unwrap());

        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::PidRead(ref r) if r.pid == "0C"
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::DtcRead { pending: false, .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::DtcCleared { acknowledged: true }
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let link = SimulatedLink::new();
        let repo = Arc::new(DeviceRepository::new());
        let manager = ConnectionManager::builder(config(1), default_factory(&link))
            .sink(repo.clone())
            .build();
        manager.connect(toyota()).await.unwrap();

        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(manager.status(), ConnectionState::Disconnected);
        assert!(!link.is_connected());

        let disconnects = manager
            .transitions()
            .iter()
            .filter(|t| t.to == ConnectionState::Disconnected)
            .count();
        assert_eq!(disconnects, 1);

        let session = &repo.recent_sessions(DeviceKind::Obd, 1).unwrap()[0];
        assert!(session.success);
        assert_eq!(session.transitions().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_backoff() {
        let link = SimulatedLink::new();
        link.fail_next_opens(100);
        let manager = ConnectionManager::new(config(5), default_factory(&link));

        let connecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(toyota()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.status(), ConnectionState::Backoff);

        manager.disconnect().await;
        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(ObdError::ConnectionClosed(_))));
        assert_eq!(manager.status(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(link.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_only_while_ready() {
        let link = SimulatedLink::new();
        let cfg = ManagerConfig {
            health_check_interval_ms: 1_000,
            ..config(1)
        };
        let manager = ConnectionManager::new(cfg, default_factory(&link));
        let mut events = manager.subscribe();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(events.try_recv().is_err());

        manager.connect(toyota()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        let checks = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, ConnectionEvent::HealthCheckRequested))
            .count();
        assert_eq!(checks, 2);

        manager.disconnect().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        let after = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, ConnectionEvent::HealthCheckRequested))
            .count();
        assert_eq!(after, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_waits_on_injected_clock() {
        let link = SimulatedLink::new();
        let clock = Arc::new(RecordingClock::new());
        let cfg = ManagerConfig {
            health_check_interval_ms: 750,
            ..config(1)
        };
        let manager = ConnectionManager::builder(cfg, default_factory(&link))
            .clock(clock.clone())
            .build();

        manager.connect(toyota()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_600)).await;
        manager.disconnect().await;

        let ticks = clock.ticks();
        assert!(ticks.len() >= 2);
        assert!(ticks.iter().all(|t| *t == Duration::from_millis(750)));
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_session_endpoint_comes_from_factory() {
        struct Counting {
            link: SimulatedLink,
            created: AtomicU32,
        }

        impl TransportFactory for Counting {
            fn create(&self) -> Box<dyn Transport> {
                self.created.fetch_add(1, Ordering::SeqCst);
                let transport = SimulatedTransport::new(SimulatedAdapter::default());
                Box::new(transport.with_link(self.link.clone()))
            }

            fn endpoint(&self) -> ConnectionInfo {
                ConnectionInfo {
                    kind: TransportKind::Simulated,
                    endpoint: "bench-adapter".into(),
                    baud_rate: None,
                }
            }
        }

        let factory = Arc::new(Counting {
            link: SimulatedLink::new(),
            created: AtomicU32::new(0),
        });
        let repo = Arc::new(DeviceRepository::new());
        let manager = ConnectionManager::builder(config(1), factory.clone())
            .sink(repo.clone())
            .build();

        manager.connect(toyota()).await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(factory.link.opens(), 1);

        let session = &repo.recent_sessions(DeviceKind::Obd, 1).unwrap()[0];
        assert_eq!(session.endpoint, "bench-adapter");
    }
}
