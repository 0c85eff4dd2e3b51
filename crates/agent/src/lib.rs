//! OBD Kiosk Agent
//!
//! Keeps one OBD-II adapter connected, polls the configured PIDs while the
//! connection is ready, answers health-check requests with a voltage reading
//! and keeps an in-memory record of every session.

pub mod config;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use obd_connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use obd_protocol::{DtcDatabase, TransportFactory, VehicleInfo};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use storage::{DeviceKind, DeviceRepository};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

pub use config::{AgentConfig, ConfigError, LoggingConfig};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("invalid log filter '{}'", config.level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))
}

/// Serve Prometheus metrics when an address is configured
pub fn init_metrics(config: &AgentConfig) -> anyhow::Result<()> {
    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Serving metrics on {}", addr);
    }
    Ok(())
}

/// Run until Ctrl-C
pub async fn run(config: AgentConfig) -> anyhow::Result<Arc<DeviceRepository>> {
    run_until(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
    })
    .await
}

/// Run until `shutdown` completes; returns the session repository
pub async fn run_until<F>(
    config: AgentConfig,
    shutdown: F,
) -> anyhow::Result<Arc<DeviceRepository>>
where
    F: Future<Output = ()>,
{
    let repository = Arc::new(DeviceRepository::with_retention(config.retention.clone()));
    let factory: Arc<dyn TransportFactory> = Arc::new(config.transport.clone());
    let manager = ConnectionManager::builder(config.manager.clone(), factory)
        .sink(repository.clone())
        .dtc_database(DtcDatabase::standard().with_layout(config.dtc_layout))
        .build();
    let mut events = manager.subscribe();

    info!(
        "Starting agent for {} {:?} with {} PIDs",
        config.vehicle.make,
        config.vehicle.year,
        config.pids.len()
    );
    let mut connecting = spawn_connect(&manager, &config.vehicle);
    let mut recovery = ErrorRecovery::new(config.error_reconnects, config.error_cooldown());

    let mut poll = tokio::time::interval(config.poll_interval());
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            _ = poll.tick() => match manager.status() {
                ConnectionState::Ready => poll_pids(&manager, &config.pids).await,
                ConnectionState::Error => {
                    if connecting.is_finished() && recovery.should_retry(Instant::now()) {
                        info!(
                            "Starting connect round {}/{} after failure",
                            recovery.used, recovery.budget
                        );
                        connecting = spawn_connect(&manager, &config.vehicle);
                    }
                }
                state => debug!("Skipping poll while {}", state),
            },
            event = events.recv() => match event {
                Ok(event) => {
                    if matches!(event, ConnectionEvent::Connected { .. }) {
                        recovery.reset();
                    }
                    handle_event(&manager, &config, event).await
                }
                Err(RecvError::Lagged(missed)) => warn!("Dropped {} connection events", missed),
                Err(RecvError::Closed) => break,
            },
        }
    }

    connecting.abort();
    manager.disconnect().await;

    let sessions = repository.recent_sessions(DeviceKind::Obd, usize::MAX)?;
    info!(
        "Agent stopped: {} sessions, {} state events, {} metrics",
        sessions.len(),
        repository.event_count(),
        repository.metric_count()
    );
    Ok(repository)
}

/// Bounded restarts once the manager has used up its own retries
struct ErrorRecovery {
    budget: u32,
    used: u32,
    cooldown: Duration,
    failed_at: Option<Instant>,
    gave_up: bool,
}

impl ErrorRecovery {
    fn new(budget: u32, cooldown: Duration) -> Self {
        Self {
            budget,
            used: 0,
            cooldown,
            failed_at: None,
            gave_up: false,
        }
    }

    /// Called while the manager sits in `Error`
    fn should_retry(&mut self, now: Instant) -> bool {
        let failed_at = *self.failed_at.get_or_insert(now);
        if self.used >= self.budget {
            if !self.gave_up {
                self.gave_up = true;
                error!(
                    "Connection failed permanently after {} extra rounds; operator action needed",
                    self.used
                );
            }
            return false;
        }
        if now.duration_since(failed_at) < self.cooldown {
            return false;
        }
        self.used += 1;
        self.failed_at = None;
        true
    }

    fn reset(&mut self) {
        self.used = 0;
        self.failed_at = None;
        self.gave_up = false;
    }
}

fn spawn_connect(manager: &ConnectionManager, vehicle: &VehicleInfo) -> JoinHandle<()> {
    let manager = manager.clone();
    let vehicle = vehicle.clone();
    tokio::spawn(async move {
        if let Err(e) = manager.connect(vehicle).await {
            let snapshot = manager.snapshot();
            error!(
                "Could not connect after {} attempts: {}",
                snapshot.reconnect_attempts, e
            );
            if let Some(guidance) = snapshot.guidance {
                warn!("{}", guidance);
            }
        }
    })
}

async fn poll_pids(manager: &ConnectionManager, pids: &[String]) {
    for pid in pids {
        match manager.read_pid(pid).await {
            Ok(reading) => match reading.value {
                Some(value) => debug!("{} = {} {}", reading.name, value, reading.unit),
                None => debug!("{} returned no value", reading.name),
            },
            Err(e) => {
                warn!("Reading PID {} failed: {}", pid, e);
                if manager.status() != ConnectionState::Ready {
                    return;
                }
            }
        }
    }
}

async fn handle_event(
    manager: &ConnectionManager,
    config: &AgentConfig,
    event: ConnectionEvent,
) {
    match event {
        ConnectionEvent::Connected { adapter } => {
            info!(
                "Connected to {} via {} ({} PIDs supported)",
                adapter.identity,
                adapter.protocol,
                adapter.supported_pids.len()
            );
            match manager.read_vin().await {
                Ok(vin) => info!("VIN {}", vin),
                Err(e) => debug!("VIN unavailable: {}", e),
            }
            if config.read_dtc_on_connect {
                match manager.read_dtc().await {
                    Ok(codes) if codes.is_empty() => info!("No stored trouble codes"),
                    Ok(codes) => {
                        for code in codes {
                            warn!("{} [{:?}] {}", code.code, code.severity, code.description);
                        }
                    }
                    Err(e) => warn!("Reading trouble codes failed: {}", e),
                }
            }
        }
        ConnectionEvent::HealthCheckRequested => match manager.read_voltage().await {
            Ok(volts) => debug!("Health check ok: adapter reports {:.1}V", volts),
            Err(e) => warn!("Health check failed: {}", e),
        },
        ConnectionEvent::Error { message, attempts } => {
            error!("Connection gave up after {} attempts: {}", attempts, message)
        }
        ConnectionEvent::Disconnected { reason } => info!("Disconnected: {}", reason),
        _ => {}
    }
}
