//! Connection manager driven end to end against the simulated adapter

use obd_connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, ManagerConfig, RecordingClock,
    RetryPolicy,
};
use obd_protocol::transport::{SimulatedAdapter, SimulatedLink, SimulatedTransport};
use obd_protocol::{ObdProtocol, Transport, TransportFactory, VehicleInfo};
use std::sync::Arc;
use std::time::Duration;
use storage::{DeviceKind, DeviceRepository};
use tokio::sync::broadcast;

fn factory(link: &SimulatedLink, adapter: SimulatedAdapter) -> Arc<dyn TransportFactory> {
    let link = link.clone();
    Arc::new(move || -> Box<dyn Transport> {
        Box::new(SimulatedTransport::new(adapter.clone()).with_link(link.clone()))
    })
}

fn default_factory(link: &SimulatedLink) -> Arc<dyn TransportFactory> {
    factory(link, SimulatedAdapter::default())
}

fn config(auto_reconnect: bool) -> ManagerConfig {
    ManagerConfig {
        auto_reconnect,
        retry: RetryPolicy::immediate(3),
        ..Default::default()
    }
}

async fn wait_for_state(events: &mut broadcast::Receiver<ConnectionEvent>, state: ConnectionState) {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if event.state() == Some(state) => return,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("never reached {}", state));
}

#[tokio::test]
async fn test_link_loss_reconnects_automatically() {
    let link = SimulatedLink::new();
    let repo = Arc::new(DeviceRepository::new());
    let manager = ConnectionManager::builder(config(true), default_factory(&link))
        .sink(repo.clone())
        .build();
    let mut events = manager.subscribe();

    manager.connect(VehicleInfo::new("Honda", Some(2018))).await.unwrap();
    let first_session = manager.snapshot().session_id;

    link.drop_link();
    wait_for_state(&mut events, ConnectionState::Reconnecting).await;
    wait_for_state(&mut events, ConnectionState::Ready).await;

    assert_eq!(manager.status(), ConnectionState::Ready);
    assert_eq!(link.opens(), 2);
    assert_eq!(manager.snapshot().session_id, first_session);

    let reading = manager.read_pid("0D").await.unwrap();
    assert_eq!(reading.value, Some(80.0));

    // connect() while ready is a no-op
    manager.connect(VehicleInfo::new("Honda", Some(2018))).await.unwrap();
    assert_eq!(link.opens(), 2);

    manager.disconnect().await;
    let sessions = repo.recent_sessions(DeviceKind::Obd, 10).unwrap();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].success);
    assert!(sessions[0].duration_ms.is_some());
}

#[tokio::test]
async fn test_link_loss_without_auto_reconnect_disconnects() {
    let link = SimulatedLink::new();
    let manager = ConnectionManager::new(config(false), default_factory(&link));
    let mut events = manager.subscribe();

    manager.connect(VehicleInfo::new("Ford", Some(2016))).await.unwrap();
    link.drop_link();
    wait_for_state(&mut events, ConnectionState::Disconnected).await;

    assert_eq!(manager.status(), ConnectionState::Disconnected);
    assert_eq!(link.opens(), 1);
    assert!(manager.snapshot().last_error.is_some());
    assert!(manager.read_vin().await.is_err());
}

#[tokio::test]
async fn test_reconnect_failure_settles_in_error() {
    let link = SimulatedLink::new();
    let manager = ConnectionManager::builder(config(true), default_factory(&link))
        .clock(Arc::new(RecordingClock::new()))
        .build();
    let mut events = manager.subscribe();

    manager.connect(VehicleInfo::new("Mazda", Some(2019))).await.unwrap();
    link.fail_next_opens(3);
    link.drop_link();
    wait_for_state(&mut events, ConnectionState::Error).await;

    let snapshot = manager.snapshot();
    assert!(snapshot.failed);
    assert_eq!(snapshot.reconnect_attempts, 3);
    assert_eq!(link.opens(), 4);

    // A fresh connect starts over
    manager.connect(VehicleInfo::new("Mazda", Some(2019))).await.unwrap();
    assert_eq!(manager.status(), ConnectionState::Ready);
    assert_eq!(manager.snapshot().reconnect_attempts, 0);
}

#[tokio::test]
async fn test_legacy_vehicle_falls_back_through_protocols() {
    let link = SimulatedLink::new();
    let adapter = SimulatedAdapter::default().with_vehicle_protocols(&[ObdProtocol::Iso14230_4Kwp]);
    let manager = ConnectionManager::new(config(true), factory(&link, adapter));

    manager.connect(VehicleInfo::new("Toyota", Some(2005))).await.unwrap();

    let snapshot = manager.snapshot();
    let adapter = snapshot.adapter.expect("adapter info once ready");
    assert_eq!(adapter.protocol, ObdProtocol::Iso14230_4Kwp);
    assert!(snapshot.guidance.is_some());

    let selected: Vec<String> = link
        .writes()
        .into_iter()
        .filter(|w| w.starts_with("ATSP"))
        .collect();
    assert_eq!(selected, vec!["ATSP0", "ATSP3", "ATSP4"]);
}

#[tokio::test]
async fn test_state_events_persisted_in_order() {
    let link = SimulatedLink::new();
    let repo = Arc::new(DeviceRepository::new());
    let manager = ConnectionManager::builder(config(true), default_factory(&link))
        .sink(repo.clone())
        .build();

    manager.connect(VehicleInfo::new("BMW", Some(2020))).await.unwrap();
    manager.read_pid("0C").await.unwrap();
    manager.read_voltage().await.unwrap();
    manager.disconnect().await;

    let states: Vec<String> = repo
        .recent_events(DeviceKind::Obd, 10)
        .unwrap()
        .into_iter()
        .rev()
        .map(|e| e.to_state)
        .collect();
    assert_eq!(states, vec!["connecting", "initializing", "ready", "disconnected"]);

    let voltage = repo
        .recent_metrics(DeviceKind::Obd, Some("battery_voltage"), 5)
        .unwrap();
    assert_eq!(voltage.len(), 1);
    assert_eq!(voltage[0].value, 12.6);
    assert_eq!(
        repo.recent_metrics(DeviceKind::Obd, Some("pid_0C"), 5).unwrap().len(),
        1
    );
}
