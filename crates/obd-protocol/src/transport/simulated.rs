//! In-process ELM327 simulator
//!
//! Answers like a healthy adapter on a CAN vehicle. Used by the agent's
//! development mode and throughout the test suites; replies can be
//! overridden, delayed, split into chunks or suppressed per command.

use super::{ConnectionInfo, Transport, TransportEvent, TransportKind, EVENT_CHANNEL_CAPACITY};
use crate::error::ObdError;
use crate::protocol::ObdProtocol;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Behaviour of the simulated adapter
#[derive(Debug, Clone, Default)]
pub struct SimulatedAdapter {
    overrides: HashMap<String, String>,
    silent: HashSet<String>,
    delays: HashMap<String, Duration>,
    chunk_size: Option<usize>,
    echo: bool,
    vehicle_protocols: Option<Vec<ObdProtocol>>,
}

fn normalize(command: &str) -> String {
    command
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

impl SimulatedAdapter {
    /// Reply to `command` with `response` instead of the built-in answer
    pub fn with_response(mut self, command: &str, response: &str) -> Self {
        self.overrides.insert(normalize(command), response.to_string());
        self
    }

    /// Never answer `command`
    pub fn silent_on(mut self, command: &str) -> Self {
        self.silent.insert(normalize(command));
        self
    }

    /// Answer `command` only after `delay`
    pub fn delayed(mut self, command: &str, delay: Duration) -> Self {
        self.delays.insert(normalize(command), delay);
        self
    }

    /// Deliver replies in chunks of at most `size` bytes
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));
        self
    }

    /// Echo commands back the way an adapter does before `ATE0`
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Only answer bus commands while one of `protocols` is selected
    ///
    /// Other `ATSPn` selections get `UNABLE TO CONNECT`, like a car that
    /// ignores the wrong wake-up. Auto-detect (`ATSP0`) always finds the bus.
    pub fn with_vehicle_protocols(mut self, protocols: &[ObdProtocol]) -> Self {
        self.vehicle_protocols = Some(protocols.to_vec());
        self
    }

    fn bus_reachable(&self, selected: &str) -> bool {
        match &self.vehicle_protocols {
            None => true,
            Some(protocols) => {
                selected == ObdProtocol::Auto.to_elm_command()
                    || protocols.iter().any(|p| p.to_elm_command() == selected)
            }
        }
    }

    /// Response body for a command, without framing
    pub fn answer(&self, command: &str) -> Option<String> {
        let key = normalize(command);
        if self.silent.contains(&key) {
            return None;
        }
        if let Some(response) = self.overrides.get(&key) {
            return Some(response.clone());
        }

        let response = match key.as_str() {
            "ATZ" | "ATI" => "ELM327 v1.5",
            "ATRV" => "12.6V",
            "ATDP" => "ISO 15765-4 (CAN 11/500)",
            "0100" => "41 00 BE 3E B8 13",
            "0101" => "41 01 00 07 E5 00",
            "0104" => "41 04 7F",
            "0105" => "41 05 64",
            "010C" => "41 0C 1A F8",
            "010D" => "41 0D 50",
            "010F" => "41 0F 50",
            "0110" => "41 10 1A F8",
            "0111" => "41 11 80",
            "0142" => "41 42 30 39",
            "03" => "43 03 01 71 04 20 03 01",
            "07" => "47 00",
            "04" => "44",
            "0902" => "49 02 01 31 47 31 4A 43 35 34 34 34 52 37 32 35 32 33 36 37",
            k if k.starts_with("AT") => "OK",
            k if k.starts_with("01") && k.len() == 4 => "NO DATA",
            _ => "?",
        };
        Some(response.to_string())
    }

    /// Full wire reply for a command, or `None` when the adapter stays silent
    pub fn frame(&self, command: &str) -> Option<Vec<u8>> {
        let body = self.answer(command)?;
        Some(self.wrap(command, &body))
    }

    fn wrap(&self, command: &str, body: &str) -> Vec<u8> {
        let mut framed = String::new();
        if self.echo {
            framed.push_str(command.trim());
            framed.push('\r');
        }
        framed.push_str(body);
        framed.push_str("\r\r>");
        framed.into_bytes()
    }

    fn delay_for(&self, command: &str) -> Option<Duration> {
        self.delays.get(&normalize(command)).copied()
    }

    fn chunks(&self, bytes: Vec<u8>) -> Vec<Vec<u8>> {
        match self.chunk_size {
            Some(size) => bytes.chunks(size).map(|c| c.to_vec()).collect(),
            None => vec![bytes],
        }
    }
}

#[derive(Debug, Default)]
struct LinkState {
    opens: u32,
    failing_opens: u32,
    writes: Vec<String>,
    events: Option<mpsc::Sender<TransportEvent>>,
}

/// Test-side handle onto a simulated channel
///
/// Shared across every transport created from the same link, so it sees the
/// whole history of a reconnecting connection.
#[derive(Debug, Clone, Default)]
pub struct SimulatedLink {
    state: Arc<Mutex<LinkState>>,
}

impl SimulatedLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `count` opens fail with a connection error
    pub fn fail_next_opens(&self, count: u32) {
        self.lock().failing_opens = count;
    }

    /// Successful and failed open attempts so far
    pub fn opens(&self) -> u32 {
        self.lock().opens
    }

    /// Every command written, in order, without terminators
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().events.is_some()
    }

    /// Simulate the adapter disappearing (unplugged, out of range)
    pub fn drop_link(&self) {
        if let Some(events) = self.lock().events.take() {
            let _ = events.try_send(TransportEvent::Closed);
        }
    }
}

pub struct SimulatedTransport {
    adapter: Arc<SimulatedAdapter>,
    link: SimulatedLink,
    latency: Duration,
    commands: Option<mpsc::UnboundedSender<String>>,
    responder: Option<JoinHandle<()>>,
}

impl SimulatedTransport {
    pub fn new(adapter: SimulatedAdapter) -> Self {
        Self {
            adapter: Arc::new(adapter),
            link: SimulatedLink::new(),
            latency: Duration::ZERO,
            commands: None,
            responder: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_link(mut self, link: SimulatedLink) -> Self {
        self.link = link;
        self
    }

    pub fn link(&self) -> SimulatedLink {
        self.link.clone()
    }
}

async fn respond_loop(
    adapter: Arc<SimulatedAdapter>,
    latency: Duration,
    mut commands: mpsc::UnboundedReceiver<String>,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut selected = ObdProtocol::Auto.to_elm_command().to_string();
    while let Some(command) = commands.recv().await {
        let key = normalize(&command);
        if key.starts_with("ATSP") {
            selected = key.clone();
        }
        let Some(mut reply) = adapter.frame(&command) else {
            debug!("Simulator ignoring {}", command);
            continue;
        };
        if !key.starts_with("AT") && !adapter.bus_reachable(&selected) {
            reply = adapter.wrap(&command, "UNABLE TO CONNECT");
        }
        let delay = adapter.delay_for(&command).unwrap_or(latency);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        for chunk in adapter.chunks(reply) {
            if events.send(TransportEvent::Data(chunk)).await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn open(&mut self) -> Result<mpsc::Receiver<TransportEvent>, ObdError> {
        {
            let mut state = self.link.lock();
            state.opens += 1;
            if state.failing_opens > 0 {
                state.failing_opens -= 1;
                return Err(ObdError::Connection("Simulated adapter unavailable".into()));
            }
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        self.link.lock().events = Some(event_tx.clone());
        self.responder = Some(tokio::spawn(respond_loop(
            self.adapter.clone(),
            self.latency,
            command_rx,
            event_tx,
        )));
        self.commands = Some(command_tx);
        Ok(event_rx)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ObdError> {
        if !self.link.is_connected() {
            return Err(ObdError::ConnectionClosed("Simulated link is down".into()));
        }
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| ObdError::ConnectionClosed("Simulated transport not open".into()))?;

        let text = String::from_utf8_lossy(data);
        for command in text.split('\r').map(str::trim).filter(|c| !c.is_empty()) {
            self.link.lock().writes.push(command.to_string());
            commands
                .send(command.to_string())
                .map_err(|_| ObdError::ConnectionClosed("Simulator stopped".into()))?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.commands = None;
        if let Some(responder) = self.responder.take() {
            responder.abort();
        }
        self.link.lock().events = None;
    }

    fn is_open(&self) -> bool {
        self.commands.is_some() && self.link.is_connected()
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            kind: TransportKind::Simulated,
            endpoint: "elm327-sim".to_string(),
            baud_rate: None,
        }
    }
}
