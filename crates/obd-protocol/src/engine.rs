//! ELM327 Command Engine
//!
//! A single task owns the transport, the command queue and the receive
//! buffer. Callers submit commands through an [`EngineHandle`] and await the
//! reply; at most one command is ever on the wire.

use crate::error::ObdError;
use crate::transport::{ConnectionInfo, Transport, TransportEvent};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// End-of-response marker sent by the adapter
pub const PROMPT: u8 = b'>';

/// Command terminator
pub const TERMINATOR: &str = "\r";

const INBOX_CAPACITY: usize = 32;

/// Engine tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-command deadline, counted from transmission (default: 2000)
    pub default_timeout_ms: u64,
    /// Re-sends of a timed-out command before giving up (default: 0)
    pub command_retries: u32,
    /// How long to wait for the prompt of a timed-out command before the
    /// next command goes out (default: 1000)
    pub stale_reply_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 2000,
            command_retries: 0,
            stale_reply_grace_ms: 1000,
        }
    }
}

impl EngineConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn stale_reply_grace(&self) -> Duration {
        Duration::from_millis(self.stale_reply_grace_ms)
    }
}

/// Channel state as seen by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Open,
    /// Closed on request
    Closed,
    /// The adapter went away underneath us
    Lost(String),
}

/// Command counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    pub total_commands: u64,
    pub successful: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub average_latency_ms: f64,
    pub last_command: Option<String>,
    pub last_error: Option<String>,
}

struct Pending {
    command: String,
    timeout: Duration,
    retries_left: u32,
    reply: oneshot::Sender<Result<String, ObdError>>,
}

struct InFlight {
    pending: Pending,
    sent_at: Instant,
    deadline: Instant,
}

enum EngineMsg {
    Execute(Pending),
    Close(oneshot::Sender<()>),
}

/// Cloneable front door to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineMsg>,
    status: watch::Receiver<LinkStatus>,
    stats: watch::Receiver<EngineStats>,
    info: ConnectionInfo,
    config: EngineConfig,
}

impl EngineHandle {
    /// Open `transport` and start the engine task on it
    pub async fn start(
        mut transport: Box<dyn Transport>,
        config: EngineConfig,
    ) -> Result<Self, ObdError> {
        let events = transport.open().await?;
        let info = transport.connection_info();

        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (status_tx, status) = watch::channel(LinkStatus::Open);
        let (stats_tx, stats) = watch::channel(EngineStats::default());

        let engine = Engine {
            transport,
            events,
            inbox,
            queue: VecDeque::new(),
            in_flight: None,
            draining: None,
            stale_reply_grace: config.stale_reply_grace(),
            buffer: Vec::new(),
            status_tx,
            stats_tx,
        };
        tokio::spawn(engine.run());

        info!("Command engine started on {} {}", info.kind, info.endpoint);
        Ok(Self {
            tx,
            status,
            stats,
            info,
            config,
        })
    }

    /// Send a command with the default timeout and retry count
    pub async fn execute(&self, command: &str) -> Result<String, ObdError> {
        self.execute_with_timeout(command, self.config.default_timeout())
            .await
    }

    /// Send a command with an explicit timeout
    pub async fn execute_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<String, ObdError> {
        let (reply, response) = oneshot::channel();
        let pending = Pending {
            command: command.trim().to_string(),
            timeout,
            retries_left: self.config.command_retries,
            reply,
        };

        self.tx
            .send(EngineMsg::Execute(pending))
            .await
            .map_err(|_| ObdError::ConnectionClosed("Command engine stopped".into()))?;

        response
            .await
            .map_err(|_| ObdError::ConnectionClosed("Command engine stopped".into()))?
    }

    /// Close the transport and fail everything still queued
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(EngineMsg::Close(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    pub fn is_open(&self) -> bool {
        *self.status.borrow() == LinkStatus::Open
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    /// Watch for the engine shutting down
    pub fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.borrow().clone()
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

struct Engine {
    transport: Box<dyn Transport>,
    events: mpsc::Receiver<TransportEvent>,
    inbox: mpsc::Receiver<EngineMsg>,
    queue: VecDeque<Pending>,
    in_flight: Option<InFlight>,
    // Set after a timeout: the adapter may still finish that reply, so
    // nothing is sent until its prompt arrives or this deadline passes.
    draining: Option<Instant>,
    stale_reply_grace: Duration,
    buffer: Vec<u8>,
    status_tx: watch::Sender<LinkStatus>,
    stats_tx: watch::Sender<EngineStats>,
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Engine {
    async fn run(mut self) {
        loop {
            if self.in_flight.is_none() && self.draining.is_none() {
                if let Some(next) = self.queue.pop_front() {
                    if let Err(e) = self.dispatch(next).await {
                        self.shutdown(LinkStatus::Lost(e.to_string())).await;
                        return;
                    }
                }
            }

            let deadline = self.in_flight.as_ref().map(|f| f.deadline).or(self.draining);
            tokio::select! {
                msg = self.inbox.recv() => match msg {
                    Some(EngineMsg::Execute(pending)) => self.queue.push_back(pending),
                    Some(EngineMsg::Close(ack)) => {
                        self.shutdown(LinkStatus::Closed).await;
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        self.shutdown(LinkStatus::Closed).await;
                        return;
                    }
                },
                event = self.events.recv() => match event {
                    Some(TransportEvent::Data(bytes)) => self.on_data(bytes),
                    Some(TransportEvent::Error(e)) => {
                        warn!("Transport error: {}", e);
                        self.shutdown(LinkStatus::Lost(e)).await;
                        return;
                    }
                    Some(TransportEvent::Closed) | None => {
                        warn!("Adapter closed the connection");
                        self.shutdown(LinkStatus::Lost("Adapter closed the connection".into()))
                            .await;
                        return;
                    }
                },
                _ = wait_for(deadline) => {
                    if self.in_flight.is_some() {
                        self.on_timeout();
                    } else {
                        self.on_drain_expired();
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, pending: Pending) -> Result<(), ObdError> {
        self.buffer.clear();
        trace!("-> {}", pending.command);

        let line = format!("{}{}", pending.command, TERMINATOR);
        if let Err(e) = self.transport.write(line.as_bytes()).await {
            self.record_failure(&pending.command, &e);
            let _ = pending.reply.send(Err(ObdError::ConnectionClosed(e.to_string())));
            return Err(e);
        }

        let sent_at = Instant::now();
        self.in_flight = Some(InFlight {
            deadline: sent_at + pending.timeout,
            sent_at,
            pending,
        });
        Ok(())
    }

    fn on_data(&mut self, bytes: Vec<u8>) {
        self.buffer.extend_from_slice(&bytes);
        if self.draining.is_some() {
            if let Some(stale) = split_at_prompt(&mut self.buffer) {
                debug!(
                    "Discarded late reply '{}'",
                    sanitize_response(&String::from_utf8_lossy(&stale), "")
                );
                self.draining = None;
            }
            return;
        }
        if self.in_flight.is_none() {
            trace!("Buffered {} bytes with no command in flight", bytes.len());
            return;
        }
        let Some(raw) = split_at_prompt(&mut self.buffer) else {
            return;
        };
        let Some(flight) = self.in_flight.take() else {
            return;
        };

        let response = sanitize_response(&String::from_utf8_lossy(&raw), &flight.pending.command);
        let latency = flight.sent_at.elapsed();
        trace!("<- {} ({:?})", response, latency);

        histogram!("obd_command_latency_ms").record(latency.as_secs_f64() * 1000.0);
        counter!("obd_commands_total", "outcome" => "ok").increment(1);
        self.stats_tx.send_modify(|stats| {
            stats.total_commands += 1;
            stats.successful += 1;
            let n = stats.successful as f64;
            let ms = latency.as_secs_f64() * 1000.0;
            stats.average_latency_ms += (ms - stats.average_latency_ms) / n;
            stats.last_command = Some(flight.pending.command.clone());
        });

        let _ = flight.pending.reply.send(Ok(response));
    }

    fn on_timeout(&mut self) {
        let Some(flight) = self.in_flight.take() else {
            return;
        };
        let mut pending = flight.pending;
        self.draining = Some(Instant::now() + self.stale_reply_grace);
        counter!("obd_command_timeouts_total").increment(1);
        self.stats_tx.send_modify(|stats| stats.timeouts += 1);

        if pending.retries_left > 0 {
            pending.retries_left -= 1;
            debug!(
                "Command {} timed out, retrying ({} left)",
                pending.command, pending.retries_left
            );
            self.queue.push_front(pending);
            return;
        }

        let err = ObdError::Timeout {
            command: pending.command.clone(),
            timeout_ms: pending.timeout.as_millis() as u64,
        };
        warn!("{}", err);
        self.record_failure(&pending.command, &err);
        let _ = pending.reply.send(Err(err));
    }

    fn on_drain_expired(&mut self) {
        self.draining = None;
        if !self.buffer.is_empty() {
            debug!("Dropping {} bytes of an unfinished reply", self.buffer.len());
            self.buffer.clear();
        }
    }

    fn record_failure(&self, command: &str, err: &ObdError) {
        counter!("obd_commands_total", "outcome" => "error").increment(1);
        self.stats_tx.send_modify(|stats| {
            stats.total_commands += 1;
            stats.failed += 1;
            stats.last_command = Some(command.to_string());
            stats.last_error = Some(err.to_string());
        });
    }

    async fn shutdown(&mut self, status: LinkStatus) {
        self.transport.close().await;

        let reason = match &status {
            LinkStatus::Lost(reason) => reason.clone(),
            _ => "Connection closed".to_string(),
        };

        let mut rejected = 0;
        if let Some(flight) = self.in_flight.take() {
            let _ = flight.pending.reply.send(Err(ObdError::ConnectionClosed(reason.clone())));
            rejected += 1;
        }
        for pending in self.queue.drain(..) {
            let _ = pending.reply.send(Err(ObdError::ConnectionClosed(reason.clone())));
            rejected += 1;
        }

        self.inbox.close();
        while let Ok(msg) = self.inbox.try_recv() {
            match msg {
                EngineMsg::Execute(pending) => {
                    let _ = pending.reply.send(Err(ObdError::ConnectionClosed(reason.clone())));
                    rejected += 1;
                }
                EngineMsg::Close(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        if rejected > 0 {
            warn!("Rejected {} pending commands: {}", rejected, reason);
        }
        self.buffer.clear();
        let _ = self.status_tx.send(status);
        info!("Command engine stopped");
    }
}

/// Remove one complete response from the front of `buffer`
///
/// Returns the bytes before the first prompt and leaves whatever followed it
/// in the buffer.
pub fn split_at_prompt(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buffer.iter().position(|b| *b == PROMPT)?;
    let rest = buffer.split_off(pos + 1);
    let mut response = std::mem::replace(buffer, rest);
    response.truncate(pos);
    Some(response)
}

/// Normalize an adapter reply
///
/// Drops blank lines, `SEARCHING...` progress lines, NULs and the echoed
/// command; remaining lines are trimmed and joined with `\n`.
pub fn sanitize_response(raw: &str, command: &str) -> String {
    let echo: String = command.chars().filter(|c| !c.is_whitespace()).collect();

    raw.split(['\r', '\n'])
        .map(|line| line.trim_matches(|c: char| c.is_whitespace() || c == '\0'))
        .filter(|line| !line.is_empty())
        .filter(|line| !line.to_uppercase().starts_with("SEARCHING"))
        .filter(|line| {
            let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
            !compact.eq_ignore_ascii_case(&echo)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SimulatedAdapter, SimulatedTransport};

    async fn start(adapter: SimulatedAdapter, config: EngineConfig) -> EngineHandle {
        let transport = SimulatedTransport::new(adapter);
        EngineHandle::start(Box::new(transport), config).await.unwrap()
    }

    #[test]
    fn test_split_keeps_remainder() {
        let mut buffer = b"41 0C 1A F8\r\r>41 0D".to_vec();
        let response = split_at_prompt(&mut buffer).unwrap();
        assert_eq!(response, b"41 0C 1A F8\r\r".to_vec());
        assert_eq!(buffer, b"41 0D".to_vec());
        assert!(split_at_prompt(&mut buffer).is_none());
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_response("41 0C 1A F8\r\r", "010C"), "41 0C 1A F8");
        assert_eq!(
            sanitize_response("010C\rSEARCHING...\r41 0C 1A F8\r\r", "010C"),
            "41 0C 1A F8"
        );
        assert_eq!(
            sanitize_response("\0\r\n47 01 01 33\r\n47 01 04 20\r\n", "07"),
            "47 01 01 33\n47 01 04 20"
        );
        assert_eq!(sanitize_response("\r\r", "ATZ"), "");
    }

    #[tokio::test]
    async fn test_execute_reassembles_chunks() {
        let engine = start(
            SimulatedAdapter::default().with_chunk_size(2),
            EngineConfig::default(),
        )
        .await;
        assert_eq!(engine.execute("010C").await.unwrap(), "41 0C 1A F8");
        assert_eq!(engine.execute("ATZ").await.unwrap(), "ELM327 v1.5");

        let stats = engine.stats();
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.last_command.as_deref(), Some("ATZ"));
    }

    #[tokio::test]
    async fn test_commands_complete_in_submission_order() {
        let transport = SimulatedTransport::new(SimulatedAdapter::default());
        let link = transport.link();
        let engine = EngineHandle::start(Box::new(transport), EngineConfig::default())
            .await
            .unwrap();

        let (rpm, speed, temp) = tokio::join!(
            engine.execute("010C"),
            engine.execute("010D"),
            engine.execute("0105"),
        );
        assert_eq!(rpm.unwrap(), "41 0C 1A F8");
        assert_eq!(speed.unwrap(), "41 0D 50");
        assert_eq!(temp.unwrap(), "41 05 64");
        assert_eq!(link.writes(), vec!["010C", "010D", "0105"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_next_command_proceeds() {
        let engine = start(
            SimulatedAdapter::default().silent_on("010D"),
            EngineConfig::default(),
        )
        .await;

        let err = engine.execute("010D").await.unwrap_err();
        assert_eq!(
            err,
            ObdError::Timeout {
                command: "010D".into(),
                timeout_ms: 2000
            }
        );
        assert_eq!(engine.execute("010C").await.unwrap(), "41 0C 1A F8");

        let stats = engine.stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.failed, 1);
        assert!(stats.last_error.unwrap().contains("010D"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_command_waits_for_previous_reply() {
        let transport = SimulatedTransport::new(
            SimulatedAdapter::default().delayed("010C", Duration::from_millis(300)),
        );
        let link = transport.link();
        let engine = EngineHandle::start(Box::new(transport), EngineConfig::default())
            .await
            .unwrap();

        let rpm = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute("010C").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let speed = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute("010D").await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!rpm.is_finished());
        assert_eq!(link.writes(), vec!["010C"]);

        assert_eq!(rpm.await.unwrap().unwrap(), "41 0C 1A F8");
        assert_eq!(speed.await.unwrap().unwrap(), "41 0D 50");
        assert_eq!(link.writes(), vec!["010C", "010D"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_is_not_given_to_next_command() {
        let transport = SimulatedTransport::new(
            SimulatedAdapter::default()
                .with_response("010D", "41 0D 43")
                .delayed("010D", Duration::from_millis(2500)),
        );
        let link = transport.link();
        let engine = EngineHandle::start(Box::new(transport), EngineConfig::default())
            .await
            .unwrap();

        assert!(matches!(
            engine.execute("010D").await,
            Err(ObdError::Timeout { .. })
        ));
        assert_eq!(
            engine.execute("03").await.unwrap(),
            "43 03 01 71 04 20 03 01"
        );
        assert_eq!(link.writes(), vec!["010D", "03"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retries_resend_command() {
        let transport = SimulatedTransport::new(SimulatedAdapter::default().silent_on("0142"));
        let link = transport.link();
        let config = EngineConfig {
            default_timeout_ms: 500,
            command_retries: 2,
            ..Default::default()
        };
        let engine = EngineHandle::start(Box::new(transport), config).await.unwrap();

        assert!(matches!(
            engine.execute("0142").await,
            Err(ObdError::Timeout { .. })
        ));
        assert_eq!(link.writes(), vec!["0142", "0142", "0142"]);
        assert_eq!(engine.stats().timeouts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_rejects_queued_commands() {
        let engine = start(
            SimulatedAdapter::default().delayed("0100", Duration::from_secs(1)),
            EngineConfig::default(),
        )
        .await;

        let mut waiting = Vec::new();
        for cmd in ["0100", "010C", "010D"] {
            let engine = engine.clone();
            waiting.push(tokio::spawn(async move { engine.execute(cmd).await }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        engine.close().await;
        for task in waiting {
            let result = task.await.unwrap();
            assert!(matches!(result, Err(ObdError::ConnectionClosed(_))));
        }
        assert_eq!(engine.status(), LinkStatus::Closed);
        assert!(matches!(
            engine.execute("010C").await,
            Err(ObdError::ConnectionClosed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_publishes_status() {
        let transport = SimulatedTransport::new(
            SimulatedAdapter::default().delayed("0902", Duration::from_secs(1)),
        );
        let link = transport.link();
        let engine = EngineHandle::start(Box::new(transport), EngineConfig::default())
            .await
            .unwrap();
        let mut status = engine.subscribe_status();

        let vin = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute("0902").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        link.drop_link();

        status.changed().await.unwrap();
        assert!(matches!(*status.borrow(), LinkStatus::Lost(_)));
        assert!(matches!(vin.await.unwrap(), Err(ObdError::ConnectionClosed(_))));
        assert!(!engine.is_open());
    }
}
