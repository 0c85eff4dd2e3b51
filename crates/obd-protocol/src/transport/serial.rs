//! Serial port transport (USB ELM327 adapters, bound RFCOMM devices)

use super::{ConnectionInfo, Transport, TransportEvent, TransportKind, EVENT_CHANNEL_CAPACITY};
use crate::error::ObdError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::SerialStream;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 256;

pub struct SerialTransport {
    /// Serial port device path (e.g., "/dev/ttyUSB0" or "COM3")
    path: String,
    baud_rate: u32,
    open_timeout: Duration,
    kind: TransportKind,
    writer: Option<WriteHalf<SerialStream>>,
    reader_task: Option<JoinHandle<()>>,
}

impl SerialTransport {
    pub fn new(path: &str, baud_rate: u32) -> Self {
        Self {
            path: path.to_string(),
            baud_rate,
            open_timeout: Duration::from_secs(5),
            kind: TransportKind::Serial,
            writer: None,
            reader_task: None,
        }
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Report a different kind in `connection_info` (used for RFCOMM)
    pub(crate) fn reporting_as(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    async fn open_stream(&self) -> Result<SerialStream, ObdError> {
        if tokio::fs::metadata(&self.path).await.is_err() {
            return Err(ObdError::Connection(format!(
                "Device {} not found",
                self.path
            )));
        }

        let builder = tokio_serial::new(&self.path, self.baud_rate)
            .timeout(self.open_timeout);
        let opening = tokio::task::spawn_blocking(move || SerialStream::open(&builder));

        match tokio::time::timeout(self.open_timeout, opening).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(join)) => Err(ObdError::Connection(format!(
                "Serial open task failed: {}",
                join
            ))),
            Err(_) => Err(ObdError::Timeout {
                command: format!("open {}", self.path),
                timeout_ms: self.open_timeout.as_millis() as u64,
            }),
        }
    }
}

async fn read_loop(mut reader: ReadHalf<SerialStream>, events: mpsc::Sender<TransportEvent>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let event = match reader.read(&mut buf).await {
            Ok(0) => TransportEvent::Closed,
            Ok(n) => TransportEvent::Data(buf[..n].to_vec()),
            Err(e) => TransportEvent::Error(e.to_string()),
        };
        let terminal = !matches!(event, TransportEvent::Data(_));
        if events.send(event).await.is_err() || terminal {
            break;
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<mpsc::Receiver<TransportEvent>, ObdError> {
        if self.is_open() {
            return Err(ObdError::Connection(format!("{} is already open", self.path)));
        }

        let stream = self.open_stream().await?;
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        self.reader_task = Some(tokio::spawn(read_loop(reader, tx)));
        self.writer = Some(writer);

        info!("Opened {} at {} baud", self.path, self.baud_rate);
        Ok(rx)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ObdError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ObdError::ConnectionClosed(format!("{} is not open", self.path)))?;

        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                warn!("Error shutting down {}: {}", self.path, e);
            }
            debug!("Closed {}", self.path);
        }
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            kind: self.kind,
            endpoint: self.path.clone(),
            baud_rate: Some(self.baud_rate),
        }
    }
}
