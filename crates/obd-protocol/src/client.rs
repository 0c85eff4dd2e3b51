//! OBD-II Client for ELM327 Adapters
//!
//! Adapter initialization, vehicle protocol negotiation and the typed data
//! operations, all running over a [`EngineHandle`].

use crate::dtc::{parse_dtc_response, reassemble_frames, DtcDatabase, DtcEntry, DtcService};
use crate::engine::{EngineConfig, EngineHandle, EngineStats, LinkStatus};
use crate::error::ObdError;
use crate::mode;
use crate::pid::{
    decode_ascii, decode_supported_pids, normalize_pid, parse_hex_bytes, PidReading, PidRegistry,
};
use crate::profile::VehicleProfile;
use crate::protocol::ObdProtocol;
use crate::transport::{ConnectionInfo, Transport};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Adapter bring-up, in order
pub const INIT_SEQUENCE: &[&str] = &["ATZ", "ATE0", "ATL0", "ATS0", "ATH0", "ATSP0"];

/// `ATZ` reboots the adapter and answers slower than any data command
const RESET_TIMEOUT: Duration = Duration::from_secs(5);

const VIN_LENGTH: usize = 17;

/// Vehicle identification used to pick a protocol profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleInfo {
    #[serde(default)]
    pub make: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub year: Option<u16>,
}

impl VehicleInfo {
    pub fn new(make: &str, year: Option<u16>) -> Self {
        Self {
            make: make.to_string(),
            model: None,
            year,
        }
    }
}

/// What the adapter reported during bring-up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterInfo {
    /// Reply to `ATZ`, e.g. `ELM327 v1.5`
    pub identity: String,
    pub protocol: ObdProtocol,
    /// Mode 01 PIDs the ECU advertised in its `0100` bitmap
    pub supported_pids: Vec<String>,
    pub connection: ConnectionInfo,
}

/// OBD-II client for communicating with ELM327-compatible adapters
#[derive(Clone)]
pub struct ObdClient {
    engine: EngineHandle,
    registry: Arc<PidRegistry>,
    dtc_database: Arc<DtcDatabase>,
    /// Timeout for data commands
    timeout: Duration,
    identity: Option<String>,
    protocol: Option<ObdProtocol>,
    supported_pids: Vec<String>,
}

fn is_adapter_error(response: &str) -> bool {
    let upper = response.trim().to_uppercase();
    upper.is_empty()
        || upper == "?"
        || upper.contains("ERROR")
        || upper.contains("UNABLE TO CONNECT")
}

/// Return the bytes after `header` from the first line that starts with it
fn payload_after(response: &str, header: &[u8]) -> Option<Vec<u8>> {
    reassemble_frames(&response.to_uppercase())
        .iter()
        .filter_map(|line| parse_hex_bytes(line))
        .find_map(|bytes| bytes.strip_prefix(header).map(<[u8]>::to_vec))
}

/// Extract a VIN from a Mode 09 PID 02 reply (CAN or legacy framing)
pub fn parse_vin(response: &str) -> Option<String> {
    let mut data = Vec::new();
    for line in reassemble_frames(&response.to_uppercase()) {
        let Some(bytes) = parse_hex_bytes(&line) else {
            continue;
        };
        let Some(pos) = bytes.windows(2).position(|w| w == [0x49, 0x02]) else {
            continue;
        };
        // skip the message-count / sequence byte
        data.extend_from_slice(bytes.get(pos + 3..).unwrap_or_default());
    }

    let text: String = decode_ascii(&data)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if text.len() < VIN_LENGTH {
        return None;
    }
    Some(text[text.len() - VIN_LENGTH..].to_string())
}

/// Parse an `ATRV` reply such as `12.6V`
pub fn parse_voltage(response: &str) -> Option<f64> {
    response
        .trim()
        .trim_end_matches(['V', 'v'])
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

impl ObdClient {
    /// Wrap a running engine
    pub fn new(
        engine: EngineHandle,
        registry: Arc<PidRegistry>,
        dtc_database: Arc<DtcDatabase>,
    ) -> Self {
        let timeout = engine.config().default_timeout();
        Self {
            engine,
            registry,
            dtc_database,
            timeout,
            identity: None,
            protocol: None,
            supported_pids: Vec::new(),
        }
    }

    /// Open `transport` and start an engine with the standard decoder tables
    pub async fn open(
        transport: Box<dyn Transport>,
        config: EngineConfig,
    ) -> Result<Self, ObdError> {
        let engine = EngineHandle::start(transport, config).await?;
        Ok(Self::new(
            engine,
            Arc::new(PidRegistry::standard()),
            Arc::new(DtcDatabase::standard()),
        ))
    }

    /// Reset the adapter, then negotiate the vehicle's protocol
    pub async fn initialize(&mut self, profile: &VehicleProfile) -> Result<AdapterInfo, ObdError> {
        self.reset_adapter().await?;
        self.negotiate_protocol(profile).await?;
        self.adapter_info()
            .ok_or_else(|| ObdError::Connection("Adapter did not complete initialization".into()))
    }

    /// Run the fixed AT sequence
    ///
    /// A bad `ATZ` reply is fatal. The remaining commands only warn, since
    /// clones routinely reject one or two of them.
    pub async fn reset_adapter(&mut self) -> Result<String, ObdError> {
        info!("Initializing OBD adapter on {}", self.engine.connection_info().endpoint);

        let identity = match self
            .engine
            .execute_with_timeout(INIT_SEQUENCE[0], RESET_TIMEOUT.max(self.timeout))
            .await
        {
            Ok(reply) if !is_adapter_error(&reply) => reply,
            Ok(reply) => {
                return Err(ObdError::Connection(format!(
                    "Adapter rejected reset: '{}'",
                    reply
                )))
            }
            Err(e) if e.is_channel_failure() => return Err(e),
            Err(e) => return Err(ObdError::Connection(format!("Adapter reset failed: {}", e))),
        };

        for command in &INIT_SEQUENCE[1..] {
            match self.engine.execute(command).await {
                Ok(reply) if !is_adapter_error(&reply) => {
                    debug!("{} -> {}", command, reply);
                }
                Ok(reply) => warn!("Adapter answered {} with '{}'", command, reply),
                Err(e) if e.is_channel_failure() => return Err(e),
                Err(e) => warn!("Init command {} failed: {}", command, e),
            }
        }

        info!("Adapter identified as {}", identity);
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Try each protocol of the profile until one answers `0100`
    pub async fn negotiate_protocol(
        &mut self,
        profile: &VehicleProfile,
    ) -> Result<ObdProtocol, ObdError> {
        let profile_timeout = profile.recommended_timeout();
        let sequence = profile.protocol_sequence();
        if profile.requires_slow_init() {
            info!(
                "{} requires slow init, allowing {:?} per command",
                profile.make, profile_timeout
            );
        }

        for config in &sequence {
            let timeout = profile_timeout.max(Duration::from_millis(config.timeout_ms));
            debug!("Trying protocol {} ({})", config.protocol, config.description);

            let mut setup: Vec<String> = vec![config.elm_command().to_string()];
            setup.extend(config.init_commands.iter().cloned());
            if profile.quirks.custom_headers {
                if let Some(headers) = &config.headers {
                    setup.push(format!("ATSH{}", headers.request));
                }
            }
            for command in &setup {
                match self.engine.execute(command).await {
                    Ok(reply) if is_adapter_error(&reply) => {
                        warn!("Adapter answered {} with '{}'", command, reply)
                    }
                    Ok(_) => {}
                    Err(e) if e.is_channel_failure() => return Err(e),
                    Err(e) => warn!("Protocol setup command {} failed: {}", command, e),
                }
            }

            match self.engine.execute_with_timeout("0100", timeout).await {
                Ok(reply) => match payload_after(&reply, &[0x41, 0x00]) {
                    Some(bitmap) if bitmap.len() >= 4 => {
                        self.supported_pids = decode_supported_pids(0x00, &bitmap);
                        self.protocol = Some(config.protocol);
                        self.timeout = timeout;
                        info!(
                            "Vehicle answered on {} ({} PIDs advertised)",
                            config.protocol,
                            self.supported_pids.len()
                        );
                        return Ok(config.protocol);
                    }
                    _ => debug!("No 41 00 frame on {}: '{}'", config.protocol, reply),
                },
                Err(e) if e.is_channel_failure() => return Err(e),
                Err(e) => debug!("Protocol attempt on {} failed: {}", config.protocol, e),
            }
        }

        Err(ObdError::Connection(format!(
            "Bus init failed: no answer on {} protocol(s) for {}",
            sequence.len(),
            profile.make
        )))
    }

    /// Query a Mode 01 PID
    ///
    /// Unknown PIDs are rejected before anything is sent. A `NO DATA` or
    /// undecodable reply gives a reading without a value.
    pub async fn read_pid(&self, pid: &str) -> Result<PidReading, ObdError> {
        let code = normalize_pid(pid);
        let descriptor = *self
            .registry
            .get(&code)
            .ok_or_else(|| ObdError::Unsupported(format!("PID {}", code)))?;
        let pid_byte = u8::from_str_radix(descriptor.code, 16)
            .map_err(|_| ObdError::Unsupported(format!("PID {}", code)))?;
        let response_sid = mode::CURRENT_DATA + 0x40;

        let reply = self
            .engine
            .execute_with_timeout(
                &format!("{:02X}{}", mode::CURRENT_DATA, descriptor.code),
                self.timeout,
            )
            .await?;
        let value = payload_after(&reply, &[response_sid, pid_byte])
            .and_then(|bytes| descriptor.decode_bytes(&bytes));
        if value.is_none() {
            debug!("PID {} gave no value: '{}'", descriptor.code, reply);
        }

        Ok(PidReading {
            pid: descriptor.code.to_string(),
            name: descriptor.name.to_string(),
            value,
            unit: descriptor.unit.to_string(),
            timestamp: Utc::now(),
            raw: reply,
        })
    }

    /// Stored trouble codes (Mode 03)
    pub async fn read_dtc(&self) -> Result<Vec<DtcEntry>, ObdError> {
        self.read_dtc_service(DtcService::Stored).await
    }

    /// Pending trouble codes (Mode 07)
    pub async fn read_pending_dtc(&self) -> Result<Vec<DtcEntry>, ObdError> {
        self.read_dtc_service(DtcService::Pending).await
    }

    async fn read_dtc_service(&self, service: DtcService) -> Result<Vec<DtcEntry>, ObdError> {
        let reply = self
            .engine
            .execute_with_timeout(service.request(), self.timeout)
            .await?;
        let codes = parse_dtc_response(&reply, service)?
            .into_iter()
            .map(|raw| self.dtc_database.entry(raw))
            .collect::<Vec<_>>();
        info!("Read {} DTC(s) with mode {}", codes.len(), service.request());
        Ok(codes)
    }

    /// Clear stored codes and the MIL (Mode 04)
    pub async fn clear_dtc(&self) -> Result<bool, ObdError> {
        let command = format!("{:02X}", mode::CLEAR_DTC);
        let reply = self.engine.execute_with_timeout(&command, self.timeout).await?;
        let cleared = reply.contains("44");
        if cleared {
            info!("DTCs cleared");
        } else {
            warn!("Clear DTC not acknowledged: '{}'", reply);
        }
        Ok(cleared)
    }

    /// Vehicle identification number (Mode 09 PID 02)
    pub async fn read_vin(&self) -> Result<String, ObdError> {
        let command = format!("{:02X}02", mode::VEHICLE_INFO);
        let reply = self.engine.execute_with_timeout(&command, self.timeout).await?;
        if reply.to_uppercase().contains("NO DATA") {
            return Err(ObdError::Unsupported("Vehicle does not report a VIN".into()));
        }
        parse_vin(&reply)
            .ok_or_else(|| ObdError::Protocol(format!("Malformed VIN reply '{}'", reply)))
    }

    /// Supply voltage measured by the adapter (`ATRV`)
    pub async fn read_voltage(&self) -> Result<f64, ObdError> {
        let reply = self.engine.execute("ATRV").await?;
        parse_voltage(&reply)
            .ok_or_else(|| ObdError::Protocol(format!("Unexpected ATRV reply '{}'", reply)))
    }

    pub async fn close(&self) {
        self.engine.close().await;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_open(&self) -> bool {
        self.engine.is_open()
    }

    pub fn link_status(&self) -> watch::Receiver<LinkStatus> {
        self.engine.subscribe_status()
    }

    pub fn protocol(&self) -> Option<ObdProtocol> {
        self.protocol
    }

    pub fn supported_pids(&self) -> &[String] {
        &self.supported_pids
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }

    /// Identity and negotiated protocol, once initialization succeeded
    pub fn adapter_info(&self) -> Option<AdapterInfo> {
        Some(AdapterInfo {
            identity: self.identity.clone()?,
            protocol: self.protocol?,
            supported_pids: self.supported_pids.clone(),
            connection: self.engine.connection_info().clone(),
        })
    }
}
