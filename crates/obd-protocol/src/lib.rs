//! OBD-II Protocol Implementation
//!
//! This crate provides async communication with ELM327-compatible OBD-II
//! adapters over serial, Bluetooth RFCOMM or a simulated channel: the
//! single-flight command engine, adapter initialization, vehicle protocol
//! selection and the PID/DTC decoders.

mod client;
mod dtc;
mod engine;
mod error;
mod pid;
mod profile;
mod protocol;
pub mod transport;

pub use client::{parse_vin, parse_voltage, AdapterInfo, ObdClient, VehicleInfo, INIT_SEQUENCE};
pub use dtc::{
    decode_dtc, parse_dtc_response, DtcCategory, DtcDatabase, DtcEntry, DtcLayout, DtcService,
    Severity,
};
pub use engine::{
    sanitize_response, split_at_prompt, EngineConfig, EngineHandle, EngineStats, LinkStatus,
};
pub use error::ObdError;
pub use pid::{
    decode_ascii, decode_monitor_status, decode_supported_pids, normalize_pid, parse_hex_bytes,
    DecodeFn, DecodeKind, MonitorStatus, PidDescriptor, PidReading, PidRegistry,
};
pub use profile::{ProtocolSelector, Quirks, VehicleProfile, YearRange, MODERN_YEAR_THRESHOLD};
pub use protocol::{CanHeaders, ObdProtocol, ProtocolConfig};
pub use transport::{
    ConnectionInfo, Transport, TransportEvent, TransportFactory, TransportKind, TransportSettings,
};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Pending trouble codes
    pub const PENDING_DTC: u8 = 0x07;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
}
