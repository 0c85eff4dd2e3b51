//! OBD-II PID Definitions and Decoding
//!
//! Mode 01 parameter descriptors and their SAE J1979 formulas. Every decoder is
//! a pure function over the data bytes that follow the `41 <pid>` header and
//! returns `None` instead of failing on bad bus data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a PID payload is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodeKind {
    /// Linear formula over the data bytes
    Arithmetic,
    /// Packed flags and counters
    BitField,
    /// Printable characters
    Ascii,
}

/// Pure decode function: data bytes → value
pub type DecodeFn = fn(&[u8]) -> Option<f64>;

/// Registry entry for one Mode 01 PID
#[derive(Debug, Clone, Copy)]
pub struct PidDescriptor {
    /// Two hex digits, upper case (e.g. `0C`)
    pub code: &'static str,
    pub kind: DecodeKind,
    pub name: &'static str,
    pub unit: &'static str,
    /// Number of data bytes the formula consumes
    pub bytes: usize,
    pub decode: DecodeFn,
}

impl PidDescriptor {
    /// Decode already-parsed data bytes; `None` on short or non-finite input
    pub fn decode_bytes(&self, bytes: &[u8]) -> Option<f64> {
        if bytes.len() < self.bytes {
            return None;
        }
        (self.decode)(&bytes[..self.bytes]).filter(|v| v.is_finite())
    }
}

/// A decoded PID value as delivered to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidReading {
    /// PID code (e.g. `0C`)
    pub pid: String,
    pub name: String,
    /// `None` when the adapter answered with garbage or `NO DATA`
    pub value: Option<f64>,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    /// Sanitized adapter response the value was decoded from
    pub raw: String,
}

/// Monitor status decoded from PID 01
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStatus {
    /// Malfunction indicator lamp is lit
    pub mil_on: bool,
    /// Number of confirmed emission-related DTCs
    pub dtc_count: u8,
}

fn a(bytes: &[u8]) -> f64 {
    bytes[0] as f64
}

fn ab(bytes: &[u8]) -> f64 {
    (bytes[0] as f64 * 256.0) + bytes[1] as f64
}

fn decode_rpm(b: &[u8]) -> Option<f64> {
    Some(ab(b) / 4.0)
}

fn decode_temperature(b: &[u8]) -> Option<f64> {
    Some(a(b) - 40.0)
}

fn decode_raw_byte(b: &[u8]) -> Option<f64> {
    Some(a(b))
}

fn decode_percent(b: &[u8]) -> Option<f64> {
    Some(a(b) * 100.0 / 255.0)
}

fn decode_fuel_trim(b: &[u8]) -> Option<f64> {
    Some((a(b) - 128.0) * 100.0 / 128.0)
}

fn decode_maf(b: &[u8]) -> Option<f64> {
    Some(ab(b) / 100.0)
}

fn decode_o2_voltage(b: &[u8]) -> Option<f64> {
    Some(a(b) / 200.0)
}

fn decode_module_voltage(b: &[u8]) -> Option<f64> {
    Some(ab(b) / 1000.0)
}

fn decode_word(b: &[u8]) -> Option<f64> {
    Some(ab(b))
}

fn decode_monitor_dtc_count(b: &[u8]) -> Option<f64> {
    Some((b[0] & 0x7F) as f64)
}

const fn arithmetic(
    code: &'static str,
    name: &'static str,
    unit: &'static str,
    bytes: usize,
    decode: DecodeFn,
) -> PidDescriptor {
    PidDescriptor {
        code,
        kind: DecodeKind::Arithmetic,
        name,
        unit,
        bytes,
        decode,
    }
}

const STANDARD_PIDS: &[PidDescriptor] = &[
    PidDescriptor {
        code: "01",
        kind: DecodeKind::BitField,
        name: "Monitor Status (DTC count)",
        unit: "count",
        bytes: 4,
        decode: decode_monitor_dtc_count,
    },
    arithmetic("04", "Calculated Engine Load", "%", 1, decode_percent),
    arithmetic("05", "Engine Coolant Temperature", "°C", 1, decode_temperature),
    arithmetic("06", "Short Term Fuel Trim Bank 1", "%", 1, decode_fuel_trim),
    arithmetic("07", "Long Term Fuel Trim Bank 1", "%", 1, decode_fuel_trim),
    arithmetic("0B", "Intake Manifold Pressure", "kPa", 1, decode_raw_byte),
    arithmetic("0C", "Engine RPM", "rpm", 2, decode_rpm),
    arithmetic("0D", "Vehicle Speed", "km/h", 1, decode_raw_byte),
    arithmetic("0F", "Intake Air Temperature", "°C", 1, decode_temperature),
    arithmetic("10", "Mass Air Flow Rate", "g/s", 2, decode_maf),
    arithmetic("11", "Throttle Position", "%", 1, decode_percent),
    arithmetic("14", "O2 Sensor Voltage Bank 1 Sensor 1", "V", 1, decode_o2_voltage),
    arithmetic("1F", "Run Time Since Engine Start", "s", 2, decode_word),
    arithmetic("2F", "Fuel Tank Level", "%", 1, decode_percent),
    arithmetic("33", "Barometric Pressure", "kPa", 1, decode_raw_byte),
    arithmetic("42", "Control Module Voltage", "V", 2, decode_module_voltage),
    arithmetic("46", "Ambient Air Temperature", "°C", 1, decode_temperature),
    arithmetic("5C", "Engine Oil Temperature", "°C", 1, decode_temperature),
];

/// Immutable PID lookup table
#[derive(Debug, Clone)]
pub struct PidRegistry {
    descriptors: HashMap<String, PidDescriptor>,
}

impl PidRegistry {
    /// Registry with the standard Mode 01 PIDs
    pub fn standard() -> Self {
        Self::with_overrides(HashMap::new())
    }

    /// Standard registry with descriptors added or replaced by `overrides`
    pub fn with_overrides(overrides: HashMap<String, PidDescriptor>) -> Self {
        let mut descriptors: HashMap<String, PidDescriptor> = STANDARD_PIDS
            .iter()
            .map(|d| (d.code.to_string(), *d))
            .collect();
        for (code, descriptor) in overrides {
            descriptors.insert(normalize_pid(&code), descriptor);
        }
        Self { descriptors }
    }

    /// Look up a descriptor; the key is case- and whitespace-insensitive
    pub fn get(&self, pid: &str) -> Option<&PidDescriptor> {
        self.descriptors.get(&normalize_pid(pid))
    }

    pub fn contains(&self, pid: &str) -> bool {
        self.get(pid).is_some()
    }

    /// Decode a space-delimited hex payload (data bytes only)
    ///
    /// Returns `None` for unknown PIDs, malformed hex or too few bytes.
    pub fn decode(&self, pid: &str, payload: &str) -> Option<f64> {
        let descriptor = self.get(pid)?;
        let bytes = parse_hex_bytes(payload)?;
        descriptor.decode_bytes(&bytes)
    }

    /// All registered PID codes, sorted
    pub fn codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.descriptors.keys().cloned().collect();
        codes.sort();
        codes
    }
}

impl Default for PidRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Upper-case a PID key and strip whitespace
pub fn normalize_pid(pid: &str) -> String {
    pid.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

/// Parse hex text into bytes, ignoring whitespace and case
///
/// `None` on non-hex characters, an odd digit count, or empty input.
pub fn parse_hex_bytes(text: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}

/// Decode PID 01 data bytes into MIL state and DTC count
pub fn decode_monitor_status(bytes: &[u8]) -> Option<MonitorStatus> {
    let first = *bytes.first()?;
    Some(MonitorStatus {
        mil_on: first & 0x80 != 0,
        dtc_count: first & 0x7F,
    })
}

/// Decode a supported-PID bitmap (answer to PID 00, 20, 40, ...)
///
/// Bit 7 of the first byte is `base + 1`; returns upper-case PID codes.
pub fn decode_supported_pids(base: u8, bytes: &[u8]) -> Vec<String> {
    let mut supported = Vec::new();
    for (byte_index, byte) in bytes.iter().take(4).enumerate() {
        for bit in 0..8u8 {
            if byte & (0x80 >> bit) != 0 {
                let pid = base as usize + byte_index * 8 + bit as usize + 1;
                supported.push(format!("{:02X}", pid));
            }
        }
    }
    supported
}

/// Decode printable ASCII bytes, dropping padding and control characters
pub fn decode_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| b.is_ascii_graphic())
        .map(|b| *b as char)
        .collect()
}
