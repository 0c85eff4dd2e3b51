//! Diagnostic Trouble Codes
//!
//! Two-byte code decoding, Mode 03/07 response parsing and a small
//! reference table for descriptions and severities.

use crate::error::ObdError;
use crate::mode;
use crate::pid::parse_hex_bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// DTC system letter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtcCategory {
    /// Powertrain
    P,
    /// Chassis
    C,
    /// Body
    B,
    /// Network
    U,
}

impl DtcCategory {
    /// Category from the top two bits of the first DTC byte
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => DtcCategory::P,
            1 => DtcCategory::C,
            2 => DtcCategory::B,
            _ => DtcCategory::U,
        }
    }

    /// Category named by the first character of a code
    pub fn from_code(code: &str) -> Option<Self> {
        match code.chars().next()?.to_ascii_uppercase() {
            'P' => Some(DtcCategory::P),
            'C' => Some(DtcCategory::C),
            'B' => Some(DtcCategory::B),
            'U' => Some(DtcCategory::U),
            _ => None,
        }
    }

    pub fn letter(&self) -> char {
        match self {
            DtcCategory::P => 'P',
            DtcCategory::C => 'C',
            DtcCategory::B => 'B',
            DtcCategory::U => 'U',
        }
    }
}

impl fmt::Display for DtcCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A decoded trouble code with its reference data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtcEntry {
    /// Five-character code, e.g. `P0171`
    pub code: String,
    pub category: DtcCategory,
    pub description: String,
    pub severity: Severity,
    /// The two bytes the code was decoded from
    pub raw: [u8; 2],
}

/// How the two raw bytes map onto a five-character code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcLayout {
    /// SAE J2012: top two bits pick the letter, bits 5-4 the first digit
    #[default]
    Sae,
    /// Always `P`; top two bits give the first digit, the low nibble the
    /// second. Only for reports produced by older kiosk builds.
    Legacy,
}

impl DtcLayout {
    pub fn decode(&self, byte1: u8, byte2: u8) -> String {
        match self {
            DtcLayout::Sae => format!(
                "{}{}{:X}{:02X}",
                DtcCategory::from_bits(byte1 >> 6),
                (byte1 >> 4) & 0x03,
                byte1 & 0x0F,
                byte2
            ),
            DtcLayout::Legacy => format!("P{}{:X}{:02X}", byte1 >> 6, byte1 & 0x0F, byte2),
        }
    }
}

/// Decode two raw bytes into a five-character SAE code (e.g. `P0420`)
pub fn decode_dtc(byte1: u8, byte2: u8) -> String {
    DtcLayout::Sae.decode(byte1, byte2)
}

/// Which DTC service a response answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtcService {
    /// Mode 03, stored codes
    Stored,
    /// Mode 07, pending codes
    Pending,
}

impl DtcService {
    pub fn request(&self) -> &'static str {
        match self {
            DtcService::Stored => "03",
            DtcService::Pending => "07",
        }
    }

    /// Positive-response service id (`mode + 0x40`)
    fn response_sid(&self) -> u8 {
        let mode = match self {
            DtcService::Stored => mode::READ_DTC,
            DtcService::Pending => mode::PENDING_DTC,
        };
        mode + 0x40
    }
}

/// Parse a Mode 03/07 response into raw DTC byte pairs
///
/// Each line starting with the service's response id is parsed on its own
/// (one per ECU); ISO-TP frames are stitched together first. CAN
/// replies carry a count byte after the service id and so have an odd number
/// of bytes; legacy replies are bare pairs padded with `00 00`.
pub fn parse_dtc_response(response: &str, service: DtcService) -> Result<Vec<[u8; 2]>, ObdError> {
    let upper = response.to_uppercase();
    if upper.contains("NO DATA") {
        return Ok(Vec::new());
    }

    let mut pairs = Vec::new();
    let mut saw_frame = false;

    for line in reassemble_frames(&upper) {
        let Some(bytes) = parse_hex_bytes(&line) else {
            continue;
        };
        if bytes.first() != Some(&service.response_sid()) {
            continue;
        }
        saw_frame = true;

        let data = &bytes[1..];
        let (limit, codes) = if data.len() % 2 == 1 {
            (Some(data[0] as usize), &data[1..])
        } else {
            (None, data)
        };

        let decoded = codes
            .chunks_exact(2)
            .map(|pair| [pair[0], pair[1]])
            .filter(|pair| *pair != [0, 0]);
        match limit {
            Some(count) => pairs.extend(decoded.take(count)),
            None => pairs.extend(decoded),
        }
    }

    if !saw_frame {
        return Err(ObdError::Protocol(format!(
            "no {} frame in DTC response '{}'",
            service.request(),
            response.trim()
        )));
    }

    pairs.dedup();
    Ok(pairs)
}

// ISO-TP multi-frame replies arrive as "0:", "1:", ... prefixed lines and
// are stitched back into one frame. Plain lines stand alone.
pub(crate) fn reassemble_frames(response: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut stitched = String::new();
    for line in response.split(['\r', '\n']) {
        match line.split_once(':') {
            Some((index, rest))
                if !index.trim().is_empty()
                    && index.trim().chars().all(|c| c.is_ascii_hexdigit()) =>
            {
                stitched.push_str(rest);
            }
            _ => out.push(line.to_string()),
        }
    }
    if !stitched.is_empty() {
        out.push(stitched);
    }
    out
}

const REFERENCE: &[(&str, &str, Severity)] = &[
    ("P0100", "Mass Air Flow Circuit Malfunction", Severity::Medium),
    ("P0101", "Mass Air Flow Circuit Range/Performance Problem", Severity::Medium),
    ("P0113", "Intake Air Temperature Circuit High Input", Severity::Low),
    ("P0117", "Engine Coolant Temperature Circuit Low Input", Severity::Medium),
    ("P0118", "Engine Coolant Temperature Circuit High Input", Severity::Medium),
    ("P0128", "Coolant Thermostat Below Regulating Temperature", Severity::Low),
    ("P0133", "O2 Sensor Circuit Slow Response (Bank 1 Sensor 1)", Severity::Low),
    ("P0171", "System Too Lean (Bank 1)", Severity::Medium),
    ("P0172", "System Too Rich (Bank 1)", Severity::Medium),
    ("P0174", "System Too Lean (Bank 2)", Severity::Medium),
    ("P0175", "System Too Rich (Bank 2)", Severity::Medium),
    ("P0217", "Engine Overtemperature Condition", Severity::Critical),
    ("P0300", "Random/Multiple Cylinder Misfire Detected", Severity::High),
    ("P0301", "Cylinder 1 Misfire Detected", Severity::High),
    ("P0302", "Cylinder 2 Misfire Detected", Severity::High),
    ("P0303", "Cylinder 3 Misfire Detected", Severity::High),
    ("P0304", "Cylinder 4 Misfire Detected", Severity::High),
    ("P0335", "Crankshaft Position Sensor A Circuit Malfunction", Severity::High),
    ("P0401", "Exhaust Gas Recirculation Flow Insufficient", Severity::Medium),
    ("P0420", "Catalyst System Efficiency Below Threshold (Bank 1)", Severity::Medium),
    ("P0440", "Evaporative Emission Control System Malfunction", Severity::Low),
    ("P0442", "EVAP System Leak Detected (small leak)", Severity::Low),
    ("P0455", "EVAP System Leak Detected (large leak)", Severity::Low),
    ("P0500", "Vehicle Speed Sensor Malfunction", Severity::Medium),
    ("P0505", "Idle Control System Malfunction", Severity::Medium),
    ("P0562", "System Voltage Low", Severity::High),
    ("P0700", "Transmission Control System Malfunction", Severity::High),
    ("C0035", "Left Front Wheel Speed Sensor Circuit", Severity::High),
    ("C0300", "Rear Speed Sensor Malfunction", Severity::High),
    ("B0001", "Driver Frontal Stage 1 Deployment Control", Severity::Critical),
    ("B1000", "ECU Malfunction (body)", Severity::Medium),
    ("U0100", "Lost Communication With ECM/PCM A", Severity::Critical),
    ("U0101", "Lost Communication With TCM", Severity::High),
    ("U0121", "Lost Communication With ABS Control Module", Severity::High),
];

/// Description and severity lookup for decoded codes
#[derive(Debug, Clone)]
pub struct DtcDatabase {
    entries: HashMap<String, (String, Severity)>,
    layout: DtcLayout,
}

impl DtcDatabase {
    pub fn standard() -> Self {
        Self::with_overrides(HashMap::new())
    }

    /// Standard table with entries added or replaced by `overrides`
    pub fn with_overrides(overrides: HashMap<String, (String, Severity)>) -> Self {
        let mut entries: HashMap<String, (String, Severity)> = REFERENCE
            .iter()
            .map(|(code, description, severity)| {
                (code.to_string(), (description.to_string(), *severity))
            })
            .collect();
        for (code, info) in overrides {
            entries.insert(code.trim().to_uppercase(), info);
        }
        Self {
            entries,
            layout: DtcLayout::default(),
        }
    }

    pub fn with_layout(mut self, layout: DtcLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn layout(&self) -> DtcLayout {
        self.layout
    }

    /// Build a full entry for a raw byte pair
    pub fn entry(&self, raw: [u8; 2]) -> DtcEntry {
        let code = self.layout.decode(raw[0], raw[1]);
        let (description, severity) = match self.entries.get(&code) {
            Some((description, severity)) => (description.clone(), *severity),
            None => ("Unknown trouble code".to_string(), Severity::Medium),
        };
        DtcEntry {
            category: DtcCategory::from_code(&code).unwrap_or(DtcCategory::P),
            code,
            description,
            severity,
            raw,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DtcDatabase {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_powertrain_codes() {
        assert_eq!(decode_dtc(0x01, 0x71), "P0171");
        assert_eq!(decode_dtc(0x04, 0x20), "P0420");
        assert_eq!(decode_dtc(0x03, 0x01), "P0301");
    }

    #[test]
    fn test_decode_category_letters() {
        assert_eq!(decode_dtc(0x41, 0x00), "C0100");
        assert_eq!(decode_dtc(0x81, 0x00), "B0100");
        assert_eq!(decode_dtc(0xC1, 0x00), "U0100");
        assert_eq!(decode_dtc(0x11, 0x00), "P1100");
        assert_eq!(decode_dtc(0x1A, 0x0B), "P1A0B");
    }

    #[test]
    fn test_distinct_bytes_decode_to_distinct_codes() {
        let mut seen = std::collections::HashSet::new();
        for byte1 in 0..=u8::MAX {
            for byte2 in [0x00, 0x01, 0x7F, 0xFF] {
                assert!(seen.insert(decode_dtc(byte1, byte2)), "{:02X} {:02X}", byte1, byte2);
            }
        }
        assert_ne!(decode_dtc(0x11, 0x00), decode_dtc(0x01, 0x00));
    }

    #[test]
    fn test_legacy_layout_is_opt_in() {
        assert_eq!(DtcLayout::default(), DtcLayout::Sae);
        let legacy = DtcLayout::Legacy;
        assert_eq!(legacy.decode(0x41, 0x00), "P1100");
        assert_eq!(legacy.decode(0xC1, 0x00), "P3100");
        assert_eq!(legacy.decode(0x1A, 0x0B), "P0A0B");
    }

    #[test]
    fn test_parse_can_response_with_count() {
        let pairs = parse_dtc_response("43 03 01 71 04 20 03 01", DtcService::Stored).unwrap();
        assert_eq!(pairs, vec![[0x01, 0x71], [0x04, 0x20], [0x03, 0x01]]);
    }

    #[test]
    fn test_parse_legacy_response_with_padding() {
        let pairs = parse_dtc_response("43 01 71 00 00 00 00", DtcService::Stored).unwrap();
        assert_eq!(pairs, vec![[0x01, 0x71]]);

        let pairs = parse_dtc_response("43 01 71 04 20 00 00", DtcService::Stored).unwrap();
        assert_eq!(pairs, vec![[0x01, 0x71], [0x04, 0x20]]);
    }

    #[test]
    fn test_zero_count_and_no_data_are_empty() {
        assert!(parse_dtc_response("43 00", DtcService::Stored).unwrap().is_empty());
        assert!(parse_dtc_response("4300", DtcService::Stored).unwrap().is_empty());
        assert!(parse_dtc_response("NO DATA", DtcService::Stored).unwrap().is_empty());
    }

    #[test]
    fn test_pending_service_and_multi_line() {
        let response = "47 01 01 33\r47 01 04 20";
        let pairs = parse_dtc_response(response, DtcService::Pending).unwrap();
        assert_eq!(pairs, vec![[0x01, 0x33], [0x04, 0x20]]);
    }

    #[test]
    fn test_iso_tp_frame_indices() {
        let response = "00A\r0: 43 03 01 71 04\r1: 20 03 01 00 00";
        let pairs = parse_dtc_response(response, DtcService::Stored).unwrap();
        assert_eq!(pairs, vec![[0x01, 0x71], [0x04, 0x20], [0x03, 0x01]]);
    }

    #[test]
    fn test_service_id_only_at_line_start() {
        let result = parse_dtc_response("41 0D 43", DtcService::Stored);
        assert!(matches!(result, Err(ObdError::Protocol(_))));

        let response = "41 0D 43\r43 01 01 71";
        let pairs = parse_dtc_response(response, DtcService::Stored).unwrap();
        assert_eq!(pairs, vec![[0x01, 0x71]]);
    }

    #[test]
    fn test_garbled_response_is_protocol_error() {
        let result = parse_dtc_response("?", DtcService::Stored);
        assert!(matches!(result, Err(ObdError::Protocol(_))));
    }

    #[test]
    fn test_database_lookup() {
        let db = DtcDatabase::standard();
        let entry = db.entry([0x04, 0x20]);
        assert_eq!(entry.code, "P0420");
        assert_eq!(entry.category, DtcCategory::P);
        assert!(entry.description.contains("Catalyst"));
        assert_eq!(entry.severity, Severity::Medium);

        let unknown = db.entry([0x3F, 0xFF]);
        assert_eq!(unknown.code, "P3FFF");
        assert_eq!(unknown.description, "Unknown trouble code");
    }

    #[test]
    fn test_database_reports_category() {
        let db = DtcDatabase::standard();
        let entry = db.entry([0xC1, 0x00]);
        assert_eq!(entry.code, "U0100");
        assert_eq!(entry.category, DtcCategory::U);
        assert_eq!(entry.severity, Severity::Critical);
    }

    #[test]
    fn test_database_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("p0420".to_string(), ("Cat check".to_string(), Severity::Low));
        let db = DtcDatabase::with_overrides(overrides);
        let entry = db.entry([0x04, 0x20]);
        assert_eq!(entry.description, "Cat check");
        assert_eq!(entry.severity, Severity::Low);
    }
}
