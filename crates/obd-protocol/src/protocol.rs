//! OBD-II Protocol Definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported OBD-II protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ObdProtocol {
    /// Automatic protocol detection
    #[default]
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (5 baud init, 10.4 kbaud)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
}

impl ObdProtocol {
    /// Get the ELM327 AT command for this protocol
    pub fn to_elm_command(&self) -> &'static str {
        match self {
            ObdProtocol::Auto => "ATSP0",
            ObdProtocol::J1850Pwm => "ATSP1",
            ObdProtocol::J1850Vpw => "ATSP2",
            ObdProtocol::Iso9141_2 => "ATSP3",
            ObdProtocol::Iso14230_4Kwp => "ATSP4",
            ObdProtocol::Iso14230_4KwpFast => "ATSP5",
            ObdProtocol::Iso15765_4Can11bit500 => "ATSP6",
            ObdProtocol::Iso15765_4Can29bit500 => "ATSP7",
            ObdProtocol::Iso15765_4Can11bit250 => "ATSP8",
            ObdProtocol::Iso15765_4Can29bit250 => "ATSP9",
        }
    }

    /// Short identifier used in profiles and logs (e.g. `CAN_11B_500`)
    pub fn id(&self) -> &'static str {
        match self {
            ObdProtocol::Auto => "AUTO",
            ObdProtocol::J1850Pwm => "J1850_PWM",
            ObdProtocol::J1850Vpw => "J1850_VPW",
            ObdProtocol::Iso9141_2 => "ISO_9141_2",
            ObdProtocol::Iso14230_4Kwp => "KWP_5BAUD",
            ObdProtocol::Iso14230_4KwpFast => "KWP_FAST",
            ObdProtocol::Iso15765_4Can11bit500 => "CAN_11B_500",
            ObdProtocol::Iso15765_4Can29bit500 => "CAN_29B_500",
            ObdProtocol::Iso15765_4Can11bit250 => "CAN_11B_250",
            ObdProtocol::Iso15765_4Can29bit250 => "CAN_29B_250",
        }
    }

    /// Check if this is a CAN protocol
    pub fn is_can(&self) -> bool {
        matches!(
            self,
            ObdProtocol::Iso15765_4Can11bit500
                | ObdProtocol::Iso15765_4Can29bit500
                | ObdProtocol::Iso15765_4Can11bit250
                | ObdProtocol::Iso15765_4Can29bit250
        )
    }
}

impl fmt::Display for ObdProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// CAN request/response header pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanHeaders {
    /// Functional request header sent with `ATSH`
    pub request: String,
    /// Expected ECU response header
    pub response: String,
}

/// Everything needed to bring up one protocol on the adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Protocol identifier
    pub protocol: ObdProtocol,
    /// Recommended command timeout in milliseconds
    pub timeout_ms: u64,
    /// Additional adapter commands sent after `ATSPn`
    #[serde(default)]
    pub init_commands: Vec<String>,
    /// CAN headers, if applicable
    #[serde(default)]
    pub headers: Option<CanHeaders>,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
}

impl ProtocolConfig {
    /// The `ATSPn` command selecting this protocol
    pub fn elm_command(&self) -> &'static str {
        self.protocol.to_elm_command()
    }

    /// Built-in configuration for a protocol
    pub fn standard(protocol: ObdProtocol) -> Self {
        match protocol {
            ObdProtocol::Auto => {
                Self::build(protocol, 5000, &[], None, "Automatic protocol detection")
            }
            ObdProtocol::J1850Pwm => {
                Self::build(protocol, 2000, &[], None, "SAE J1850 PWM (Ford, 41.6 kbps)")
            }
            ObdProtocol::J1850Vpw => {
                Self::build(protocol, 2000, &[], None, "SAE J1850 VPW (GM, 10.4 kbps)")
            }
            // ATST64 raises the adapter's own timeout for the 5 baud wake-up
            ObdProtocol::Iso9141_2 => Self::build(
                protocol,
                5000,
                &["ATST64"],
                None,
                "ISO 9141-2 (5 baud init, 10.4 kbps)",
            ),
            ObdProtocol::Iso14230_4Kwp => Self::build(
                protocol,
                5000,
                &["ATST64"],
                None,
                "ISO 14230-4 KWP2000 5 baud init",
            ),
            ObdProtocol::Iso14230_4KwpFast => {
                Self::build(protocol, 3000, &[], None, "ISO 14230-4 KWP2000 fast init")
            }
            ObdProtocol::Iso15765_4Can11bit500 => Self::build(
                protocol,
                2000,
                &[],
                Some(("7DF", "7E8")),
                "ISO 15765-4 CAN 11-bit 500 kbps",
            ),
            ObdProtocol::Iso15765_4Can29bit500 => Self::build(
                protocol,
                2000,
                &[],
                Some(("18DB33F1", "18DAF110")),
                "ISO 15765-4 CAN 29-bit 500 kbps",
            ),
            ObdProtocol::Iso15765_4Can11bit250 => {
                Self::build(protocol, 2000, &[], None, "ISO 15765-4 CAN 11-bit 250 kbps")
            }
            ObdProtocol::Iso15765_4Can29bit250 => {
                Self::build(protocol, 2000, &[], None, "ISO 15765-4 CAN 29-bit 250 kbps")
            }
        }
    }

    fn build(
        protocol: ObdProtocol,
        timeout_ms: u64,
        init_commands: &[&str],
        headers: Option<(&str, &str)>,
        description: &str,
    ) -> Self {
        Self {
            protocol,
            timeout_ms,
            init_commands: init_commands.iter().map(|c| c.to_string()).collect(),
            headers: headers.map(|(request, response)| CanHeaders {
                request: request.to_string(),
                response: response.to_string(),
            }),
            description: description.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elm_commands() {
        assert_eq!(ObdProtocol::Auto.to_elm_command(), "ATSP0");
        assert_eq!(ObdProtocol::Iso9141_2.to_elm_command(), "ATSP3");
        assert_eq!(ObdProtocol::Iso15765_4Can11bit500.to_elm_command(), "ATSP6");
    }

    #[test]
    fn test_standard_configs() {
        let can = ProtocolConfig::standard(ObdProtocol::Iso15765_4Can11bit500);
        assert_eq!(can.elm_command(), "ATSP6");
        assert_eq!(can.headers.as_ref().map(|h| h.request.as_str()), Some("7DF"));

        let iso = ProtocolConfig::standard(ObdProtocol::Iso9141_2);
        assert_eq!(iso.timeout_ms, 5000);
        assert_eq!(iso.init_commands, vec!["ATST64".to_string()]);
        assert!(iso.headers.is_none());
    }

    #[test]
    fn test_protocol_id_display() {
        assert_eq!(ObdProtocol::Iso15765_4Can11bit500.to_string(), "CAN_11B_500");
        assert_eq!(ObdProtocol::Iso14230_4Kwp.id(), "KWP_5BAUD");
    }
}
