//! Vehicle Protocol Selector
//!
//! Static make/year profiles deciding which OBD protocol to try first, which
//! fallbacks follow, and which timing quirks apply. The table is built once at
//! construction; custom profiles are supplied to the constructor and searched
//! before the built-in ones.

use crate::protocol::{ObdProtocol, ProtocolConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// First model year resolved to the generic CAN profile
pub const MODERN_YEAR_THRESHOLD: u16 = 2008;

/// Timeout floor for profiles flagged `extended_timeout`
const EXTENDED_TIMEOUT_MS: u64 = 5000;
/// Timeout floor for profiles flagged `slow_init`
const SLOW_INIT_TIMEOUT_MS: u64 = 6000;

const GENERIC_MAKE: &str = "Generic";

/// Inclusive model year bracket; open-ended on either side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct YearRange {
    pub min: Option<u16>,
    pub max: Option<u16>,
}

impl YearRange {
    pub fn from(min: u16) -> Self {
        Self { min: Some(min), max: None }
    }

    pub fn until(max: u16) -> Self {
        Self { min: None, max: Some(max) }
    }

    pub fn contains(&self, year: u16) -> bool {
        self.min.map_or(true, |min| year >= min) && self.max.map_or(true, |max| year <= max)
    }
}

/// Vehicle-specific workarounds
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Quirks {
    /// ECU needs the 5 baud wake-up and a long settle time
    #[serde(default)]
    pub slow_init: bool,
    /// Some commands answer slower than the protocol default
    #[serde(default)]
    pub extended_timeout: bool,
    /// Functional request header must be set explicitly
    #[serde(default)]
    pub custom_headers: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Protocol profile for a make (optionally model and year bracket)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleProfile {
    pub make: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub year_range: Option<YearRange>,
    pub primary: ProtocolConfig,
    /// Never empty: always terminated by auto-detect
    pub fallbacks: Vec<ProtocolConfig>,
    #[serde(default)]
    pub quirks: Quirks,
}

impl VehicleProfile {
    /// Build a profile, appending auto-detect to the fallback list if missing
    pub fn new(
        make: &str,
        year_range: Option<YearRange>,
        primary: ObdProtocol,
        fallbacks: &[ObdProtocol],
        quirks: Quirks,
    ) -> Self {
        let mut fallbacks: Vec<ProtocolConfig> =
            fallbacks.iter().map(|p| ProtocolConfig::standard(*p)).collect();
        if !fallbacks.iter().any(|p| p.protocol == ObdProtocol::Auto) {
            fallbacks.push(ProtocolConfig::standard(ObdProtocol::Auto));
        }

        Self {
            make: make.to_string(),
            model: None,
            year_range,
            primary: ProtocolConfig::standard(primary),
            fallbacks,
            quirks,
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    fn matches_make(&self, normalized_make: &str) -> bool {
        self.make.trim().to_lowercase() == normalized_make
    }

    fn matches_year(&self, year: Option<u16>) -> bool {
        match (year, self.year_range) {
            (Some(year), Some(range)) => range.contains(year),
            _ => true,
        }
    }

    /// Primary protocol followed by fallbacks, in attempt order
    pub fn protocol_sequence(&self) -> Vec<ProtocolConfig> {
        std::iter::once(self.primary.clone())
            .chain(self.fallbacks.iter().cloned())
            .collect()
    }

    /// Command timeout adjusted for the profile's quirks
    pub fn recommended_timeout(&self) -> Duration {
        let mut timeout_ms = self.primary.timeout_ms;
        if self.quirks.extended_timeout {
            timeout_ms = timeout_ms.max(EXTENDED_TIMEOUT_MS);
        }
        if self.quirks.slow_init {
            timeout_ms = timeout_ms.max(SLOW_INIT_TIMEOUT_MS);
        }
        Duration::from_millis(timeout_ms)
    }

    pub fn init_commands(&self) -> &[String] {
        &self.primary.init_commands
    }

    pub fn requires_slow_init(&self) -> bool {
        self.quirks.slow_init
    }

    /// Operator-facing hint derived from the quirks
    pub fn guidance(&self) -> Option<String> {
        let mut parts = Vec::new();
        if self.quirks.slow_init {
            parts.push(format!(
                "Slow-init vehicle: keep ignition on and allow about {}s for the ECU to respond.",
                self.recommended_timeout().as_secs()
            ));
        }
        if let Some(notes) = &self.quirks.notes {
            parts.push(notes.clone());
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

/// Make/year → protocol profile lookup
#[derive(Debug, Clone)]
pub struct ProtocolSelector {
    profiles: Vec<VehicleProfile>,
    generic_modern: VehicleProfile,
    generic_legacy: VehicleProfile,
}

impl ProtocolSelector {
    /// Selector over the built-in profile table
    pub fn new() -> Self {
        Self::with_profiles(Vec::new())
    }

    /// Selector whose custom profiles are matched before the built-in ones
    pub fn with_profiles(custom: Vec<VehicleProfile>) -> Self {
        let mut profiles = custom;
        profiles.extend(builtin_profiles());
        Self {
            profiles,
            generic_modern: generic_modern(),
            generic_legacy: generic_legacy(),
        }
    }

    /// Resolve the profile for a make and optional model year
    pub fn get_profile(&self, make: &str, year: Option<u16>) -> &VehicleProfile {
        let normalized = make.trim().to_lowercase();

        if let Some(profile) = self
            .profiles
            .iter()
            .find(|p| p.matches_make(&normalized) && p.matches_year(year))
        {
            debug!(make = %make, ?year, model = ?profile.model, "Matched vehicle profile");
            return profile;
        }

        match year {
            Some(year) if year < MODERN_YEAR_THRESHOLD => &self.generic_legacy,
            _ => &self.generic_modern,
        }
    }

    pub fn get_protocol_sequence(&self, make: &str, year: Option<u16>) -> Vec<ProtocolConfig> {
        self.get_profile(make, year).protocol_sequence()
    }

    pub fn get_recommended_timeout(&self, make: &str, year: Option<u16>) -> Duration {
        self.get_profile(make, year).recommended_timeout()
    }

    pub fn get_init_commands(&self, make: &str, year: Option<u16>) -> Vec<String> {
        self.get_profile(make, year).init_commands().to_vec()
    }

    pub fn requires_slow_init(&self, make: &str, year: Option<u16>) -> bool {
        self.get_profile(make, year).requires_slow_init()
    }
}

impl Default for ProtocolSelector {
    fn default() -> Self {
        Self::new()
    }
}

fn generic_modern() -> VehicleProfile {
    use ObdProtocol::*;
    VehicleProfile::new(
        GENERIC_MAKE,
        Some(YearRange::from(MODERN_YEAR_THRESHOLD)),
        Iso15765_4Can11bit500,
        &[Iso15765_4Can29bit500, Iso9141_2, Iso14230_4KwpFast],
        Quirks::default(),
    )
    .with_model("Modern (2008+)")
}

fn generic_legacy() -> VehicleProfile {
    use ObdProtocol::*;
    VehicleProfile::new(
        GENERIC_MAKE,
        Some(YearRange::until(MODERN_YEAR_THRESHOLD - 1)),
        Iso9141_2,
        &[Iso14230_4Kwp, Iso14230_4KwpFast, J1850Vpw, J1850Pwm],
        Quirks::default(),
    )
    .with_model("Legacy (pre-2008)")
}

fn builtin_profiles() -> Vec<VehicleProfile> {
    use ObdProtocol::*;

    let modern_toyota = |make: &str, notes: &str| {
        VehicleProfile::new(
            make,
            Some(YearRange::from(2008)),
            Iso15765_4Can11bit500,
            &[Iso15765_4Can29bit500, Iso9141_2],
            Quirks {
                custom_headers: true,
                notes: Some(notes.to_string()),
                ..Default::default()
            },
        )
    };
    // CAN after ISO/KWP on pre-2008 cars is kept for late-model-year overlap
    let legacy_toyota = |make: &str, notes: &str| {
        VehicleProfile::new(
            make,
            Some(YearRange::until(2007)),
            Iso9141_2,
            &[Iso14230_4Kwp, Iso15765_4Can11bit500],
            Quirks {
                slow_init: true,
                extended_timeout: true,
                notes: Some(notes.to_string()),
                ..Default::default()
            },
        )
    };
    let since = |make: &str, year: u16, fallbacks: &[ObdProtocol]| {
        VehicleProfile::new(
            make,
            Some(YearRange::from(year)),
            Iso15765_4Can11bit500,
            fallbacks,
            Quirks::default(),
        )
    };

    vec![
        modern_toyota(
            "Toyota",
            "Modern Toyota uses CAN 11-bit 500 kbps; some hybrids answer on extended CAN.",
        ),
        legacy_toyota(
            "Toyota",
            "Legacy Toyota uses ISO 9141-2 with the slow 5 baud init.",
        ),
        modern_toyota(
            "Lexus",
            "Lexus follows the Toyota protocol for the same model years.",
        ),
        legacy_toyota("Lexus", "Legacy Lexus uses ISO 9141-2 with the slow init."),
        since("Ford", 1996, &[J1850Pwm, Iso9141_2]),
        since("GM", 1996, &[J1850Vpw, Iso9141_2]),
        since("Chrysler", 1996, &[J1850Vpw, Iso9141_2]),
        since("Honda", 2008, &[Iso9141_2]),
        since("Nissan", 2008, &[Iso9141_2]),
        since("BMW", 2001, &[Iso14230_4KwpFast, Iso9141_2]),
        since("Mercedes-Benz", 2001, &[Iso14230_4KwpFast, Iso9141_2]),
        since("Volkswagen", 2004, &[Iso14230_4KwpFast, Iso9141_2]),
        since("Audi", 2004, &[Iso14230_4KwpFast, Iso9141_2]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toyota_modern_uses_can() {
        let selector = ProtocolSelector::new();
        let profile = selector.get_profile("Toyota", Some(2015));
        assert_eq!(profile.primary.protocol, ObdProtocol::Iso15765_4Can11bit500);
        assert_eq!(profile.primary.elm_command(), "ATSP6");
        assert!(!profile.requires_slow_init());
    }

    #[test]
    fn test_toyota_legacy_uses_iso_with_slow_init() {
        let selector = ProtocolSelector::new();
        let profile = selector.get_profile("Toyota", Some(2005));
        assert_eq!(profile.primary.protocol, ObdProtocol::Iso9141_2);
        assert_eq!(profile.primary.elm_command(), "ATSP3");
        assert!(profile.quirks.slow_init);
        assert_eq!(
            selector.get_recommended_timeout("Toyota", Some(2005)),
            Duration::from_millis(6000)
        );
        assert_eq!(selector.get_init_commands("Toyota", Some(2005)), vec!["ATST64".to_string()]);
    }

    #[test]
    fn test_boundary_year_is_modern() {
        let selector = ProtocolSelector::new();
        assert!(selector.get_profile("Toyota", Some(2008)).primary.protocol.is_can());
        assert_eq!(
            selector.get_profile("Toyota", Some(2007)).primary.protocol,
            ObdProtocol::Iso9141_2
        );
        assert!(selector.get_profile("Zastava", Some(2008)).primary.protocol.is_can());
        assert_eq!(
            selector.get_profile("Zastava", Some(2007)).primary.protocol,
            ObdProtocol::Iso9141_2
        );
    }

    #[test]
    fn test_unknown_make_resolves_generic() {
        let selector = ProtocolSelector::new();

        let modern = selector.get_profile("Lada", Some(2015));
        assert_eq!(modern.make, "Generic");
        assert_eq!(modern.model.as_deref(), Some("Modern (2008+)"));
        assert_eq!(modern.primary.protocol.id(), "CAN_11B_500");

        let legacy = selector.get_profile("Lada", Some(2005));
        assert_eq!(legacy.model.as_deref(), Some("Legacy (pre-2008)"));
        assert_eq!(legacy.primary.protocol.id(), "ISO_9141_2");

        let no_year = selector.get_profile("Lada", None);
        assert_eq!(no_year.model.as_deref(), Some("Modern (2008+)"));
    }

    #[test]
    fn test_make_lookup_is_normalized() {
        let selector = ProtocolSelector::new();
        let profile = selector.get_profile("  tOyOtA ", Some(2005));
        assert_eq!(profile.make, "Toyota");
        assert!(profile.quirks.slow_init);
    }

    #[test]
    fn test_no_year_returns_first_make_profile() {
        let selector = ProtocolSelector::new();
        let profile = selector.get_profile("Toyota", None);
        assert_eq!(profile.year_range, Some(YearRange::from(2008)));
    }

    #[test]
    fn test_exact_make_out_of_bracket_falls_back_to_generic() {
        let selector = ProtocolSelector::new();
        let profile = selector.get_profile("Honda", Some(2004));
        assert_eq!(profile.make, "Generic");
        assert_eq!(profile.primary.protocol, ObdProtocol::Iso9141_2);
    }

    #[test]
    fn test_sequence_is_primary_then_fallbacks_ending_in_auto() {
        let selector = ProtocolSelector::new();
        let sequence: Vec<ObdProtocol> = selector
            .get_protocol_sequence("Toyota", Some(2005))
            .iter()
            .map(|p| p.protocol)
            .collect();
        assert_eq!(
            sequence,
            vec![
                ObdProtocol::Iso9141_2,
                ObdProtocol::Iso14230_4Kwp,
                ObdProtocol::Iso15765_4Can11bit500,
                ObdProtocol::Auto,
            ]
        );
    }

    #[test]
    fn test_every_profile_has_auto_fallback() {
        let generic = [generic_modern(), generic_legacy()];
        for profile in builtin_profiles().iter().chain(generic.iter()) {
            assert!(!profile.fallbacks.is_empty());
            assert_eq!(profile.fallbacks.last().map(|p| p.protocol), Some(ObdProtocol::Auto));
        }
    }

    #[test]
    fn test_custom_profile_takes_precedence() {
        let custom = VehicleProfile::new(
            "Toyota",
            Some(YearRange::from(2020)),
            ObdProtocol::Iso15765_4Can29bit500,
            &[],
            Quirks::default(),
        );
        let selector = ProtocolSelector::with_profiles(vec![custom]);
        assert_eq!(
            selector.get_profile("toyota", Some(2022)).primary.protocol,
            ObdProtocol::Iso15765_4Can29bit500
        );
        // Outside the custom bracket the built-in table still answers
        assert_eq!(
            selector.get_profile("toyota", Some(2015)).primary.protocol,
            ObdProtocol::Iso15765_4Can11bit500
        );
    }

    #[test]
    fn test_guidance_mentions_slow_init() {
        let selector = ProtocolSelector::new();
        let guidance = selector.get_profile("Lexus", Some(2003)).guidance().unwrap_or_default();
        assert!(guidance.contains("Slow-init"));
        assert!(selector.get_profile("Lada", Some(2015)).guidance().is_none());
    }
}
