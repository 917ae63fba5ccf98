//! # Instrument Catalog Module
//!
//! Static catalog of the instruments the tuner supports and the strings
//! each one is tuned through.
//!
//! ## Features
//! - Guitar (6 strings, E2 to E4) and bass (4 strings, E1 to G2)
//! - Strings kept in tuning order, lowest pitch first
//! - Case-insensitive lookup by instrument id
//! - Cent deviation for the observation layer's readout
//!
//! The order of `strings()` drives the session's linear progression, so it
//! must stay low to high.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::TunerError;

/// A single string of an instrument and the frequency it is tuned to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentString {
    /// Note name (e.g., "E2", "A1")
    pub note: &'static str,
    /// Target frequency in Hz
    pub target: f32,
}

const GUITAR_STRINGS: [InstrumentString; 6] = [
    InstrumentString { note: "E2", target: 82.41 },
    InstrumentString { note: "A2", target: 110.0 },
    InstrumentString { note: "D3", target: 146.83 },
    InstrumentString { note: "G3", target: 196.0 },
    InstrumentString { note: "B3", target: 246.94 },
    InstrumentString { note: "E4", target: 329.63 },
];

const BASS_STRINGS: [InstrumentString; 4] = [
    InstrumentString { note: "E1", target: 41.20 },
    InstrumentString { note: "A1", target: 55.0 },
    InstrumentString { note: "D2", target: 73.42 },
    InstrumentString { note: "G2", target: 98.0 },
];

/// Instruments available for a tuning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Instrument {
    Guitar,
    Bass,
}

/// Static map for id to instrument lookups.
static INSTRUMENT_MAP: Lazy<BTreeMap<&'static str, Instrument>> = Lazy::new(|| {
    Instrument::ALL
        .iter()
        .map(|instrument| (instrument.id(), *instrument))
        .collect()
});

impl Instrument {
    /// Every instrument in the catalog.
    pub const ALL: [Instrument; 2] = [Instrument::Guitar, Instrument::Bass];

    /// Stable lowercase identifier, as accepted by [`Instrument::from_id`].
    pub fn id(&self) -> &'static str {
        match self {
            Instrument::Guitar => "guitar",
            Instrument::Bass => "bass",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Instrument::Guitar => "Guitar",
            Instrument::Bass => "Bass",
        }
    }

    /// Returns the strings in the order they should be tuned,
    /// from lowest to highest pitch.
    pub fn strings(&self) -> &'static [InstrumentString] {
        match self {
            Instrument::Guitar => &GUITAR_STRINGS,
            Instrument::Bass => &BASS_STRINGS,
        }
    }

    /// Looks up an instrument by its id, ignoring case and surrounding whitespace.
    ///
    /// # Arguments
    /// * `id` - Instrument id (e.g., "guitar", "Bass")
    ///
    /// # Returns
    /// * `Ok(instrument)` - The matching catalog entry
    /// * `Err(TunerError::UnknownInstrument)` - No instrument has that id
    pub fn from_id(id: &str) -> Result<Self, TunerError> {
        let key = id.trim().to_ascii_lowercase();
        INSTRUMENT_MAP
            .get(key.as_str())
            .copied()
            .ok_or_else(|| TunerError::UnknownInstrument(id.to_string()))
    }
}

impl FromStr for Instrument {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_id(s)
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Calculates the deviation from a target frequency in cents.
///
/// - 100 cents = 1 semitone
/// - Positive values indicate sharpness, negative values indicate flatness
///
/// # Returns
/// * `Some(cents)` - Deviation of `freq` from `target_freq`
/// * `None` - Either frequency is not a positive finite number
pub fn cents_deviation(freq: f32, target_freq: f32) -> Option<f32> {
    if !(freq.is_finite() && target_freq.is_finite() && freq > 0.0 && target_freq > 0.0) {
        return None;
    }
    Some(1200.0 * (freq / target_freq).log2())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strings_are_in_ascending_order() {
        for instrument in Instrument::ALL {
            let strings = instrument.strings();
            assert!(!strings.is_empty());
            assert!(
                strings.windows(2).all(|w| w[0].target < w[1].target),
                "{} strings are not ordered low to high",
                instrument
            );
        }
    }

    #[test]
    fn test_catalog_contents() {
        let guitar = Instrument::Guitar.strings();
        assert_eq!(guitar.len(), 6);
        assert_eq!(guitar[0].note, "E2");
        assert_eq!(guitar[0].target, 82.41);
        assert_eq!(guitar[5].note, "E4");

        let bass = Instrument::Bass.strings();
        assert_eq!(bass.len(), 4);
        assert_eq!(bass[0].note, "E1");
        assert_eq!(bass[3].target, 98.0);
    }

    #[test]
    fn test_lookup_by_id() {
        assert_eq!(Instrument::from_id("guitar").unwrap(), Instrument::Guitar);
        assert_eq!(" BASS ".parse::<Instrument>().unwrap(), Instrument::Bass);
        assert!(matches!(
            Instrument::from_id("ukulele"),
            Err(TunerError::UnknownInstrument(_))
        ));
    }

    #[test]
    fn test_cents_deviation() {
        let octave = cents_deviation(220.0, 110.0).unwrap();
        assert!((octave - 1200.0).abs() < 1e-3);
        let flat = cents_deviation(109.0, 110.0).unwrap();
        assert!(flat < 0.0 && flat > -20.0);
        assert_eq!(cents_deviation(0.0, 110.0), None);
        assert_eq!(cents_deviation(110.0, -1.0), None);
    }
}
