//! Watering duration from yesterday's transpiration index.
//!
//! The Makkink index ranges from about 4 on a very wet day to about 57 on a
//! hot, dry, sunny one. Every 2 points above the long-run average adds a
//! minute to the baseline; every 2 points below removes one.

use serde::Serialize;

use crate::weather::{WeatherMetric, WeatherReading};

/// Watering time when no usable weather signal exists.
pub const BASELINE_MINUTES: i64 = 10;

/// Long-run average transpiration index.
pub const AVERAGE_TRANSPIRATION: i64 = 27;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Transpiration,
    Fallback,
}

/// Minutes to water (zero or less means skip) plus the reasoning behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WateringDecision {
    pub minutes: i64,
    pub source: DecisionSource,
    pub explanation: String,
}

impl WateringDecision {
    pub fn should_water(&self) -> bool {
        self.minutes > 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DurationPolicy;

impl DurationPolicy {
    pub fn decide(&self, reading: Option<&WeatherReading>) -> WateringDecision {
        let Some(reading) = reading else {
            return fallback("No weather data available");
        };
        let Some(transpiration) = reading.get(WeatherMetric::Transpiration) else {
            return fallback("No transpiration index in weather data");
        };

        // Truncating division: -23 / 2 == -11.
        let Some((adjustment, minutes)) = transpiration
            .checked_sub(AVERAGE_TRANSPIRATION)
            .map(|delta| delta / 2)
            .and_then(|adj| BASELINE_MINUTES.checked_add(adj).map(|m| (adj, m)))
        else {
            return fallback(&format!(
                "Transpiration index {transpiration} is out of range"
            ));
        };

        WateringDecision {
            minutes,
            source: DecisionSource::Transpiration,
            explanation: format!(
                "Transpiration index (Makkink) = {transpiration}. Will add/deduct {adjustment} \
                 from the default {BASELINE_MINUTES} number of watering minutes. \
                 Resulting in watering the plants for {minutes} minutes."
            ),
        }
    }
}

fn fallback(reason: &str) -> WateringDecision {
    WateringDecision {
        minutes: BASELINE_MINUTES,
        source: DecisionSource::Fallback,
        explanation: format!(
            "{reason}: watering for the default of {BASELINE_MINUTES} minutes."
        ),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
