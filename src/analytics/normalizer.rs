use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::zones::Thresholds;

const UNAVAILABLE_STATES: [&str; 4] = ["unavailable", "unknown", "none", ""];
const LOW_SENTINELS: [&str; 4] = ["low", "niedrig", "bas", "bajo"];
const HIGH_SENTINELS: [&str; 4] = ["high", "hoch", "haut", "alto"];

/// A raw state as reported by the glucose entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub timestamp: DateTime<Utc>,
    pub state: String,
}

/// One point of the normalised stream. `value == None` marks a gap: the
/// sensor had nothing trustworthy to say at that instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReadingEntry {
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
}

impl ReadingEntry {
    pub fn numeric(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            value: Some(value),
        }
    }

    pub fn gap(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            value: None,
        }
    }

    pub fn is_gap(&self) -> bool {
        self.value.is_none()
    }
}

/// Discrete CGM trend arrows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    RisingQuickly,
    Rising,
    RisingSlightly,
    Steady,
    FallingSlightly,
    Falling,
    FallingQuickly,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::RisingQuickly => "rising_quickly",
            Trend::Rising => "rising",
            Trend::RisingSlightly => "rising_slightly",
            Trend::Steady => "steady",
            Trend::FallingSlightly => "falling_slightly",
            Trend::Falling => "falling",
            Trend::FallingQuickly => "falling_quickly",
        }
    }
}

pub fn is_unavailable(state: &str) -> bool {
    let normalized = state.trim().to_ascii_lowercase();
    UNAVAILABLE_STATES.contains(&normalized.as_str())
}

/// Turn a raw entity state into a glucose value.
///
/// Sentinels are mapped just outside the extreme thresholds so they classify
/// into the lowest or highest zone. Anything unparseable, non-finite or
/// unavailable yields `None`, which downstream code treats as a gap.
pub fn normalize_state(state: &str, thresholds: &Thresholds) -> Option<f64> {
    let trimmed = state.trim();
    let lowered = trimmed.to_lowercase();

    if UNAVAILABLE_STATES.contains(&lowered.as_str()) {
        return None;
    }
    if LOW_SENTINELS.contains(&lowered.as_str()) {
        return Some(thresholds.low_sentinel_value());
    }
    if HIGH_SENTINELS.contains(&lowered.as_str()) {
        return Some(thresholds.high_sentinel_value());
    }

    // Some integrations report with a decimal comma.
    let numeric = trimmed.replace(',', ".");
    numeric.parse::<f64>().ok().filter(|value| value.is_finite())
}

/// Normalise a sequence of raw samples. Every sample produces exactly one
/// entry; gaps are kept in place because the weighting engine depends on
/// where they sit.
pub fn normalize(samples: &[RawSample], thresholds: &Thresholds) -> Vec<ReadingEntry> {
    samples
        .iter()
        .map(|sample| ReadingEntry {
            timestamp: sample.timestamp,
            value: normalize_state(&sample.state, thresholds),
        })
        .collect()
}

pub fn parse_trend(state: &str) -> Option<Trend> {
    let normalized = state.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    match normalized.as_str() {
        "rising_quickly" => Some(Trend::RisingQuickly),
        "rising" => Some(Trend::Rising),
        "rising_slightly" => Some(Trend::RisingSlightly),
        "steady" | "flat" => Some(Trend::Steady),
        "falling_slightly" => Some(Trend::FallingSlightly),
        "falling" => Some(Trend::Falling),
        "falling_quickly" => Some(Trend::FallingQuickly),
        _ => None,
    }
}
