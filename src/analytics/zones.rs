use serde::{Deserialize, Serialize};

pub const ZONE_COUNT: usize = 6;

/// Ordered glucose buckets, lowest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    CriticalLow,
    VeryLow,
    Low,
    InRange,
    High,
    VeryHigh,
}

impl Zone {
    pub const ALL: [Zone; ZONE_COUNT] = [
        Zone::CriticalLow,
        Zone::VeryLow,
        Zone::Low,
        Zone::InRange,
        Zone::High,
        Zone::VeryHigh,
    ];

    pub fn index(self) -> usize {
        match self {
            Zone::CriticalLow => 0,
            Zone::VeryLow => 1,
            Zone::Low => 2,
            Zone::InRange => 3,
            Zone::High => 4,
            Zone::VeryHigh => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::CriticalLow => "critical_low",
            Zone::VeryLow => "very_low",
            Zone::Low => "low",
            Zone::InRange => "in_range",
            Zone::High => "high",
            Zone::VeryHigh => "very_high",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Zone::CriticalLow => "Critical low",
            Zone::VeryLow => "Very low",
            Zone::Low => "Low",
            Zone::InRange => "In range",
            Zone::High => "High",
            Zone::VeryHigh => "Very high",
        }
    }

    pub fn is_low_family(self) -> bool {
        matches!(self, Zone::CriticalLow | Zone::VeryLow | Zone::Low)
    }

    pub fn is_high_family(self) -> bool {
        matches!(self, Zone::High | Zone::VeryHigh)
    }
}

/// Clinical boundaries in mg/dL.
///
/// `very_low` is optional: without it the very-low zone is empty and
/// everything between `critical_low` and `low` lands in [`Zone::Low`].
/// Validation happens at the settings boundary (see
/// [`crate::settings::validate_thresholds`]); the classifier assumes the
/// boundaries are strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub critical_low: f64,
    pub very_low: Option<f64>,
    pub low: f64,
    pub high: f64,
    pub very_high: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            critical_low: 55.0,
            very_low: Some(100.0),
            low: 200.0,
            high: 300.0,
            very_high: 400.0,
        }
    }
}

impl Thresholds {
    pub fn classify(&self, value: f64) -> Zone {
        classify(value, self)
    }

    /// Value substituted for a "low" sentinel; always lands in the lowest zone.
    pub fn low_sentinel_value(&self) -> f64 {
        self.critical_low - 1.0
    }

    /// Value substituted for a "high" sentinel; always lands in the top zone.
    pub fn high_sentinel_value(&self) -> f64 {
        self.very_high + 1.0
    }

    /// Closed-open bounds of a zone, `None` meaning unbounded.
    pub fn bounds(&self, zone: Zone) -> (Option<f64>, Option<f64>) {
        let very_low = self.very_low.unwrap_or(self.critical_low);
        match zone {
            Zone::CriticalLow => (None, Some(self.critical_low)),
            Zone::VeryLow => (Some(self.critical_low), Some(very_low)),
            Zone::Low => (Some(very_low), Some(self.low)),
            Zone::InRange => (Some(self.low), Some(self.high)),
            Zone::High => (Some(self.high), Some(self.very_high)),
            Zone::VeryHigh => (Some(self.very_high), None),
        }
    }
}

/// Map a glucose value onto its zone.
///
/// Lower zones are closed at the bottom and open at the top, the in-range
/// zone is closed on both ends and the upper zones are open at the bottom:
///
/// ```text
/// v < critical_low              -> CriticalLow
/// critical_low <= v < very_low  -> VeryLow
/// very_low <= v < low           -> Low
/// low <= v <= high              -> InRange
/// high < v <= very_high         -> High
/// v > very_high                 -> VeryHigh
/// ```
///
/// NaN falls through every comparison and lands in the top zone; callers
/// normalise non-finite values to gaps before they get here.
pub fn classify(value: f64, thresholds: &Thresholds) -> Zone {
    if value < thresholds.critical_low {
        return Zone::CriticalLow;
    }
    if let Some(very_low) = thresholds.very_low {
        if value < very_low {
            return Zone::VeryLow;
        }
    }
    if value < thresholds.low {
        Zone::Low
    } else if value <= thresholds.high {
        Zone::InRange
    } else if value <= thresholds.very_high {
        Zone::High
    } else {
        Zone::VeryHigh
    }
}
