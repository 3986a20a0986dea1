use chrono::{DateTime, Utc};
use serde::Serialize;

use super::completeness::{count_completeness, Completeness};
use super::config::AnalyticsConfig;
use super::normalizer::ReadingEntry;
use super::weighting::accumulate;
use super::zones::{Thresholds, Zone, ZONE_COUNT};
use super::round1;

/// Zone split and coverage for one window of a subject's stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStats {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub zone_pct: [f64; ZONE_COUNT],
    /// Time-weighted coverage, 0-100.
    pub coverage_pct: f64,
    pub covered_minutes: f64,
    /// Gap-count view of the same window.
    pub completeness: Completeness,
}

impl WindowStats {
    pub fn compute(
        entries: &[ReadingEntry],
        thresholds: &Thresholds,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        config: &AnalyticsConfig,
    ) -> Self {
        let acc = accumulate(entries, thresholds, start, end, config);
        let mut zone_pct = acc.zone_percentages();
        for pct in zone_pct.iter_mut() {
            *pct = round1(*pct);
        }

        Self {
            start,
            end,
            zone_pct,
            coverage_pct: round1(acc.coverage_pct()),
            covered_minutes: round1(acc.covered_minutes),
            completeness: count_completeness(
                entries,
                start,
                end,
                config.sampling_interval_minutes,
            ),
        }
    }

    pub fn zone(&self, zone: Zone) -> f64 {
        self.zone_pct[zone.index()]
    }
}
