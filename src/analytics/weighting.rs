use chrono::{DateTime, Utc};
use serde::Serialize;

use super::config::AnalyticsConfig;
use super::normalizer::ReadingEntry;
use super::zones::{Thresholds, Zone, ZONE_COUNT};

/// Time attribution for one query window. Derived on demand, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CoverageAccumulator {
    pub covered_minutes: f64,
    pub total_minutes: f64,
    pub zone_minutes: [f64; ZONE_COUNT],
}

impl CoverageAccumulator {
    pub fn empty(total_minutes: f64) -> Self {
        Self {
            covered_minutes: 0.0,
            total_minutes,
            zone_minutes: [0.0; ZONE_COUNT],
        }
    }

    pub fn uncovered_minutes(&self) -> f64 {
        (self.total_minutes - self.covered_minutes).max(0.0)
    }

    /// Covered share of the window, 0-100.
    pub fn coverage_pct(&self) -> f64 {
        if self.total_minutes <= 0.0 {
            return 0.0;
        }
        (self.covered_minutes / self.total_minutes * 100.0).min(100.0)
    }

    /// Per-zone share of the covered time, 0-100. All zeros when nothing is
    /// covered.
    pub fn zone_percentages(&self) -> [f64; ZONE_COUNT] {
        let mut result = [0.0; ZONE_COUNT];
        if self.covered_minutes <= 0.0 {
            return result;
        }
        for (slot, minutes) in result.iter_mut().zip(self.zone_minutes.iter()) {
            *slot = minutes / self.covered_minutes * 100.0;
        }
        result
    }

    pub fn zone_pct(&self, zone: Zone) -> f64 {
        self.zone_percentages()[zone.index()]
    }
}

fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / 60_000.0).max(0.0)
}

/// Entries inside `[window_start, window_end)`, in timestamp order.
fn window_entries(
    entries: &[ReadingEntry],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Vec<ReadingEntry> {
    let mut in_window: Vec<ReadingEntry> = entries
        .iter()
        .filter(|entry| entry.timestamp >= window_start && entry.timestamp < window_end)
        .copied()
        .collect();
    // Source order is normally sorted already; the stable sort keeps a gap
    // recorded at the same instant as a reading after it.
    in_window.sort_by_key(|entry| entry.timestamp);
    in_window
}

/// Weight of every numeric entry in the window, paired with its value.
///
/// A reading counts until the next entry, or until `window_end` if it is the
/// last one. When the next entry is a gap marker the weight is capped at
/// `gap_cap_minutes`. Gap entries carry no weight.
pub fn weigh_entries(
    entries: &[ReadingEntry],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    config: &AnalyticsConfig,
) -> Vec<(f64, f64)> {
    let in_window = window_entries(entries, window_start, window_end);

    let mut weighted = Vec::with_capacity(in_window.len());
    for (index, entry) in in_window.iter().enumerate() {
        let Some(value) = entry.value else {
            continue;
        };

        let minutes = match in_window.get(index + 1) {
            Some(next) if next.is_gap() => {
                minutes_between(entry.timestamp, next.timestamp).min(config.gap_cap_minutes)
            }
            Some(next) => minutes_between(entry.timestamp, next.timestamp),
            None => minutes_between(entry.timestamp, window_end),
        };

        weighted.push((value, minutes));
    }
    weighted
}

/// Attribute window time to zones and coverage in one pass.
pub fn accumulate(
    entries: &[ReadingEntry],
    thresholds: &Thresholds,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    config: &AnalyticsConfig,
) -> CoverageAccumulator {
    let mut acc = CoverageAccumulator::empty(minutes_between(window_start, window_end));

    for (value, minutes) in weigh_entries(entries, window_start, window_end, config) {
        let zone = thresholds.classify(value);
        acc.zone_minutes[zone.index()] += minutes;
        acc.covered_minutes += minutes;
    }

    acc
}

/// Per-zone percentage of weighted time, indexed by [`Zone::index`].
pub fn compute_zone_stats(
    entries: &[ReadingEntry],
    thresholds: &Thresholds,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> [f64; ZONE_COUNT] {
    accumulate(
        entries,
        thresholds,
        window_start,
        window_end,
        &AnalyticsConfig::default(),
    )
    .zone_percentages()
}

/// `(covered_minutes, total_minutes)` for the window.
pub fn compute_coverage(
    entries: &[ReadingEntry],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> (f64, f64) {
    let config = AnalyticsConfig::default();
    let covered = weigh_entries(entries, window_start, window_end, &config)
        .iter()
        .map(|(_, minutes)| minutes)
        .sum();
    (covered, minutes_between(window_start, window_end))
}
