use chrono::{DateTime, Utc};
use serde::Serialize;

use super::normalizer::ReadingEntry;

/// Sample-count completeness: how many readings arrived versus how many the
/// sampling interval implies. Used by historical reports; live coverage uses
/// the time-weighted model in [`super::weighting`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Completeness {
    pub actual: u32,
    pub expected: u32,
    pub missed: u32,
    pub missed_minutes: f64,
    pub pct: f64,
}

fn missed_in_gap(from: DateTime<Utc>, to: DateTime<Utc>, interval_minutes: f64) -> u32 {
    let gap_minutes = (to - from).num_milliseconds() as f64 / 60_000.0;
    let slots = (gap_minutes / interval_minutes).round() - 1.0;
    if slots > 0.0 {
        slots as u32
    } else {
        0
    }
}

/// Count missed samples between consecutive numeric readings.
///
/// Each gap contributes `max(0, round(gap / interval) - 1)` missed samples.
/// The window start acts as a virtual reading for the leading gap and the
/// tail gap runs to `window_end`. Gap markers are ignored: only numeric
/// readings count as received.
pub fn count_completeness(
    entries: &[ReadingEntry],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    interval_minutes: f64,
) -> Completeness {
    let mut timestamps: Vec<DateTime<Utc>> = entries
        .iter()
        .filter(|entry| !entry.is_gap())
        .filter(|entry| entry.timestamp >= window_start && entry.timestamp < window_end)
        .map(|entry| entry.timestamp)
        .collect();
    timestamps.sort();

    if interval_minutes <= 0.0 || window_end <= window_start {
        let actual = timestamps.len() as u32;
        return Completeness {
            actual,
            expected: actual,
            missed: 0,
            missed_minutes: 0.0,
            pct: if actual > 0 { 100.0 } else { 0.0 },
        };
    }

    let actual = timestamps.len() as u32;
    let mut missed = 0u32;
    let mut anchor = window_start;

    if timestamps.is_empty() {
        let window_minutes = (window_end - window_start).num_milliseconds() as f64 / 60_000.0;
        missed = (window_minutes / interval_minutes).round().max(0.0) as u32;
    } else {
        for timestamp in &timestamps {
            missed += missed_in_gap(anchor, *timestamp, interval_minutes);
            anchor = *timestamp;
        }
        missed += missed_in_gap(anchor, window_end, interval_minutes);
    }

    let expected = actual + missed;
    let pct = if actual == 0 || expected == 0 {
        0.0
    } else {
        actual as f64 / expected as f64 * 100.0
    };

    Completeness {
        actual,
        expected,
        missed,
        missed_minutes: missed as f64 * interval_minutes,
        pct,
    }
}
