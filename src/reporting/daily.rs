//! Per-day aggregation from persisted history.
//!
//! The statistics come from stored history only, so a report for yesterday
//! comes out the same after a restart. The live status is attached by the
//! caller as [`CurrentStatus`].

use std::collections::BTreeMap;

use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;

use crate::analytics::{round1, AnalyticsConfig, ReadingEntry, Thresholds, Trend, WindowStats};
use crate::db::models::{Event, EventKind};

const EMERGENCY_CATEGORIES: [&str; 2] = ["emergency_single", "emergency_double"];
const INTERVENTION_CATEGORY: &str = "intervention";

fn local_midnight(date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// `[start, end)` of a local calendar day in UTC.
pub fn local_day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let next = date.succ_opt().unwrap_or(date);
    (local_midnight(date), local_midnight(next))
}

/// Unweighted summary of the numeric readings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValueSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
}

pub fn summarize_values(entries: &[ReadingEntry]) -> Option<ValueSummary> {
    let mut values: Vec<f64> = entries.iter().filter_map(|entry| entry.value).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));

    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let median = if count % 2 == 0 {
        (values[count / 2 - 1] + values[count / 2]) / 2.0
    } else {
        values[count / 2]
    };

    Some(ValueSummary {
        count,
        min: values[0],
        max: values[count - 1],
        mean: round1(mean),
        median: round1(median),
    })
}

/// Latest live reading of a subject when the report was built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentStatus {
    pub value: Option<f64>,
    pub trend: Option<Trend>,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStats {
    pub subject: String,
    pub date: NaiveDate,
    pub thresholds: Thresholds,
    /// `None` when no numeric reading was stored for the day.
    pub values: Option<ValueSummary>,
    pub gap_markers: usize,
    pub window: WindowStats,
    pub insulin_total: f64,
    pub feeding_total: f64,
    pub insulin_by_product: BTreeMap<String, f64>,
    pub feeding_by_category: BTreeMap<String, f64>,
    pub emergencies: usize,
    pub interventions: usize,
    pub event_count: usize,
    /// `None` until the subject has been polled at least once.
    pub current: Option<CurrentStatus>,
}

impl DailyStats {
    pub fn has_readings(&self) -> bool {
        self.values.is_some()
    }
}

pub fn compute_daily_stats(
    subject: &str,
    date: NaiveDate,
    thresholds: &Thresholds,
    entries: &[ReadingEntry],
    events: &[Event],
    config: &AnalyticsConfig,
) -> DailyStats {
    let (start, end) = local_day_bounds(date);
    let in_day: Vec<ReadingEntry> = entries
        .iter()
        .filter(|entry| entry.timestamp >= start && entry.timestamp < end)
        .copied()
        .collect();
    let active: Vec<&Event> = events
        .iter()
        .filter(|event| !event.archived && event.timestamp >= start && event.timestamp < end)
        .collect();

    let mut insulin_by_product = BTreeMap::new();
    let mut feeding_by_category = BTreeMap::new();
    for event in &active {
        let bucket = match event.kind {
            EventKind::Insulin => &mut insulin_by_product,
            EventKind::Feeding => &mut feeding_by_category,
        };
        *bucket.entry(event.detail().to_string()).or_insert(0.0) += event.amount;
    }

    let category_count = |wanted: &[&str]| {
        active
            .iter()
            .filter(|event| {
                event
                    .category
                    .as_deref()
                    .map_or(false, |category| wanted.contains(&category))
            })
            .count()
    };

    DailyStats {
        subject: subject.to_string(),
        date,
        thresholds: *thresholds,
        values: summarize_values(&in_day),
        gap_markers: in_day.iter().filter(|entry| entry.is_gap()).count(),
        window: WindowStats::compute(&in_day, thresholds, start, end, config),
        insulin_total: insulin_by_product.values().sum(),
        feeding_total: feeding_by_category.values().sum(),
        insulin_by_product,
        feeding_by_category,
        emergencies: category_count(&EMERGENCY_CATEGORIES),
        interventions: category_count(&[INTERVENTION_CATEGORY]),
        event_count: active.len(),
        current: None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyReport {
    pub date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub subjects: Vec<DailyStats>,
}

impl DailyReport {
    pub fn title(&self) -> String {
        format!("daily report - {}", self.date)
    }
}
