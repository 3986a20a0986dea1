//! Values published per subject, one entry per sensor kind.

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::analytics::{round1, WindowStats, Zone};

use super::snapshot::SubjectSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SensorKind {
    GlucoseValue,
    GlucoseTrend,
    GlucoseStatus,
    LinkStatus,
    ReadingAge,
    ZonePct(Zone),
    CompletenessToday,
    CompletenessRange,
    DailyInsulinTotal,
    DailyBesTotal,
    TodayEvents,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorValue {
    pub key: String,
    pub state: Value,
    pub unit: Option<&'static str>,
    pub attributes: Map<String, Value>,
}

fn completeness_attributes(stats: Option<&WindowStats>) -> Map<String, Value> {
    let mut attributes = Map::new();
    if let Some(stats) = stats {
        attributes.insert("actual".into(), json!(stats.completeness.actual));
        attributes.insert("expected".into(), json!(stats.completeness.expected));
        attributes.insert("missed".into(), json!(stats.completeness.missed));
        attributes.insert(
            "missed_minutes".into(),
            json!(round1(stats.completeness.missed_minutes)),
        );
        attributes.insert(
            "count_pct".into(),
            json!(round1(stats.completeness.pct)),
        );
    }
    attributes
}

impl SensorKind {
    pub fn all() -> Vec<SensorKind> {
        let mut kinds = vec![
            SensorKind::GlucoseValue,
            SensorKind::GlucoseTrend,
            SensorKind::GlucoseStatus,
            SensorKind::LinkStatus,
            SensorKind::ReadingAge,
        ];
        kinds.extend(Zone::ALL.iter().map(|zone| SensorKind::ZonePct(*zone)));
        kinds.extend([
            SensorKind::CompletenessToday,
            SensorKind::CompletenessRange,
            SensorKind::DailyInsulinTotal,
            SensorKind::DailyBesTotal,
            SensorKind::TodayEvents,
        ]);
        kinds
    }

    pub fn key(&self) -> String {
        match self {
            SensorKind::GlucoseValue => "glucose_value".into(),
            SensorKind::GlucoseTrend => "glucose_trend".into(),
            SensorKind::GlucoseStatus => "glucose_status".into(),
            SensorKind::LinkStatus => "link_status".into(),
            SensorKind::ReadingAge => "reading_age".into(),
            SensorKind::ZonePct(zone) => format!("time_{}_pct", zone.as_str()),
            SensorKind::CompletenessToday => "data_completeness_today".into(),
            SensorKind::CompletenessRange => "data_completeness_range".into(),
            SensorKind::DailyInsulinTotal => "daily_insulin_total".into(),
            SensorKind::DailyBesTotal => "daily_bes_total".into(),
            SensorKind::TodayEvents => "today_events".into(),
        }
    }

    pub fn unit(&self) -> Option<&'static str> {
        match self {
            SensorKind::GlucoseValue => Some("mg/dL"),
            SensorKind::ReadingAge => Some("min"),
            SensorKind::ZonePct(_)
            | SensorKind::CompletenessToday
            | SensorKind::CompletenessRange => Some("%"),
            SensorKind::DailyInsulinTotal => Some("IU"),
            SensorKind::DailyBesTotal => Some("BE"),
            _ => None,
        }
    }

    pub fn extract(&self, snapshot: &SubjectSnapshot) -> SensorValue {
        let mut attributes = Map::new();
        let state = match self {
            SensorKind::GlucoseValue => json!(snapshot.glucose_value.map(round1)),
            SensorKind::GlucoseTrend => json!(snapshot.trend.map(|t| t.as_str())),
            SensorKind::GlucoseStatus => json!(snapshot.status.as_str()),
            SensorKind::LinkStatus => {
                if let Some(outage) = snapshot.outage_minutes {
                    attributes.insert("outage_minutes".into(), json!(round1(outage)));
                }
                json!(snapshot.link)
            }
            SensorKind::ReadingAge => json!(snapshot.reading_age_minutes.map(round1)),
            SensorKind::ZonePct(zone) => json!(snapshot.today.as_ref().map(|s| s.zone(*zone))),
            SensorKind::CompletenessToday => {
                attributes = completeness_attributes(snapshot.today.as_ref());
                json!(snapshot.today.as_ref().map(|s| s.coverage_pct))
            }
            SensorKind::CompletenessRange => {
                attributes = completeness_attributes(snapshot.range.as_ref());
                json!(snapshot.range.as_ref().map(|s| s.coverage_pct))
            }
            SensorKind::DailyInsulinTotal => json!(round1(snapshot.insulin_total_today)),
            SensorKind::DailyBesTotal => json!(round1(snapshot.feeding_total_today)),
            SensorKind::TodayEvents => {
                attributes.insert("events".into(), json!(snapshot.events_today));
                json!(snapshot.events_today.len())
            }
        };

        SensorValue {
            key: self.key(),
            state,
            unit: self.unit(),
            attributes,
        }
    }
}

/// Every published value for one subject.
pub fn extract_all(snapshot: &SubjectSnapshot) -> Vec<SensorValue> {
    SensorKind::all()
        .iter()
        .map(|kind| kind.extract(snapshot))
        .collect()
}
