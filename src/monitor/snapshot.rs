use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::analytics::{Trend, WindowStats};
use crate::db::models::{Event, EventKind};

use super::state::{GlucoseStatus, LinkState};

/// Everything the outer surfaces need about one subject after a tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectSnapshot {
    pub subject: String,
    pub glucose_value: Option<f64>,
    pub trend: Option<Trend>,
    pub status: GlucoseStatus,
    pub link: LinkState,
    pub outage_minutes: Option<f64>,
    pub reading_age_minutes: Option<f64>,
    pub last_reading_at: Option<DateTime<Utc>>,
    /// `None` when history could not be loaded this tick.
    pub today: Option<WindowStats>,
    pub range: Option<WindowStats>,
    pub insulin_total_today: f64,
    pub feeding_total_today: f64,
    pub events_today: Vec<Event>,
    pub updated_at: DateTime<Utc>,
}

pub fn event_total(events: &[Event], kind: EventKind) -> f64 {
    events
        .iter()
        .filter(|event| event.kind == kind && !event.archived)
        .map(|event| event.amount)
        .sum()
}
