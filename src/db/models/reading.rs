//! Persisted glucose readings.
//!
//! A row with `value = NULL` is a gap marker: the sensor was unavailable at
//! that instant. Gaps are stored so historical windows weigh exactly like
//! live ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analytics::ReadingEntry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredReading {
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
    /// Source `last_updated` the reading was taken from, used to drop repeats.
    pub source_updated_at: Option<DateTime<Utc>>,
}

impl StoredReading {
    pub fn numeric(subject: &str, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            subject: subject.to_string(),
            timestamp,
            value: Some(value),
            source_updated_at: Some(timestamp),
        }
    }

    pub fn gap(subject: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            subject: subject.to_string(),
            timestamp,
            value: None,
            source_updated_at: None,
        }
    }

    pub fn entry(&self) -> ReadingEntry {
        ReadingEntry {
            timestamp: self.timestamp,
            value: self.value,
        }
    }
}
