//! Insulin and feeding events.
//!
//! Events are never removed. Archiving flips `archived` and hides the event
//! from every query and total.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Insulin,
    Feeding,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Insulin => "insulin",
            EventKind::Feeding => "feeding",
        }
    }

    /// Unit the amount is expressed in.
    pub fn unit(&self) -> &'static str {
        match self {
            EventKind::Insulin => "IU",
            EventKind::Feeding => "BE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub subject: String,
    pub kind: EventKind,
    pub amount: f64,
    pub product: Option<String>,
    pub category: Option<String>,
    pub note: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub archived: bool,
}

impl Event {
    /// Product for insulin, category for feeding.
    pub fn detail(&self) -> &str {
        self.product
            .as_deref()
            .or(self.category.as_deref())
            .unwrap_or("")
    }
}

/// Input for logging a new event. A missing timestamp means "now".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    pub subject: String,
    pub kind: EventKind,
    pub amount: f64,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}
