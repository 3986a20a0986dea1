//! Per-subject alarm state machine.
//!
//! [`AlarmState::evaluate`] is pure: it turns one status observation into a
//! list of decisions and updates the "already notified" flags. Dispatching is
//! the caller's job, which keeps the rules testable without a notifier.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::analytics::{Trend, Zone};
use crate::notify::{Notification, Severity};
use crate::settings::AlarmPriorities;

use super::state::{GlucoseStatus, LinkState};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    CriticalLow,
    Low,
    High,
    NoData,
    FallingQuickly,
    RisingQuickly,
    Recovery,
}

impl AlarmKind {
    pub const ALL: [AlarmKind; 7] = [
        AlarmKind::CriticalLow,
        AlarmKind::Low,
        AlarmKind::High,
        AlarmKind::NoData,
        AlarmKind::FallingQuickly,
        AlarmKind::RisingQuickly,
        AlarmKind::Recovery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmKind::CriticalLow => "critical_low",
            AlarmKind::Low => "low",
            AlarmKind::High => "high",
            AlarmKind::NoData => "no_data",
            AlarmKind::FallingQuickly => "falling_quickly",
            AlarmKind::RisingQuickly => "rising_quickly",
            AlarmKind::Recovery => "recovery",
        }
    }

    pub fn default_priority(&self) -> AlarmPriority {
        match self {
            AlarmKind::CriticalLow => AlarmPriority::Critical,
            AlarmKind::Low | AlarmKind::High | AlarmKind::FallingQuickly => AlarmPriority::High,
            AlarmKind::NoData | AlarmKind::RisingQuickly | AlarmKind::Recovery => {
                AlarmPriority::Normal
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlarmPriority {
    Critical,
    High,
    Normal,
    Off,
}

impl AlarmPriority {
    /// `None` for `Off`: the alarm is tracked but never sent.
    pub fn severity(self) -> Option<Severity> {
        match self {
            AlarmPriority::Critical => Some(Severity::Critical),
            AlarmPriority::High => Some(Severity::High),
            AlarmPriority::Normal => Some(Severity::Default),
            AlarmPriority::Off => None,
        }
    }
}

/// What the engine saw on this tick.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmInput {
    pub status: GlucoseStatus,
    pub link: LinkState,
    pub trend: Option<Trend>,
    pub value: Option<f64>,
    pub reading_age_minutes: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlarmDecision {
    pub kind: AlarmKind,
    /// `None` when the kind is switched off; the flag is still set.
    pub severity: Option<Severity>,
    pub title: String,
    pub message: String,
}

impl AlarmDecision {
    pub fn into_notification(self, targets: &[String]) -> Option<Notification> {
        let severity = self.severity?;
        Some(Notification {
            title: self.title,
            message: self.message,
            severity,
            targets: targets.to_vec(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlarmState {
    notified: BTreeSet<AlarmKind>,
    high_since: Option<DateTime<Utc>>,
}

fn format_value(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{} mg/dL", crate::analytics::round1(value)),
        None => "unknown".to_string(),
    }
}

impl AlarmState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_notified(&self, kind: AlarmKind) -> bool {
        self.notified.contains(&kind)
    }

    pub fn high_since(&self) -> Option<DateTime<Utc>> {
        self.high_since
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn evaluate(
        &mut self,
        subject: &str,
        input: &AlarmInput,
        priorities: &AlarmPriorities,
        high_delay: Duration,
        now: DateTime<Utc>,
    ) -> Vec<AlarmDecision> {
        let mut decisions = Vec::new();
        let value = format_value(input.value);
        let mut fire = |kind: AlarmKind, severity: Option<Severity>, title: String, message: String| {
            decisions.push(AlarmDecision {
                kind,
                severity,
                title,
                message,
            });
        };
        let severity_of = |kind: AlarmKind| priorities.get(kind).severity();

        match input.status {
            GlucoseStatus::Zone(Zone::CriticalLow) => {
                if !self.is_notified(AlarmKind::CriticalLow) {
                    fire(
                        AlarmKind::CriticalLow,
                        severity_of(AlarmKind::CriticalLow),
                        format!("CRITICAL: {subject} glucose critically low"),
                        format!("{subject} glucose is {value}, critically low"),
                    );
                    self.notified.insert(AlarmKind::CriticalLow);
                    self.notified.insert(AlarmKind::Low);
                }
            }
            GlucoseStatus::Zone(Zone::VeryLow | Zone::Low) => {
                if !self.is_notified(AlarmKind::Low) {
                    fire(
                        AlarmKind::Low,
                        severity_of(AlarmKind::Low),
                        format!("Warning: {subject} glucose low"),
                        format!("{subject} glucose is {value}, below threshold"),
                    );
                    self.notified.insert(AlarmKind::Low);
                }
            }
            _ => {}
        }

        match input.status {
            GlucoseStatus::Zone(zone) if zone.is_high_family() => {
                let since = *self.high_since.get_or_insert(now);
                if !self.is_notified(AlarmKind::High) && now - since >= high_delay {
                    let priority = priorities.get(AlarmKind::High);
                    let severity = match (zone, priority) {
                        (_, AlarmPriority::Off) => None,
                        (Zone::VeryHigh, _) => Some(Severity::Critical),
                        _ => priority.severity(),
                    };
                    let label = zone.label().to_lowercase();
                    fire(
                        AlarmKind::High,
                        severity,
                        format!("Warning: {subject} glucose {label}"),
                        format!("{subject} glucose is {value}, {label}"),
                    );
                    self.notified.insert(AlarmKind::High);
                }
            }
            _ => self.high_since = None,
        }

        // A lost link and a stale reading are the same episode; only a fresh
        // value re-arms it.
        if input.status != GlucoseStatus::NoData {
            self.notified.remove(&AlarmKind::NoData);
        } else if !self.is_notified(AlarmKind::NoData) {
            let age = match input.reading_age_minutes {
                Some(age) => format!("{} min", age.round()),
                None => "an unknown duration".to_string(),
            };
            fire(
                AlarmKind::NoData,
                severity_of(AlarmKind::NoData),
                format!("Data gap: {subject}"),
                format!("No glucose reading from {subject} for {age}"),
            );
            self.notified.insert(AlarmKind::NoData);
        }

        for (kind, trend, text) in [
            (AlarmKind::FallingQuickly, Trend::FallingQuickly, "falling quickly"),
            (AlarmKind::RisingQuickly, Trend::RisingQuickly, "rising quickly"),
        ] {
            if input.trend == Some(trend) {
                if !self.is_notified(kind) {
                    fire(
                        kind,
                        severity_of(kind),
                        format!("{subject} glucose {text}"),
                        format!("{subject} glucose is {value} and {text}"),
                    );
                    self.notified.insert(kind);
                }
            } else {
                self.notified.remove(&kind);
            }
        }

        if input.status == GlucoseStatus::Zone(Zone::InRange) {
            if self.is_notified(AlarmKind::Low) || self.is_notified(AlarmKind::CriticalLow) {
                fire(
                    AlarmKind::Recovery,
                    severity_of(AlarmKind::Recovery),
                    format!("{subject} glucose back to normal"),
                    format!("{subject} glucose is {value}, back in range"),
                );
            }
            self.notified.remove(&AlarmKind::CriticalLow);
            self.notified.remove(&AlarmKind::Low);
            self.notified.remove(&AlarmKind::High);
            self.high_since = None;
        }

        decisions
    }
}
