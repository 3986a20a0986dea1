use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
};
use thiserror::Error;

use crate::analytics::Thresholds;
use crate::db::models::EventKind;
use crate::monitor::alarms::{AlarmKind, AlarmPriority};

/// Reasons a configuration is rejected before it reaches the engine.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("threshold {name} must be a finite number")]
    NonFiniteThreshold { name: &'static str },
    #[error("thresholds must be strictly increasing: {lower} ({lower_value}) >= {upper} ({upper_value})")]
    ThresholdOrder {
        lower: &'static str,
        lower_value: f64,
        upper: &'static str,
        upper_value: f64,
    },
    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },
    #[error("subject name must not be empty")]
    EmptySubjectName,
    #[error("subject {0} is configured more than once")]
    DuplicateSubject(String),
    #[error("subject {subject} has an invalid weight")]
    InvalidWeight { subject: String },
    #[error("preset {0} is configured more than once")]
    DuplicatePreset(String),
    #[error("preset {preset} has an invalid amount")]
    InvalidPresetAmount { preset: String },
    #[error("preset {preset} refers to unknown {what} {value:?}")]
    UnknownCatalogEntry {
        preset: String,
        what: &'static str,
        value: String,
    },
}

pub fn validate_thresholds(thresholds: &Thresholds) -> Result<(), ConfigError> {
    let mut ordered: Vec<(&'static str, f64)> = vec![("critical_low", thresholds.critical_low)];
    if let Some(very_low) = thresholds.very_low {
        ordered.push(("very_low", very_low));
    }
    ordered.push(("low", thresholds.low));
    ordered.push(("high", thresholds.high));
    ordered.push(("very_high", thresholds.very_high));

    for (name, value) in &ordered {
        if !value.is_finite() {
            return Err(ConfigError::NonFiniteThreshold { name });
        }
    }

    for pair in ordered.windows(2) {
        let (lower, lower_value) = pair[0];
        let (upper, upper_value) = pair[1];
        if lower_value >= upper_value {
            return Err(ConfigError::ThresholdOrder {
                lower,
                lower_value,
                upper,
                upper_value,
            });
        }
    }

    Ok(())
}

/// Priority per alarm kind. Kinds without an entry use
/// [`AlarmKind::default_priority`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct AlarmPriorities(BTreeMap<AlarmKind, AlarmPriority>);

impl AlarmPriorities {
    pub fn get(&self, kind: AlarmKind) -> AlarmPriority {
        self.0
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_priority())
    }

    pub fn set(&mut self, kind: AlarmKind, priority: AlarmPriority) {
        self.0.insert(kind, priority);
    }

    /// `overrides` win over `self`.
    pub fn merged_with(&self, overrides: &AlarmPriorities) -> AlarmPriorities {
        let mut merged = self.0.clone();
        merged.extend(overrides.0.iter().map(|(kind, priority)| (*kind, *priority)));
        AlarmPriorities(merged)
    }
}

fn default_data_timeout() -> u32 {
    20
}

fn default_high_delay() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubjectConfig {
    pub name: String,
    pub glucose_sensor: String,
    pub trend_sensor: String,
    #[serde(default)]
    pub weight_kg: Option<f64>,
    #[serde(default)]
    pub thresholds: Thresholds,
    /// A reading whose last poll is older than this is treated as absent.
    #[serde(default = "default_data_timeout")]
    pub data_timeout_minutes: u32,
    /// How long glucose must stay high before the high alarm fires.
    #[serde(default = "default_high_delay")]
    pub high_alarm_delay_minutes: u32,
    /// Per-subject overrides on top of the global alarm priorities.
    #[serde(default)]
    pub alarm_priorities: AlarmPriorities,
}

impl SubjectConfig {
    pub fn new(name: &str, glucose_sensor: &str, trend_sensor: &str) -> Self {
        Self {
            name: name.to_string(),
            glucose_sensor: glucose_sensor.to_string(),
            trend_sensor: trend_sensor.to_string(),
            weight_kg: None,
            thresholds: Thresholds::default(),
            data_timeout_minutes: default_data_timeout(),
            high_alarm_delay_minutes: default_high_delay(),
            alarm_priorities: AlarmPriorities::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlarmSettings {
    pub priorities: AlarmPriorities,
    /// Notification endpoints handed to the notifier.
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InsulinCategory {
    Short,
    Long,
    Experimental,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InsulinProduct {
    pub name: String,
    pub category: InsulinCategory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Catalog {
    pub insulin_products: Vec<InsulinProduct>,
    pub feeding_categories: Vec<String>,
}

impl Default for Catalog {
    fn default() -> Self {
        let product = |name: &str, category| InsulinProduct {
            name: name.into(),
            category,
        };
        Self {
            insulin_products: vec![
                product("NovoRapid", InsulinCategory::Short),
                product("Lantus", InsulinCategory::Long),
                product("Experimental-1", InsulinCategory::Experimental),
            ],
            feeding_categories: [
                "breakfast",
                "dinner",
                "reward",
                "emergency_single",
                "emergency_double",
                "intervention",
                "other",
            ]
            .iter()
            .map(|name| name.to_string())
            .collect(),
        }
    }
}

/// A one-tap event template. With `per_kg` set the amount is multiplied by
/// the subject's weight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Preset {
    pub name: String,
    pub kind: EventKind,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub amount: f64,
    #[serde(default)]
    pub per_kg: bool,
}

impl Preset {
    pub fn resolve_amount(&self, weight_kg: Option<f64>) -> Result<f64> {
        if !self.per_kg {
            return Ok(self.amount);
        }
        let weight = weight_kg
            .with_context(|| format!("preset {} scales by weight but no weight is set", self.name))?;
        Ok(self.amount * weight)
    }
}

fn default_poll_interval() -> u64 {
    60
}

fn default_report_time() -> NaiveTime {
    NaiveTime::from_hms_opt(0, 5, 0).unwrap_or(NaiveTime::MIN)
}

fn default_stats_range() -> u32 {
    24
}

fn default_flush_every() -> usize {
    10
}

fn default_database_path() -> PathBuf {
    PathBuf::from("glucowatch.sqlite3")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorSettings {
    #[serde(default)]
    pub subjects: Vec<SubjectConfig>,
    #[serde(default)]
    pub alarms: AlarmSettings,
    #[serde(default)]
    pub catalog: Catalog,
    #[serde(default)]
    pub presets: Vec<Preset>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Local wall-clock time the previous day's report goes out.
    #[serde(default = "default_report_time")]
    pub daily_report_time: NaiveTime,
    /// Look-back for the "range" completeness figure.
    #[serde(default = "default_stats_range")]
    pub stats_range_hours: u32,
    /// Buffered readings are written once this many are pending.
    #[serde(default = "default_flush_every")]
    pub reading_flush_every: usize,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            subjects: Vec::new(),
            alarms: AlarmSettings::default(),
            catalog: Catalog::default(),
            presets: Vec::new(),
            poll_interval_secs: default_poll_interval(),
            daily_report_time: default_report_time(),
            stats_range_hours: default_stats_range(),
            reading_flush_every: default_flush_every(),
            database_path: default_database_path(),
        }
    }
}

impl MonitorSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::NonPositive {
                field: "poll_interval_secs",
            });
        }
        if self.stats_range_hours == 0 {
            return Err(ConfigError::NonPositive {
                field: "stats_range_hours",
            });
        }
        if self.reading_flush_every == 0 {
            return Err(ConfigError::NonPositive {
                field: "reading_flush_every",
            });
        }

        let mut seen = HashSet::new();
        for subject in &self.subjects {
            let name = subject.name.trim();
            if name.is_empty() {
                return Err(ConfigError::EmptySubjectName);
            }
            if !seen.insert(name.to_string()) {
                return Err(ConfigError::DuplicateSubject(name.to_string()));
            }
            validate_thresholds(&subject.thresholds)?;
            if subject.data_timeout_minutes == 0 {
                return Err(ConfigError::NonPositive {
                    field: "data_timeout_minutes",
                });
            }
            if let Some(weight) = subject.weight_kg {
                if !weight.is_finite() || weight <= 0.0 {
                    return Err(ConfigError::InvalidWeight {
                        subject: name.to_string(),
                    });
                }
            }
        }

        let mut preset_names = HashSet::new();
        for preset in &self.presets {
            if !preset_names.insert(preset.name.as_str()) {
                return Err(ConfigError::DuplicatePreset(preset.name.clone()));
            }
            if !preset.amount.is_finite() || preset.amount < 0.0 {
                return Err(ConfigError::InvalidPresetAmount {
                    preset: preset.name.clone(),
                });
            }
            match preset.kind {
                EventKind::Insulin => {
                    let product = preset.product.clone().unwrap_or_default();
                    let known = self
                        .catalog
                        .insulin_products
                        .iter()
                        .any(|p| p.name == product);
                    if !known {
                        return Err(ConfigError::UnknownCatalogEntry {
                            preset: preset.name.clone(),
                            what: "insulin product",
                            value: product,
                        });
                    }
                }
                EventKind::Feeding => {
                    let category = preset.category.clone().unwrap_or_default();
                    if !self.catalog.feeding_categories.contains(&category) {
                        return Err(ConfigError::UnknownCatalogEntry {
                            preset: preset.name.clone(),
                            what: "feeding category",
                            value: category,
                        });
                    }
                }
            }
        }

        Ok(())
    }

    pub fn subject(&self, name: &str) -> Option<&SubjectConfig> {
        self.subjects.iter().find(|s| s.name == name)
    }

    pub fn preset(&self, name: &str) -> Option<&Preset> {
        self.presets.iter().find(|p| p.name == name)
    }

    /// Effective alarm priorities for a subject.
    pub fn priorities_for(&self, subject: &SubjectConfig) -> AlarmPriorities {
        self.alarms.priorities.merged_with(&subject.alarm_priorities)
    }
}

/// Validated settings, optionally backed by a JSON file.
///
/// Readers take an `Arc` snapshot; updates validate first, then persist, then
/// swap, so a rejected update never becomes visible.
pub struct SettingsStore {
    path: Option<PathBuf>,
    data: RwLock<Arc<MonitorSettings>>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str::<MonitorSettings>(&contents)
                .with_context(|| format!("Failed to parse settings in {}", path.display()))?
        } else {
            MonitorSettings::default()
        };
        data.validate()
            .with_context(|| format!("Invalid settings in {}", path.display()))?;

        Ok(Self {
            path: Some(path),
            data: RwLock::new(Arc::new(data)),
        })
    }

    /// Settings that live only in memory, for embedding and tests.
    pub fn in_memory(settings: MonitorSettings) -> Result<Self> {
        settings.validate().context("Invalid settings")?;
        Ok(Self {
            path: None,
            data: RwLock::new(Arc::new(settings)),
        })
    }

    pub fn current(&self) -> Arc<MonitorSettings> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update(&self, settings: MonitorSettings) -> Result<Arc<MonitorSettings>> {
        settings.validate().context("Rejected settings update")?;
        self.persist(&settings)?;
        let settings = Arc::new(settings);
        *self.data.write().unwrap_or_else(PoisonError::into_inner) = settings.clone();
        Ok(settings)
    }

    /// Apply `change` to a copy of the current settings and store the result.
    pub fn modify<F>(&self, change: F) -> Result<Arc<MonitorSettings>>
    where
        F: FnOnce(&mut MonitorSettings),
    {
        let mut next = (*self.current()).clone();
        change(&mut next);
        self.update(next)
    }

    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let contents = fs::read_to_string(path)?;
        let data: MonitorSettings = serde_json::from_str(&contents)?;
        data.validate().context("Invalid settings on reload")?;
        *self.data.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(data);
        Ok(())
    }

    fn persist(&self, data: &MonitorSettings) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(path, serialized)
            .with_context(|| format!("Failed to write settings to {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn settings_with_subject() -> MonitorSettings {
        MonitorSettings {
            subjects: vec![SubjectConfig::new(
                "Bella",
                "sensor.bella_glucose",
                "sensor.bella_trend",
            )],
            ..MonitorSettings::default()
        }
    }

    #[test]
    fn default_thresholds_are_valid() {
        assert_eq!(validate_thresholds(&Thresholds::default()), Ok(()));
    }

    #[test]
    fn non_increasing_thresholds_are_rejected() {
        let thresholds = Thresholds {
            low: 310.0,
            ..Thresholds::default()
        };
        assert!(matches!(
            validate_thresholds(&thresholds),
            Err(ConfigError::ThresholdOrder { lower: "low", upper: "high", .. })
        ));
    }

    #[test]
    fn nan_threshold_is_rejected() {
        let thresholds = Thresholds {
            high: f64::NAN,
            ..Thresholds::default()
        };
        assert_eq!(
            validate_thresholds(&thresholds),
            Err(ConfigError::NonFiniteThreshold { name: "high" })
        );
    }

    #[test]
    fn duplicate_subjects_are_rejected() {
        let mut settings = settings_with_subject();
        settings.subjects.push(settings.subjects[0].clone());
        assert_eq!(
            settings.validate(),
            Err(ConfigError::DuplicateSubject("Bella".into()))
        );
    }

    #[test]
    fn preset_must_reference_catalog() {
        let mut settings = settings_with_subject();
        settings.presets.push(Preset {
            name: "Morning".into(),
            kind: EventKind::Insulin,
            product: Some("Unknown".into()),
            category: None,
            amount: 2.0,
            per_kg: false,
        });
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::UnknownCatalogEntry { .. })
        ));
    }

    #[test]
    fn per_kg_preset_scales_by_weight() {
        let preset = Preset {
            name: "Lantus basal".into(),
            kind: EventKind::Insulin,
            product: Some("Lantus".into()),
            category: None,
            amount: 0.5,
            per_kg: true,
        };
        assert_eq!(preset.resolve_amount(Some(40.0)).unwrap(), 20.0);
        assert!(preset.resolve_amount(None).is_err());
    }

    #[test]
    fn subject_overrides_win_over_global_priorities() {
        let mut settings = settings_with_subject();
        settings
            .alarms
            .priorities
            .set(AlarmKind::NoData, AlarmPriority::High);
        settings.subjects[0]
            .alarm_priorities
            .set(AlarmKind::NoData, AlarmPriority::Off);

        let merged = settings.priorities_for(&settings.subjects[0]);
        assert_eq!(merged.get(AlarmKind::NoData), AlarmPriority::Off);
        assert_eq!(
            merged.get(AlarmKind::CriticalLow),
            AlarmKind::CriticalLow.default_priority()
        );
    }

    #[test]
    fn store_round_trips_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::new(path.clone()).unwrap();
        assert!(store.current().subjects.is_empty());

        store.update(settings_with_subject()).unwrap();

        let reopened = SettingsStore::new(path).unwrap();
        assert_eq!(reopened.current().subjects[0].name, "Bella");
    }

    #[test]
    fn rejected_update_keeps_previous_settings() {
        let store = SettingsStore::in_memory(settings_with_subject()).unwrap();
        let result = store.modify(|s| s.subjects[0].thresholds.critical_low = 500.0);
        assert!(result.is_err());
        assert_eq!(store.current().subjects[0].thresholds.critical_low, 55.0);
    }
}
