//! Insulin and feeding journal operations.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Local, Utc};

use crate::db::models::{Event, EventKind, NewEvent};
use crate::reporting::local_day_bounds;

use super::controller::Monitor;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

impl Monitor {
    /// Validate against the current catalog, store the event and refresh its
    /// subject. Returns the stored event.
    pub async fn log_event(&self, event: NewEvent) -> Result<Event> {
        let settings = self.settings();
        if settings.subject(&event.subject).is_none() {
            bail!("unknown subject {}", event.subject);
        }

        match event.kind {
            EventKind::Insulin => {
                let product = event
                    .product
                    .as_deref()
                    .context("insulin events need a product")?;
                if !settings
                    .catalog
                    .insulin_products
                    .iter()
                    .any(|p| p.name == product)
                {
                    bail!("unknown insulin product {product}");
                }
            }
            EventKind::Feeding => {
                if let Some(category) = event.category.as_deref() {
                    if !settings.catalog.feeding_categories.iter().any(|c| c == category) {
                        bail!("unknown feeding category {category}");
                    }
                }
            }
        }

        let subject = event.subject.clone();
        let stored = self
            .context()
            .db
            .insert_event(event, Utc::now())
            .await
            .with_context(|| format!("failed to store event for {subject}"))?;
        log_info!(
            "Logged {} {} {} for {} ({})",
            stored.kind.as_str(),
            stored.amount,
            stored.kind.unit(),
            stored.subject,
            stored.id
        );

        if let Err(err) = self.refresh_subject(&subject).await {
            log_warn!("Refresh after logging {} failed: {err:#}", stored.id);
        }
        Ok(stored)
    }

    pub async fn log_insulin(
        &self,
        subject: &str,
        product: &str,
        amount: f64,
        timestamp: Option<DateTime<Utc>>,
        note: Option<String>,
    ) -> Result<String> {
        let event = self
            .log_event(NewEvent {
                subject: subject.to_string(),
                kind: EventKind::Insulin,
                amount,
                product: Some(product.to_string()),
                category: None,
                note,
                timestamp,
            })
            .await?;
        Ok(event.id)
    }

    pub async fn log_feeding(
        &self,
        subject: &str,
        amount: f64,
        category: &str,
        description: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let event = self
            .log_event(NewEvent {
                subject: subject.to_string(),
                kind: EventKind::Feeding,
                amount,
                product: None,
                category: Some(category.to_string()),
                note: description,
                timestamp,
            })
            .await?;
        Ok(event.id)
    }

    /// Log a configured preset. Per-kg presets are scaled by the subject's
    /// weight.
    pub async fn log_preset(
        &self,
        subject: &str,
        preset_name: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let settings = self.settings();
        let preset = settings
            .preset(preset_name)
            .with_context(|| format!("unknown preset {preset_name}"))?;
        let config = settings
            .subject(subject)
            .with_context(|| format!("unknown subject {subject}"))?;
        let amount = preset.resolve_amount(config.weight_kg)?;

        let event = self
            .log_event(NewEvent {
                subject: subject.to_string(),
                kind: preset.kind,
                amount,
                product: preset.product.clone(),
                category: preset.category.clone(),
                note: Some(format!("preset {}", preset.name)),
                timestamp,
            })
            .await?;
        Ok(event.id)
    }

    /// Button flow: stamp the event `minutes_ago` before now.
    pub async fn log_relative(&self, mut event: NewEvent, minutes_ago: u32) -> Result<String> {
        event.timestamp = Some(Utc::now() - Duration::minutes(i64::from(minutes_ago)));
        Ok(self.log_event(event).await?.id)
    }

    /// Hide an event. Every subject is refreshed so totals drop it at once.
    pub async fn archive_event(&self, event_id: &str) -> Result<bool> {
        let archived = self.context().db.archive_event(event_id).await?;
        if archived {
            log_info!("Archived event {event_id}");
            self.refresh_all().await;
        }
        Ok(archived)
    }

    pub async fn events_between(
        &self,
        subject: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        kind: Option<EventKind>,
    ) -> Result<Vec<Event>> {
        self.context().db.get_events(subject, start, end, kind).await
    }

    pub async fn today_events(&self, subject: &str) -> Result<Vec<Event>> {
        self.coordinator(subject)?;
        let (start, end) = local_day_bounds(Local::now().date_naive());
        self.events_between(Some(subject), start, end, None).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::Database;
    use crate::monitor::controller::MonitorContext;
    use crate::notify::{Dispatcher, NoticeBoard, RecordingNotifier};
    use crate::settings::{MonitorSettings, Preset, SettingsStore, SubjectConfig};
    use crate::sources::StateRegistry;
    use tempfile::TempDir;

    fn monitor(dir: &TempDir) -> Arc<Monitor> {
        let mut subject = SubjectConfig::new("Bella", "sensor.bella_glucose", "sensor.bella_trend");
        subject.weight_kg = Some(4.0);
        let settings = MonitorSettings {
            subjects: vec![subject],
            presets: vec![Preset {
                name: "evening dose".into(),
                kind: EventKind::Insulin,
                product: Some("Lantus".into()),
                category: None,
                amount: 0.5,
                per_kg: true,
            }],
            ..MonitorSettings::default()
        };
        let store = Arc::new(SettingsStore::in_memory(settings).unwrap());
        let db = Database::new(dir.path().join("journal.sqlite3")).unwrap();
        let dispatcher = Dispatcher::new(
            Arc::new(RecordingNotifier::new()),
            Arc::new(NoticeBoard::new()),
        );
        let ctx = MonitorContext::new(store, db, Arc::new(StateRegistry::new()), dispatcher);
        Monitor::new(Arc::new(ctx))
    }

    #[tokio::test]
    async fn logged_insulin_shows_up_in_today_totals() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(&dir);

        let id = monitor
            .log_insulin("Bella", "NovoRapid", 2.0, None, Some("after walk".into()))
            .await
            .unwrap();
        monitor.log_feeding("Bella", 1.5, "breakfast", None, None).await.unwrap();

        let events = monitor.today_events("Bella").await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| e.id == id));

        let snapshot = monitor.snapshot("Bella").await.unwrap().unwrap();
        assert_eq!(snapshot.insulin_total_today, 2.0);
        assert_eq!(snapshot.feeding_total_today, 1.5);
    }

    #[tokio::test]
    async fn unknown_product_and_subject_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(&dir);
        assert!(monitor.log_insulin("Bella", "Mystery", 1.0, None, None).await.is_err());
        assert!(monitor.log_insulin("Nobody", "Lantus", 1.0, None, None).await.is_err());
        assert!(monitor.log_feeding("Bella", 1.0, "brunch", None, None).await.is_err());
    }

    #[tokio::test]
    async fn per_kg_preset_scales_by_weight() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(&dir);
        let id = monitor.log_preset("Bella", "evening dose", None).await.unwrap();
        let event = monitor.context().db.get_event(&id).await.unwrap().unwrap();
        assert_eq!(event.amount, 2.0);
        assert_eq!(event.product.as_deref(), Some("Lantus"));
    }

    #[tokio::test]
    async fn relative_log_is_backdated() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(&dir);
        let before = Utc::now();
        let id = monitor
            .log_relative(
                NewEvent {
                    subject: "Bella".into(),
                    kind: EventKind::Feeding,
                    amount: 1.0,
                    product: None,
                    category: Some("reward".into()),
                    note: None,
                    timestamp: None,
                },
                30,
            )
            .await
            .unwrap();
        let event = monitor.context().db.get_event(&id).await.unwrap().unwrap();
        assert!(event.timestamp <= before - Duration::minutes(29));
        assert!(event.created_at >= before);
    }

    #[tokio::test]
    async fn archiving_removes_event_from_totals() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(&dir);
        let id = monitor.log_insulin("Bella", "Lantus", 3.0, None, None).await.unwrap();

        assert!(monitor.archive_event(&id).await.unwrap());
        assert!(!monitor.archive_event(&id).await.unwrap());
        assert!(!monitor.archive_event("missing").await.unwrap());

        let snapshot = monitor.snapshot("Bella").await.unwrap().unwrap();
        assert_eq!(snapshot.insulin_total_today, 0.0);
        assert!(monitor.today_events("Bella").await.unwrap().is_empty());
    }
}
