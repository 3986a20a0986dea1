use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use tokio::sync::{broadcast, Mutex};

use crate::analytics::{normalize_state, parse_trend, AnalyticsConfig, ReadingEntry, Thresholds, WindowStats};
use crate::db::{
    models::{EventKind, StoredReading},
    Database, ReadingBuffer,
};
use crate::notify::Dispatcher;
use crate::reporting::local_day_bounds;
use crate::scheduler::{Scheduler, TaskKey};
use crate::settings::{MonitorSettings, SettingsStore};
use crate::sources::{SensorSample, SensorSource};

use super::alarms::{AlarmInput, AlarmKind, AlarmPriority, AlarmState};
use super::sensors::{extract_all, SensorValue};
use super::snapshot::{event_total, SubjectSnapshot};
use super::state::{LinkState, LinkTracker, Observation};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Shared services every coordinator works against.
pub struct MonitorContext {
    pub settings: Arc<SettingsStore>,
    pub db: Database,
    pub buffer: Arc<ReadingBuffer>,
    pub source: Arc<dyn SensorSource>,
    pub dispatcher: Dispatcher,
    pub analytics: AnalyticsConfig,
}

impl MonitorContext {
    pub fn new(
        settings: Arc<SettingsStore>,
        db: Database,
        source: Arc<dyn SensorSource>,
        dispatcher: Dispatcher,
    ) -> Self {
        let flush_every = settings.current().reading_flush_every;
        Self {
            buffer: Arc::new(ReadingBuffer::new(db.clone(), flush_every)),
            settings,
            db,
            source,
            dispatcher,
            analytics: AnalyticsConfig::default(),
        }
    }

    /// Stored plus still-buffered readings in `[start, end)`, oldest first.
    pub async fn load_entries(
        &self,
        subject: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ReadingEntry>> {
        let mut readings = self.db.get_readings(subject, start, end).await?;
        readings.extend(self.buffer.pending_for(subject, start, end).await);
        readings.sort_by_key(|reading| reading.timestamp);
        readings.dedup_by_key(|reading| reading.timestamp);
        Ok(readings.iter().map(StoredReading::entry).collect())
    }
}

struct CoordinatorState {
    link: LinkTracker,
    alarms: AlarmState,
    /// Source `last_updated` of the last sample written to history.
    last_tracked_update: Option<DateTime<Utc>>,
    had_value: bool,
    restored: bool,
    snapshot: Option<SubjectSnapshot>,
}

/// One subject's actor. The state mutex is held for a whole tick, so ticks
/// for the same subject never interleave.
pub struct SubjectCoordinator {
    name: String,
    ctx: Arc<MonitorContext>,
    state: Mutex<CoordinatorState>,
}

impl SubjectCoordinator {
    pub fn new(name: &str, ctx: Arc<MonitorContext>) -> Self {
        Self {
            name: name.to_string(),
            ctx,
            state: Mutex::new(CoordinatorState {
                link: LinkTracker::new(),
                alarms: AlarmState::new(),
                last_tracked_update: None,
                had_value: false,
                restored: false,
                snapshot: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn snapshot(&self) -> Option<SubjectSnapshot> {
        self.state.lock().await.snapshot.clone()
    }

    pub async fn alarm_state(&self) -> AlarmState {
        self.state.lock().await.alarms.clone()
    }

    pub async fn reset_alarms(&self) {
        self.state.lock().await.alarms.reset();
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<SubjectSnapshot> {
        let settings = self.ctx.settings.current();
        let config = settings
            .subject(&self.name)
            .cloned()
            .with_context(|| format!("subject {} is not configured", self.name))?;

        let mut state = self.state.lock().await;
        if !state.restored {
            self.restore(&mut state).await;
        }

        let sample = self.ctx.source.get(&config.glucose_sensor);
        let trend = self
            .ctx
            .source
            .get(&config.trend_sensor)
            .and_then(|sample| parse_trend(&sample.state));
        let timeout = Duration::minutes(i64::from(config.data_timeout_minutes));
        let observation = state
            .link
            .observe(sample.as_ref(), &config.thresholds, timeout, now);

        self.track_reading(&mut state, sample.as_ref(), &observation, &config.thresholds, now)
            .await;

        let (day_start, day_end) = local_day_bounds(now.with_timezone(&Local).date_naive());
        let today = self.window_stats(&config.thresholds, day_start, now).await;
        let range_start = now - Duration::hours(i64::from(settings.stats_range_hours));
        let range = self.window_stats(&config.thresholds, range_start, now).await;

        let events_today = match self
            .ctx
            .db
            .get_events(Some(&self.name), day_start, day_end, None)
            .await
        {
            Ok(events) => events,
            Err(err) => {
                log_warn!("Could not load today's events for {}: {err:#}", self.name);
                Vec::new()
            }
        };

        let input = AlarmInput {
            status: observation.status,
            link: observation.link,
            trend,
            value: observation.value,
            reading_age_minutes: observation.reading_age_minutes,
        };
        let priorities = settings.priorities_for(&config);
        let high_delay = Duration::minutes(i64::from(config.high_alarm_delay_minutes));
        let decisions = state
            .alarms
            .evaluate(&self.name, &input, &priorities, high_delay, now);
        log_debug!(
            "Tick {} at {now}: {} ({:?}), link {:?}, {} alarm(s)",
            self.name,
            observation.status.as_str(),
            observation.value,
            observation.link,
            decisions.len()
        );
        for decision in decisions {
            log_info!(
                "Alarm {} fired for {} (severity {:?})",
                decision.kind.as_str(),
                self.name,
                decision.severity
            );
            if let Some(notification) = decision.into_notification(&settings.alarms.targets) {
                self.ctx.dispatcher.dispatch(notification).await;
            }
        }

        let snapshot = SubjectSnapshot {
            subject: self.name.clone(),
            glucose_value: observation.value,
            trend,
            status: observation.status,
            link: observation.link,
            outage_minutes: observation.outage_minutes,
            reading_age_minutes: observation.reading_age_minutes,
            last_reading_at: state.link.last_good(),
            today,
            range,
            insulin_total_today: event_total(&events_today, EventKind::Insulin),
            feeding_total_today: event_total(&events_today, EventKind::Feeding),
            events_today,
            updated_at: now,
        };
        state.snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn restore(&self, state: &mut CoordinatorState) {
        match self.ctx.db.latest_numeric_reading(&self.name).await {
            Ok(latest) => {
                if let Some(reading) = latest {
                    state.last_tracked_update =
                        reading.source_updated_at.or(Some(reading.timestamp));
                    state.link.restore_last_good(reading.timestamp);
                }
                state.restored = true;
            }
            Err(err) => {
                log_warn!("Could not restore history for {}: {err:#}", self.name);
            }
        }
    }

    /// Append the sample to history when the source has polled since the
    /// last write. Unusable samples become gap markers; losing a value
    /// without a fresh sample marks a gap at `now`.
    async fn track_reading(
        &self,
        state: &mut CoordinatorState,
        sample: Option<&SensorSample>,
        observation: &Observation,
        thresholds: &Thresholds,
        now: DateTime<Utc>,
    ) {
        let mut batch = Vec::new();
        let mut recorded_gap = false;

        if let Some(sample) = sample {
            if state.last_tracked_update != Some(sample.last_updated) {
                state.last_tracked_update = Some(sample.last_updated);
                let unusable = observation.link == LinkState::Lost
                    || normalize_state(&sample.state, thresholds).is_none();
                match observation.value {
                    Some(value) => batch.push(StoredReading {
                        subject: self.name.clone(),
                        timestamp: sample.last_updated,
                        value: Some(value),
                        source_updated_at: Some(sample.last_updated),
                    }),
                    None if unusable => {
                        batch.push(StoredReading {
                            subject: self.name.clone(),
                            timestamp: sample.last_updated,
                            value: None,
                            source_updated_at: Some(sample.last_updated),
                        });
                        recorded_gap = true;
                    }
                    None => {}
                }
            }
        }

        if state.had_value && observation.value.is_none() && !recorded_gap {
            batch.push(StoredReading::gap(&self.name, now));
        }
        state.had_value = observation.value.is_some();

        if let Err(err) = self.ctx.buffer.push(batch).await {
            log_error!("Failed to queue readings for {}: {err:#}", self.name);
        }
    }

    async fn window_stats(
        &self,
        thresholds: &Thresholds,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<WindowStats> {
        match self.ctx.load_entries(&self.name, start, end).await {
            Ok(entries) => Some(WindowStats::compute(
                &entries,
                thresholds,
                start,
                end,
                &self.ctx.analytics,
            )),
            Err(err) => {
                log_warn!("History unavailable for {}: {err:#}", self.name);
                None
            }
        }
    }
}

fn schedule_changed(before: &MonitorSettings, after: &MonitorSettings) -> bool {
    let names = |settings: &MonitorSettings| -> Vec<String> {
        settings.subjects.iter().map(|s| s.name.clone()).collect()
    };
    before.poll_interval_secs != after.poll_interval_secs
        || before.daily_report_time != after.daily_report_time
        || names(before) != names(after)
}

/// All subjects, their background loops and the cross-subject operations.
pub struct Monitor {
    ctx: Arc<MonitorContext>,
    coordinators: RwLock<BTreeMap<String, Arc<SubjectCoordinator>>>,
    scheduler: Scheduler,
    pub(super) last_report_date: Mutex<Option<NaiveDate>>,
    running: AtomicBool,
}

impl Monitor {
    pub fn new(ctx: Arc<MonitorContext>) -> Arc<Self> {
        let monitor = Arc::new(Self {
            ctx,
            coordinators: RwLock::new(BTreeMap::new()),
            scheduler: Scheduler::new(),
            last_report_date: Mutex::new(None),
            running: AtomicBool::new(false),
        });
        monitor.sync_subjects();
        monitor
    }

    pub fn context(&self) -> &Arc<MonitorContext> {
        &self.ctx
    }

    pub fn settings(&self) -> Arc<MonitorSettings> {
        self.ctx.settings.current()
    }

    /// Match coordinators to the configured subjects. New subjects start
    /// with fresh alarm state; removed ones are dropped.
    fn sync_subjects(&self) {
        let settings = self.settings();
        let mut coordinators = self
            .coordinators
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        coordinators.retain(|name, _| settings.subject(name).is_some());
        for subject in &settings.subjects {
            if !coordinators.contains_key(&subject.name) {
                log_info!("Registered subject {}", subject.name);
                coordinators.insert(
                    subject.name.clone(),
                    Arc::new(SubjectCoordinator::new(&subject.name, self.ctx.clone())),
                );
            }
        }
    }

    pub fn subjects(&self) -> Vec<String> {
        self.coordinators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn coordinator(&self, subject: &str) -> Result<Arc<SubjectCoordinator>> {
        self.coordinators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subject)
            .cloned()
            .with_context(|| format!("unknown subject {subject}"))
    }

    fn all_coordinators(&self) -> Vec<Arc<SubjectCoordinator>> {
        self.coordinators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub async fn refresh_subject(&self, subject: &str) -> Result<SubjectSnapshot> {
        self.refresh_subject_at(subject, Utc::now()).await
    }

    pub async fn refresh_subject_at(
        &self,
        subject: &str,
        now: DateTime<Utc>,
    ) -> Result<SubjectSnapshot> {
        self.coordinator(subject)?.tick(now).await
    }

    pub async fn refresh_all(&self) -> Vec<SubjectSnapshot> {
        self.refresh_all_at(Utc::now()).await
    }

    /// Refresh every subject in turn. A failing subject is logged and
    /// skipped.
    pub async fn refresh_all_at(&self, now: DateTime<Utc>) -> Vec<SubjectSnapshot> {
        let mut snapshots = Vec::new();
        for coordinator in self.all_coordinators() {
            match coordinator.tick(now).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => log_error!("Refresh failed for {}: {err:#}", coordinator.name()),
            }
        }
        snapshots
    }

    /// React to a changed entity. Returns how many subjects were refreshed.
    pub async fn handle_sensor_update(&self, entity_id: &str) -> usize {
        let settings = self.settings();
        let affected: Vec<String> = settings
            .subjects
            .iter()
            .filter(|s| s.glucose_sensor == entity_id || s.trend_sensor == entity_id)
            .map(|s| s.name.clone())
            .collect();

        let mut refreshed = 0;
        for subject in affected {
            match self.refresh_subject(&subject).await {
                Ok(_) => refreshed += 1,
                Err(err) => log_error!("Update-triggered refresh failed for {subject}: {err:#}"),
            }
        }
        refreshed
    }

    pub async fn snapshot(&self, subject: &str) -> Result<Option<SubjectSnapshot>> {
        Ok(self.coordinator(subject)?.snapshot().await)
    }

    /// Published sensor values from the latest snapshot, refreshing first
    /// if the subject has not ticked yet.
    pub async fn sensor_values(&self, subject: &str) -> Result<Vec<SensorValue>> {
        let coordinator = self.coordinator(subject)?;
        let snapshot = match coordinator.snapshot().await {
            Some(snapshot) => snapshot,
            None => coordinator.tick(Utc::now()).await?,
        };
        Ok(extract_all(&snapshot))
    }

    /// Validate and store new settings, then bring coordinators and loops in
    /// line with them.
    pub async fn update_settings(self: &Arc<Self>, settings: MonitorSettings) -> Result<()> {
        let before = self.settings();
        let settings = self.ctx.settings.update(settings)?;
        self.apply_settings(&before, &settings).await;
        Ok(())
    }

    /// Re-read the settings file and apply it.
    pub async fn reload_settings(self: &Arc<Self>) -> Result<()> {
        let before = self.settings();
        self.ctx.settings.reload()?;
        let settings = self.settings();
        self.apply_settings(&before, &settings).await;
        Ok(())
    }

    /// Loops are only rebuilt when their timing or the subject list changed;
    /// other edits take effect on the next tick.
    async fn apply_settings(self: &Arc<Self>, before: &MonitorSettings, settings: &MonitorSettings) {
        self.ctx.buffer.set_flush_every(settings.reading_flush_every);
        self.sync_subjects();
        if self.running.load(Ordering::SeqCst) && schedule_changed(before, settings) {
            log_info!("Polling schedule changed, restarting loops");
            self.schedule_all();
        }
        self.refresh_all().await;
    }

    pub async fn set_alarm_priority(
        self: &Arc<Self>,
        subject: &str,
        kind: AlarmKind,
        priority: AlarmPriority,
    ) -> Result<()> {
        self.coordinator(subject)?;
        let before = self.settings();
        let settings = self.ctx.settings.modify(|settings| {
            if let Some(config) = settings.subjects.iter_mut().find(|s| s.name == subject) {
                config.alarm_priorities.set(kind, priority);
            }
        })?;
        self.apply_settings(&before, &settings).await;
        Ok(())
    }

    /// Set one alarm priority on every subject, one after another.
    pub async fn apply_alarm_priority_to_all(
        self: &Arc<Self>,
        kind: AlarmKind,
        priority: AlarmPriority,
    ) -> Result<()> {
        let before = self.settings();
        let settings = self.ctx.settings.modify(|settings| {
            for config in settings.subjects.iter_mut() {
                config.alarm_priorities.set(kind, priority);
            }
        })?;
        log_info!(
            "Applied {:?} priority for {} to {} subjects",
            priority,
            kind.as_str(),
            settings.subjects.len()
        );
        self.apply_settings(&before, &settings).await;
        Ok(())
    }

    /// Start the poll loops and the daily report timer. Calling it again
    /// replaces the existing timers.
    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        self.schedule_all();
    }

    fn schedule_all(self: &Arc<Self>) {
        let settings = self.settings();
        let period = std::time::Duration::from_secs(settings.poll_interval_secs);
        let subjects = self.subjects();
        self.scheduler.retain_polls(&subjects);

        for subject in subjects {
            let weak = Arc::downgrade(self);
            let name = subject.clone();
            self.scheduler
                .schedule_repeating(TaskKey::Poll(subject), period, move || {
                    let weak = weak.clone();
                    let name = name.clone();
                    async move {
                        let Some(monitor) = weak.upgrade() else {
                            return;
                        };
                        if let Err(err) = monitor.refresh_subject(&name).await {
                            log_error!("Poll failed for {name}: {err:#}");
                        }
                    }
                });
        }

        let weak = Arc::downgrade(self);
        self.scheduler
            .schedule_daily(TaskKey::DailyReport, settings.daily_report_time, move || {
                let weak = weak.clone();
                async move {
                    let Some(monitor) = weak.upgrade() else {
                        return;
                    };
                    let today = Local::now().date_naive();
                    if let Err(err) = monitor.run_scheduled_report(today).await {
                        log_error!("Daily report failed: {err:#}");
                    }
                }
            });
    }

    /// Refresh subjects whenever the source announces a changed entity.
    pub fn listen(self: &Arc<Self>, changes: broadcast::Receiver<String>) {
        let weak = Arc::downgrade(self);
        self.scheduler.spawn(TaskKey::SensorEvents, move |token| async move {
            let mut changes = changes;
            loop {
                tokio::select! {
                    received = changes.recv() => match received {
                        Ok(entity_id) => {
                            let Some(monitor) = weak.upgrade() else { break };
                            monitor.handle_sensor_update(&entity_id).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log_warn!("Sensor listener skipped {skipped} updates");
                            let Some(monitor) = weak.upgrade() else { break };
                            monitor.refresh_all().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = token.cancelled() => break,
                }
            }
        });
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop every loop, write out buffered readings and close the database.
    pub async fn shutdown(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.scheduler.shutdown().await;
        let flushed = self.ctx.buffer.flush().await;
        self.ctx.db.shutdown();
        let written = flushed.context("final reading flush failed")?;
        log_info!("Monitor stopped, {written} readings written on shutdown");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::Zone;
    use crate::monitor::state::GlucoseStatus;
    use crate::notify::{NoticeBoard, RecordingNotifier, Severity};
    use crate::settings::SubjectConfig;
    use crate::sources::StateRegistry;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const GLUCOSE: &str = "sensor.bella_glucose";
    const TREND: &str = "sensor.bella_trend";

    struct Harness {
        _dir: TempDir,
        monitor: Arc<Monitor>,
        registry: Arc<StateRegistry>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness() -> Harness {
        harness_with(RecordingNotifier::new())
    }

    fn harness_with(notifier: RecordingNotifier) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = MonitorSettings {
            subjects: vec![SubjectConfig::new("Bella", GLUCOSE, TREND)],
            reading_flush_every: 1,
            ..MonitorSettings::default()
        };
        settings.alarms.targets = vec!["phone".into()];

        let store = Arc::new(SettingsStore::in_memory(settings).unwrap());
        let db = Database::new(dir.path().join("monitor.sqlite3")).unwrap();
        let registry = Arc::new(StateRegistry::new());
        let notifier = Arc::new(notifier);
        let dispatcher = Dispatcher::new(notifier.clone(), Arc::new(NoticeBoard::new()));
        let ctx = Arc::new(MonitorContext::new(store, db, registry.clone(), dispatcher));

        Harness {
            _dir: dir,
            monitor: Monitor::new(ctx),
            registry,
            notifier,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn at(minute: i64) -> DateTime<Utc> {
        t0() + Duration::minutes(minute)
    }

    #[tokio::test]
    async fn tick_classifies_and_persists_new_samples() {
        let h = harness();
        h.registry.set(GLUCOSE, "250", at(0));
        h.registry.set(TREND, "steady", at(0));

        let snapshot = h.monitor.refresh_subject_at("Bella", at(0)).await.unwrap();
        assert_eq!(snapshot.status, GlucoseStatus::Zone(Zone::InRange));
        assert_eq!(snapshot.link, LinkState::Ok);

        // Same poll again: nothing new to store.
        h.monitor.refresh_subject_at("Bella", at(1)).await.unwrap();
        let stored = h.monitor.context().db.get_readings("Bella", at(-1), at(10)).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn critical_low_notifies_once_while_it_persists() {
        let h = harness();
        for minute in 0..5 {
            h.registry.set(GLUCOSE, "50", at(minute * 5));
            h.monitor
                .refresh_subject_at("Bella", at(minute * 5))
                .await
                .unwrap();
        }

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].severity, Severity::Critical);
        assert_eq!(sent[0].targets, vec!["phone".to_string()]);

        h.registry.set(GLUCOSE, "220", at(30));
        h.monitor.refresh_subject_at("Bella", at(30)).await.unwrap();
        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].title.contains("back to normal"));
    }

    #[tokio::test]
    async fn reset_alarms_rearms_active_condition() {
        let h = harness();
        h.registry.set(GLUCOSE, "50", at(0));
        h.monitor.refresh_subject_at("Bella", at(0)).await.unwrap();

        h.monitor.coordinator("Bella").unwrap().reset_alarms().await;
        h.registry.set(GLUCOSE, "50", at(5));
        h.monitor.refresh_subject_at("Bella", at(5)).await.unwrap();

        assert_eq!(h.notifier.sent().len(), 2);
    }

    #[tokio::test]
    async fn failed_dispatch_still_marks_alarm() {
        let h = harness();
        h.notifier.set_failing(true);
        h.registry.set(GLUCOSE, "50", at(0));
        h.monitor.refresh_subject_at("Bella", at(0)).await.unwrap();

        h.notifier.set_failing(false);
        h.registry.set(GLUCOSE, "48", at(5));
        h.monitor.refresh_subject_at("Bella", at(5)).await.unwrap();

        assert!(h.notifier.sent().is_empty());
        let coordinator = h.monitor.coordinator("Bella").unwrap();
        assert!(coordinator.alarm_state().await.is_notified(AlarmKind::CriticalLow));
        assert_eq!(h.monitor.context().dispatcher.notices().list().len(), 1);
    }

    #[tokio::test]
    async fn outage_records_a_gap_and_notifies_once() {
        let h = harness();
        h.registry.set(GLUCOSE, "250", at(0));
        h.monitor.refresh_subject_at("Bella", at(0)).await.unwrap();

        h.registry.set(GLUCOSE, "unavailable", at(5));
        let snapshot = h.monitor.refresh_subject_at("Bella", at(5)).await.unwrap();
        assert_eq!(snapshot.link, LinkState::Lost);
        assert_eq!(snapshot.status, GlucoseStatus::NoData);
        h.monitor.refresh_subject_at("Bella", at(6)).await.unwrap();

        let no_data: Vec<_> = h
            .notifier
            .sent()
            .into_iter()
            .filter(|n| n.title.starts_with("Data gap"))
            .collect();
        assert_eq!(no_data.len(), 1);

        let stored = h.monitor.context().db.get_readings("Bella", at(-1), at(10)).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored[1].value.is_none());
        assert_eq!(stored[1].timestamp, at(5));
    }

    #[tokio::test]
    async fn stale_reading_sends_a_single_data_gap() {
        let h = harness();
        h.registry.set(GLUCOSE, "250", at(0));
        h.monitor.refresh_subject_at("Bella", at(0)).await.unwrap();

        for minute in [25, 60, 120] {
            let snapshot = h.monitor.refresh_subject_at("Bella", at(minute)).await.unwrap();
            assert_eq!(snapshot.status, GlucoseStatus::NoData);
            assert_eq!(snapshot.link, LinkState::Ok);
        }

        let gaps: Vec<_> = h
            .notifier
            .sent()
            .into_iter()
            .filter(|n| n.title.starts_with("Data gap"))
            .collect();
        assert_eq!(gaps.len(), 1);
        assert!(gaps[0].message.contains("25 min"));
    }

    #[tokio::test]
    async fn missing_entity_is_a_lost_link() {
        let h = harness();
        h.registry.set(GLUCOSE, "250", at(0));
        h.monitor.refresh_subject_at("Bella", at(0)).await.unwrap();

        h.registry.remove(GLUCOSE);
        let snapshot = h.monitor.refresh_subject_at("Bella", at(3)).await.unwrap();
        assert_eq!(snapshot.link, LinkState::Lost);
        assert_eq!(snapshot.reading_age_minutes, Some(3.0));

        let stored = h.monitor.context().db.get_readings("Bella", at(-1), at(10)).await.unwrap();
        assert_eq!(stored.last().unwrap().timestamp, at(3));
        assert!(stored.last().unwrap().value.is_none());
    }

    #[tokio::test]
    async fn sensor_update_refreshes_matching_subject_only() {
        let h = harness();
        h.registry.set(GLUCOSE, "120", Utc::now());
        assert_eq!(h.monitor.handle_sensor_update(GLUCOSE).await, 1);
        assert_eq!(h.monitor.handle_sensor_update("sensor.other").await, 0);
        assert!(h.monitor.snapshot("Bella").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn threshold_changes_apply_on_next_tick() {
        let h = harness();
        h.registry.set(GLUCOSE, "250", at(0));
        let before = h.monitor.refresh_subject_at("Bella", at(0)).await.unwrap();
        assert_eq!(before.status, GlucoseStatus::Zone(Zone::InRange));

        let mut settings = (*h.monitor.settings()).clone();
        settings.subjects[0].thresholds.high = 240.0;
        h.monitor.update_settings(settings).await.unwrap();

        let after = h.monitor.refresh_subject_at("Bella", at(1)).await.unwrap();
        assert_eq!(after.status, GlucoseStatus::Zone(Zone::High));
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected_before_reaching_coordinators() {
        let h = harness();
        let mut settings = (*h.monitor.settings()).clone();
        settings.subjects[0].thresholds.low = 10.0;
        assert!(h.monitor.update_settings(settings).await.is_err());
        assert_eq!(h.monitor.settings().subjects[0].thresholds.low, 200.0);
    }

    #[tokio::test]
    async fn apply_to_all_sets_every_subject() {
        let h = harness();
        let mut settings = (*h.monitor.settings()).clone();
        settings
            .subjects
            .push(SubjectConfig::new("Max", "sensor.max_glucose", "sensor.max_trend"));
        h.monitor.update_settings(settings).await.unwrap();
        assert_eq!(h.monitor.subjects(), vec!["Bella".to_string(), "Max".to_string()]);

        h.monitor
            .apply_alarm_priority_to_all(AlarmKind::NoData, AlarmPriority::Off)
            .await
            .unwrap();
        let settings = h.monitor.settings();
        for subject in &settings.subjects {
            assert_eq!(
                settings.priorities_for(subject).get(AlarmKind::NoData),
                AlarmPriority::Off
            );
        }
    }

    #[tokio::test]
    async fn priority_change_does_not_interrupt_a_running_poll() {
        let h = harness_with(RecordingNotifier::with_latency(
            std::time::Duration::from_millis(300),
        ));
        h.registry.set(GLUCOSE, "50", Utc::now());
        h.registry.set(TREND, "falling_quickly", Utc::now());

        h.monitor.start();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        h.monitor
            .apply_alarm_priority_to_all(AlarmKind::Recovery, AlarmPriority::Off)
            .await
            .unwrap();

        let titles: Vec<String> = h.notifier.sent().into_iter().map(|n| n.title).collect();
        assert_eq!(titles.len(), 2, "{titles:?}");
        assert!(titles[0].contains("critically low"));
        assert!(titles[1].contains("falling quickly"));
        assert_eq!(h.monitor.context().dispatcher.notices().list().len(), 2);
        assert!(h.monitor.scheduler.is_scheduled(&TaskKey::Poll("Bella".into())));

        h.monitor.shutdown().await.unwrap();
    }

    #[test]
    fn only_timing_and_subject_changes_restart_loops() {
        let before = MonitorSettings {
            subjects: vec![SubjectConfig::new("Bella", GLUCOSE, TREND)],
            ..MonitorSettings::default()
        };

        let mut priorities = before.clone();
        priorities.subjects[0]
            .alarm_priorities
            .set(AlarmKind::High, AlarmPriority::Off);
        priorities.subjects[0].thresholds.high = 240.0;
        assert!(!schedule_changed(&before, &priorities));

        let mut interval = before.clone();
        interval.poll_interval_secs = 30;
        assert!(schedule_changed(&before, &interval));

        let mut report = before.clone();
        report.daily_report_time = chrono::NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        assert!(schedule_changed(&before, &report));

        let mut subjects = before.clone();
        subjects
            .subjects
            .push(SubjectConfig::new("Max", "sensor.max_glucose", "sensor.max_trend"));
        assert!(schedule_changed(&before, &subjects));
    }

    #[tokio::test]
    async fn removed_subject_is_unregistered() {
        let h = harness();
        let mut settings = (*h.monitor.settings()).clone();
        settings.subjects.clear();
        h.monitor.update_settings(settings).await.unwrap();
        assert!(h.monitor.subjects().is_empty());
        assert!(h.monitor.refresh_subject("Bella").await.is_err());
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_readings() {
        let h = harness();
        h.monitor.context().buffer.set_flush_every(100);
        h.registry.set(GLUCOSE, "250", at(0));
        h.monitor.refresh_subject_at("Bella", at(0)).await.unwrap();
        assert_eq!(h.monitor.context().buffer.len().await, 1);

        let db = h.monitor.context().db.clone();
        let path = db.path().to_path_buf();
        h.monitor.shutdown().await.unwrap();

        let reopened = Database::new(path).unwrap();
        let stored = reopened.get_readings("Bella", at(-1), at(10)).await.unwrap();
        assert_eq!(stored.len(), 1);
    }
}
