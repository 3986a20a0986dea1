//! Service boundary: one function per operation, errors flattened to
//! strings, plus a JSON request/response envelope for the line protocol.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::models::Event;
use crate::notify::Notice;
use crate::reporting::DailyReport;
use crate::settings::MonitorSettings;
use crate::sources::StateRegistry;

use super::alarms::{AlarmKind, AlarmPriority};
use super::controller::Monitor;
use super::sensors::SensorValue;
use super::snapshot::SubjectSnapshot;

pub struct CommandContext {
    pub monitor: Arc<Monitor>,
    pub registry: Arc<StateRegistry>,
}

pub async fn refresh(ctx: &CommandContext, subject: Option<String>) -> Result<Vec<SubjectSnapshot>, String> {
    match subject {
        Some(subject) => ctx
            .monitor
            .refresh_subject(&subject)
            .await
            .map(|snapshot| vec![snapshot])
            .map_err(|e| e.to_string()),
        None => Ok(ctx.monitor.refresh_all().await),
    }
}

pub async fn get_snapshot(ctx: &CommandContext, subject: String) -> Result<Option<SubjectSnapshot>, String> {
    ctx.monitor.snapshot(&subject).await.map_err(|e| e.to_string())
}

pub async fn get_sensor_values(ctx: &CommandContext, subject: String) -> Result<Vec<SensorValue>, String> {
    ctx.monitor
        .sensor_values(&subject)
        .await
        .map_err(|e| e.to_string())
}

pub async fn log_insulin(
    ctx: &CommandContext,
    subject: String,
    product: String,
    amount: f64,
    timestamp: Option<DateTime<Utc>>,
    note: Option<String>,
) -> Result<String, String> {
    ctx.monitor
        .log_insulin(&subject, &product, amount, timestamp, note)
        .await
        .map_err(|e| e.to_string())
}

pub async fn log_feeding(
    ctx: &CommandContext,
    subject: String,
    amount: f64,
    category: String,
    description: Option<String>,
    timestamp: Option<DateTime<Utc>>,
) -> Result<String, String> {
    ctx.monitor
        .log_feeding(&subject, amount, &category, description, timestamp)
        .await
        .map_err(|e| e.to_string())
}

pub async fn log_preset(
    ctx: &CommandContext,
    subject: String,
    preset: String,
    timestamp: Option<DateTime<Utc>>,
) -> Result<String, String> {
    ctx.monitor
        .log_preset(&subject, &preset, timestamp)
        .await
        .map_err(|e| e.to_string())
}

pub async fn archive_event(ctx: &CommandContext, event_id: String) -> Result<bool, String> {
    ctx.monitor
        .archive_event(&event_id)
        .await
        .map_err(|e| e.to_string())
}

pub async fn get_today_events(ctx: &CommandContext, subject: String) -> Result<Vec<Event>, String> {
    ctx.monitor
        .today_events(&subject)
        .await
        .map_err(|e| e.to_string())
}

pub async fn send_daily_report(ctx: &CommandContext, date: Option<NaiveDate>) -> Result<DailyReport, String> {
    ctx.monitor
        .send_daily_report(date)
        .await
        .map_err(|e| e.to_string())
}

pub async fn export_csv(
    ctx: &CommandContext,
    subject: String,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<String, String> {
    if to < from {
        return Err("export range ends before it starts".to_string());
    }
    ctx.monitor
        .export_csv(&subject, from, to)
        .await
        .map_err(|e| e.to_string())
}

pub async fn set_alarm_priority(
    ctx: &CommandContext,
    subject: String,
    kind: AlarmKind,
    priority: AlarmPriority,
) -> Result<(), String> {
    ctx.monitor
        .set_alarm_priority(&subject, kind, priority)
        .await
        .map_err(|e| e.to_string())
}

pub async fn apply_alarm_priority_to_all(
    ctx: &CommandContext,
    kind: AlarmKind,
    priority: AlarmPriority,
) -> Result<(), String> {
    ctx.monitor
        .apply_alarm_priority_to_all(kind, priority)
        .await
        .map_err(|e| e.to_string())
}

pub fn get_settings(ctx: &CommandContext) -> MonitorSettings {
    (*ctx.monitor.settings()).clone()
}

pub async fn update_settings(ctx: &CommandContext, settings: MonitorSettings) -> Result<(), String> {
    ctx.monitor
        .update_settings(settings)
        .await
        .map_err(|e| e.to_string())
}

pub fn list_notices(ctx: &CommandContext) -> Vec<Notice> {
    ctx.monitor.context().dispatcher.notices().list()
}

pub fn dismiss_notice(ctx: &CommandContext, notice_id: String) -> bool {
    ctx.monitor.context().dispatcher.notices().dismiss(&notice_id)
}

/// Feed a raw entity state into the registry. Listening monitors refresh
/// through the registry's change channel.
pub fn set_sensor_state(
    ctx: &CommandContext,
    entity_id: String,
    state: String,
    last_updated: Option<DateTime<Utc>>,
) {
    ctx.registry
        .set(&entity_id, &state, last_updated.unwrap_or_else(Utc::now));
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Refresh {
        #[serde(default)]
        subject: Option<String>,
    },
    Snapshot {
        subject: String,
    },
    Sensors {
        subject: String,
    },
    LogInsulin {
        subject: String,
        product: String,
        amount: f64,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        note: Option<String>,
        #[serde(default)]
        minutes_ago: Option<u32>,
    },
    LogFeeding {
        subject: String,
        amount: f64,
        category: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        minutes_ago: Option<u32>,
    },
    LogPreset {
        subject: String,
        preset: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        minutes_ago: Option<u32>,
    },
    ArchiveEvent {
        event_id: String,
    },
    TodayEvents {
        subject: String,
    },
    SendDailyReport {
        #[serde(default)]
        date: Option<NaiveDate>,
    },
    ExportCsv {
        subject: String,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    SetAlarmPriority {
        subject: String,
        kind: AlarmKind,
        priority: AlarmPriority,
    },
    ApplyAlarmPriorityToAll {
        kind: AlarmKind,
        priority: AlarmPriority,
    },
    GetSettings,
    UpdateSettings {
        settings: MonitorSettings,
    },
    Notices,
    DismissNotice {
        notice_id: String,
    },
    SensorState {
        entity_id: String,
        state: String,
        #[serde(default)]
        last_updated: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok { data: Value },
    Error { message: String },
}

impl Response {
    fn from_result<T: Serialize>(result: Result<T, String>) -> Self {
        match result.and_then(|data| serde_json::to_value(data).map_err(|e| e.to_string())) {
            Ok(data) => Response::Ok { data },
            Err(message) => Response::Error { message },
        }
    }
}

/// `minutes_ago` wins over an explicit timestamp.
fn relative_stamp(timestamp: Option<DateTime<Utc>>, minutes_ago: Option<u32>) -> Option<DateTime<Utc>> {
    match minutes_ago {
        Some(minutes) => Some(Utc::now() - chrono::Duration::minutes(i64::from(minutes))),
        None => timestamp,
    }
}

impl CommandContext {
    pub fn new(monitor: Arc<Monitor>, registry: Arc<StateRegistry>) -> Self {
        Self { monitor, registry }
    }

    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Refresh { subject } => Response::from_result(refresh(self, subject).await),
            Request::Snapshot { subject } => Response::from_result(get_snapshot(self, subject).await),
            Request::Sensors { subject } => {
                Response::from_result(get_sensor_values(self, subject).await)
            }
            Request::LogInsulin {
                subject,
                product,
                amount,
                timestamp,
                note,
                minutes_ago,
            } => {
                let timestamp = relative_stamp(timestamp, minutes_ago);
                Response::from_result(log_insulin(self, subject, product, amount, timestamp, note).await)
            }
            Request::LogFeeding {
                subject,
                amount,
                category,
                description,
                timestamp,
                minutes_ago,
            } => {
                let timestamp = relative_stamp(timestamp, minutes_ago);
                Response::from_result(
                    log_feeding(self, subject, amount, category, description, timestamp).await,
                )
            }
            Request::LogPreset {
                subject,
                preset,
                timestamp,
                minutes_ago,
            } => {
                let timestamp = relative_stamp(timestamp, minutes_ago);
                Response::from_result(log_preset(self, subject, preset, timestamp).await)
            }
            Request::ArchiveEvent { event_id } => {
                Response::from_result(archive_event(self, event_id).await)
            }
            Request::TodayEvents { subject } => {
                Response::from_result(get_today_events(self, subject).await)
            }
            Request::SendDailyReport { date } => {
                Response::from_result(send_daily_report(self, date).await)
            }
            Request::ExportCsv { subject, from, to } => {
                Response::from_result(export_csv(self, subject, from, to).await)
            }
            Request::SetAlarmPriority {
                subject,
                kind,
                priority,
            } => Response::from_result(set_alarm_priority(self, subject, kind, priority).await),
            Request::ApplyAlarmPriorityToAll { kind, priority } => {
                Response::from_result(apply_alarm_priority_to_all(self, kind, priority).await)
            }
            Request::GetSettings => Response::from_result(Ok(get_settings(self))),
            Request::UpdateSettings { settings } => {
                Response::from_result(update_settings(self, settings).await)
            }
            Request::Notices => Response::from_result(Ok(list_notices(self))),
            Request::DismissNotice { notice_id } => {
                Response::from_result(Ok(dismiss_notice(self, notice_id)))
            }
            Request::SensorState {
                entity_id,
                state,
                last_updated,
            } => {
                set_sensor_state(self, entity_id, state, last_updated);
                Response::from_result(Ok(()))
            }
        }
    }

    /// Parse one JSON line and answer it. Malformed input becomes an error
    /// response rather than a failure of the caller.
    pub async fn handle_line(&self, line: &str) -> Response {
        match serde_json::from_str::<Request>(line) {
            Ok(request) => self.handle(request).await,
            Err(err) => Response::Error {
                message: format!("invalid request: {err}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::monitor::controller::MonitorContext;
    use crate::notify::{Dispatcher, NoticeBoard, RecordingNotifier};
    use crate::settings::{SettingsStore, SubjectConfig};
    use serde_json::json;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> CommandContext {
        let settings = MonitorSettings {
            subjects: vec![SubjectConfig::new(
                "Bella",
                "sensor.bella_glucose",
                "sensor.bella_trend",
            )],
            ..MonitorSettings::default()
        };
        let store = Arc::new(SettingsStore::in_memory(settings).unwrap());
        let db = Database::new(dir.path().join("commands.sqlite3")).unwrap();
        let registry = Arc::new(StateRegistry::new());
        let dispatcher = Dispatcher::new(
            Arc::new(RecordingNotifier::new()),
            Arc::new(NoticeBoard::new()),
        );
        let ctx = MonitorContext::new(store, db, registry.clone(), dispatcher);
        CommandContext::new(Monitor::new(Arc::new(ctx)), registry)
    }

    #[tokio::test]
    async fn sensor_state_then_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);

        let response = ctx
            .handle_line(r#"{"command":"sensor_state","entity_id":"sensor.bella_glucose","state":"250"}"#)
            .await;
        assert_eq!(response, Response::Ok { data: Value::Null });

        let response = ctx.handle_line(r#"{"command":"refresh","subject":"Bella"}"#).await;
        let Response::Ok { data } = response else {
            panic!("refresh failed: {response:?}");
        };
        assert_eq!(data[0]["status"], json!("in_range"));
        assert_eq!(data[0]["glucose_value"], json!(250.0));
    }

    #[tokio::test]
    async fn errors_are_flattened_to_messages() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);

        let response = ctx.handle_line(r#"{"command":"snapshot","subject":"Nobody"}"#).await;
        assert_eq!(
            response,
            Response::Error {
                message: "unknown subject Nobody".to_string()
            }
        );

        let response = ctx.handle_line("not json").await;
        assert!(matches!(response, Response::Error { .. }));
    }

    #[tokio::test]
    async fn log_and_archive_through_requests() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);

        let response = ctx
            .handle(Request::LogFeeding {
                subject: "Bella".into(),
                amount: 2.0,
                category: "dinner".into(),
                description: None,
                timestamp: None,
                minutes_ago: None,
            })
            .await;
        let Response::Ok { data } = response else {
            panic!("log failed: {response:?}");
        };
        let id = data.as_str().unwrap().to_string();

        let events = get_today_events(&ctx, "Bella".into()).await.unwrap();
        assert_eq!(events.len(), 1);

        assert_eq!(archive_event(&ctx, id).await, Ok(true));
        assert!(get_today_events(&ctx, "Bella".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn priority_requests_update_settings() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);

        let response = ctx
            .handle_line(r#"{"command":"set_alarm_priority","subject":"Bella","kind":"no_data","priority":"off"}"#)
            .await;
        assert_eq!(response, Response::Ok { data: Value::Null });

        let settings = get_settings(&ctx);
        let subject = settings.subject("Bella").unwrap();
        assert_eq!(
            settings.priorities_for(subject).get(AlarmKind::NoData),
            AlarmPriority::Off
        );
    }

    #[tokio::test]
    async fn export_rejects_inverted_range() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let now = Utc::now();
        let result = export_csv(&ctx, "Bella".into(), now, now - chrono::Duration::hours(1)).await;
        assert!(result.is_err());
    }
}
