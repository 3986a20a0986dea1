use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime, parse_event_kind},
    models::{Event, EventKind, NewEvent},
};

const EVENT_COLUMNS: &str =
    "id, subject, kind, amount, product, category, note, timestamp, created_at, archived";

fn row_to_event(row: &Row) -> Result<Event> {
    let kind: String = row.get("kind")?;
    let timestamp: String = row.get("timestamp")?;
    let created_at: String = row.get("created_at")?;
    let archived: i64 = row.get("archived")?;

    Ok(Event {
        id: row.get("id")?,
        subject: row.get("subject")?,
        kind: parse_event_kind(&kind)?,
        amount: row.get("amount")?,
        product: row.get("product")?,
        category: row.get("category")?,
        note: row.get("note")?,
        timestamp: parse_datetime(&timestamp, "timestamp")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        archived: archived != 0,
    })
}

impl Database {
    /// Store a new event under a fresh id. A missing timestamp is stamped
    /// with `now`.
    pub async fn insert_event(&self, event: NewEvent, now: DateTime<Utc>) -> Result<Event> {
        if !event.amount.is_finite() || event.amount < 0.0 {
            bail!("event amount must be a non-negative number");
        }

        let record = Event {
            id: Uuid::new_v4().to_string(),
            subject: event.subject,
            kind: event.kind,
            amount: event.amount,
            product: event.product,
            category: event.category,
            note: event.note,
            timestamp: event.timestamp.unwrap_or(now),
            created_at: now,
            archived: false,
        };

        let stored = record.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO events (id, subject, kind, amount, product, category, note, timestamp, created_at, archived)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)",
                params![
                    stored.id,
                    stored.subject,
                    stored.kind.as_str(),
                    stored.amount,
                    stored.product,
                    stored.category,
                    stored.note,
                    format_datetime(&stored.timestamp),
                    format_datetime(&stored.created_at),
                ],
            )?;
            Ok(())
        })
        .await?;

        Ok(record)
    }

    /// Hide an event from queries and totals. `false` when the id is unknown
    /// or the event was already archived.
    pub async fn archive_event(&self, event_id: &str) -> Result<bool> {
        let event_id = event_id.to_string();
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE events SET archived = 1 WHERE id = ?1 AND archived = 0",
                params![event_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn get_event(&self, event_id: &str) -> Result<Option<Event>> {
        let event_id = event_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"
            ))?;
            let event = stmt
                .query_row(params![event_id], |row| Ok(row_to_event(row)))
                .optional()?
                .transpose()?;
            Ok(event)
        })
        .await
    }

    /// Active events in `[start, end)`, oldest first. `None` filters match
    /// everything.
    pub async fn get_events(
        &self,
        subject: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        kind: Option<EventKind>,
    ) -> Result<Vec<Event>> {
        let subject = subject.map(str::to_string);
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS}
                 FROM events
                 WHERE archived = 0
                   AND timestamp >= ?1 AND timestamp < ?2
                   AND (?3 IS NULL OR subject = ?3)
                   AND (?4 IS NULL OR kind = ?4)
                 ORDER BY timestamp ASC, created_at ASC"
            ))?;

            let mut rows = stmt.query(params![
                format_datetime(&start),
                format_datetime(&end),
                subject,
                kind.map(|k| k.as_str()),
            ])?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(row_to_event(row)?);
            }
            Ok(events)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn insulin(amount: f64) -> NewEvent {
        NewEvent {
            subject: "Bella".into(),
            kind: EventKind::Insulin,
            amount,
            product: Some("NovoRapid".into()),
            category: None,
            note: None,
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn missing_timestamp_is_stamped_now() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("events.sqlite3")).unwrap();

        let event = db.insert_event(insulin(2.0), now()).await.unwrap();
        assert_eq!(event.timestamp, now());

        let loaded = db.get_event(&event.id).await.unwrap().unwrap();
        assert_eq!(loaded, event);
    }

    #[tokio::test]
    async fn events_logged_in_the_same_second_get_distinct_ids() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("events.sqlite3")).unwrap();

        let mut ids = HashSet::new();
        for _ in 0..5 {
            let event = db.insert_event(insulin(1.0), now()).await.unwrap();
            ids.insert(event.id);
        }
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test]
    async fn archived_events_disappear_from_queries() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("events.sqlite3")).unwrap();

        let kept = db.insert_event(insulin(2.0), now()).await.unwrap();
        let dropped = db.insert_event(insulin(3.0), now()).await.unwrap();

        assert!(db.archive_event(&dropped.id).await.unwrap());
        assert!(!db.archive_event(&dropped.id).await.unwrap());
        assert!(!db.archive_event("no-such-id").await.unwrap());

        let events = db
            .get_events(Some("Bella"), now() - Duration::hours(1), now() + Duration::hours(1), None)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, kept.id);
    }

    #[tokio::test]
    async fn kind_and_subject_filters_apply() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("events.sqlite3")).unwrap();

        db.insert_event(insulin(2.0), now()).await.unwrap();
        db.insert_event(
            NewEvent {
                kind: EventKind::Feeding,
                product: None,
                category: Some("breakfast".into()),
                ..insulin(1.5)
            },
            now(),
        )
        .await
        .unwrap();
        db.insert_event(
            NewEvent {
                subject: "Max".into(),
                ..insulin(4.0)
            },
            now(),
        )
        .await
        .unwrap();

        let window = (now() - Duration::hours(1), now() + Duration::hours(1));
        let feedings = db
            .get_events(Some("Bella"), window.0, window.1, Some(EventKind::Feeding))
            .await
            .unwrap();
        assert_eq!(feedings.len(), 1);
        assert_eq!(feedings[0].detail(), "breakfast");

        let everyone = db.get_events(None, window.0, window.1, None).await.unwrap();
        assert_eq!(everyone.len(), 3);
    }

    #[tokio::test]
    async fn negative_amount_is_rejected() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("events.sqlite3")).unwrap();
        assert!(db.insert_event(insulin(-1.0), now()).await.is_err());
    }
}
