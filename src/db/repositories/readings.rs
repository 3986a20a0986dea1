use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime, parse_optional_datetime},
    models::StoredReading,
};

fn row_to_reading(row: &Row) -> Result<StoredReading> {
    let timestamp: String = row.get("timestamp")?;
    let source_updated_at: Option<String> = row.get("source_updated_at")?;

    Ok(StoredReading {
        subject: row.get("subject")?,
        timestamp: parse_datetime(&timestamp, "timestamp")?,
        value: row.get("value")?,
        source_updated_at: parse_optional_datetime(source_updated_at, "source_updated_at")?,
    })
}

impl Database {
    /// Write a batch in one transaction. Rows that collide on
    /// `(subject, timestamp)` are skipped; returns how many were new.
    pub async fn insert_readings(&self, readings: Vec<StoredReading>) -> Result<usize> {
        if readings.is_empty() {
            return Ok(0);
        }

        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO readings (subject, timestamp, value, source_updated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for reading in &readings {
                    inserted += stmt.execute(params![
                        reading.subject,
                        format_datetime(&reading.timestamp),
                        reading.value,
                        reading.source_updated_at.as_ref().map(format_datetime),
                    ])?;
                }
            }
            tx.commit().context("failed to commit readings batch")?;
            Ok(inserted)
        })
        .await
    }

    /// Readings in `[start, end)`, oldest first. Gap markers included.
    pub async fn get_readings(
        &self,
        subject: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredReading>> {
        let subject = subject.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT subject, timestamp, value, source_updated_at
                 FROM readings
                 WHERE subject = ?1 AND timestamp >= ?2 AND timestamp < ?3
                 ORDER BY timestamp ASC",
            )?;

            let mut rows = stmt.query(params![
                subject,
                format_datetime(&start),
                format_datetime(&end)
            ])?;
            let mut readings = Vec::new();
            while let Some(row) = rows.next()? {
                readings.push(row_to_reading(row)?);
            }
            Ok(readings)
        })
        .await
    }

    /// Most recent numeric reading, used to restore dedupe state on startup.
    pub async fn latest_numeric_reading(&self, subject: &str) -> Result<Option<StoredReading>> {
        let subject = subject.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT subject, timestamp, value, source_updated_at
                 FROM readings
                 WHERE subject = ?1 AND value IS NOT NULL
                 ORDER BY timestamp DESC
                 LIMIT 1",
            )?;

            let reading = stmt
                .query_row(params![subject], |row| Ok(row_to_reading(row)))
                .optional()?
                .transpose()?;
            Ok(reading)
        })
        .await
    }
}
