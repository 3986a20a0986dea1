//! Daily report generation and CSV export on top of persisted history.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Local, NaiveDate, Utc};

use crate::db::models::StoredReading;
use crate::notify::{Notification, Severity};
use crate::reporting::{
    compute_daily_stats, export_csv, local_day_bounds, render_text, CurrentStatus, DailyReport,
};

use super::controller::Monitor;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

impl Monitor {
    /// Aggregate one local day for every configured subject. Buffered
    /// readings are flushed first so the report sees the whole day. Each
    /// subject also carries its latest live snapshot, if it has one.
    pub async fn build_daily_report(&self, date: NaiveDate) -> Result<DailyReport> {
        let ctx = self.context();
        if let Err(err) = ctx.buffer.flush().await {
            log_warn!("Flush before report for {date} failed, using stored rows only: {err:#}");
        }

        let settings = self.settings();
        let (start, end) = local_day_bounds(date);
        let mut subjects = Vec::with_capacity(settings.subjects.len());
        for subject in &settings.subjects {
            let entries = ctx
                .load_entries(&subject.name, start, end)
                .await
                .with_context(|| format!("failed to load readings for {}", subject.name))?;
            let events = ctx
                .db
                .get_events(Some(&subject.name), start, end, None)
                .await
                .with_context(|| format!("failed to load events for {}", subject.name))?;
            let mut stats = compute_daily_stats(
                &subject.name,
                date,
                &subject.thresholds,
                &entries,
                &events,
                &ctx.analytics,
            );
            if let Ok(coordinator) = self.coordinator(&subject.name) {
                stats.current = coordinator.snapshot().await.map(|snapshot| CurrentStatus {
                    value: snapshot.glucose_value,
                    trend: snapshot.trend,
                    status: snapshot.status.as_str().to_string(),
                    updated_at: snapshot.updated_at,
                });
            }
            subjects.push(stats);
        }

        Ok(DailyReport {
            date,
            generated_at: Utc::now(),
            subjects,
        })
    }

    /// Build and send the report for `date` (yesterday when omitted). The
    /// report is always kept as a local notice, even if delivery fails.
    pub async fn send_daily_report(&self, date: Option<NaiveDate>) -> Result<DailyReport> {
        let date = match date {
            Some(date) => date,
            None => Local::now()
                .date_naive()
                .pred_opt()
                .context("no previous day")?,
        };

        let report = self.build_daily_report(date).await?;
        let notification = Notification {
            title: report.title(),
            message: render_text(&report),
            severity: Severity::Default,
            targets: self.settings().alarms.targets.clone(),
        };
        let delivered = self.context().dispatcher.dispatch(notification).await;
        log_info!(
            "Daily report for {date} covering {} subjects (delivered: {delivered})",
            report.subjects.len()
        );
        Ok(report)
    }

    /// Timer entry point: report on the day before `today`, at most once per
    /// date. Returns whether a report went out.
    pub async fn run_scheduled_report(&self, today: NaiveDate) -> Result<bool> {
        let date = today.pred_opt().context("no previous day")?;
        let mut last = self.last_report_date.lock().await;
        if *last == Some(date) {
            return Ok(false);
        }
        self.send_daily_report(Some(date)).await?;
        *last = Some(date);
        Ok(true)
    }

    /// Readings and events of one subject in `[from, to)` as `;`-separated
    /// rows.
    pub async fn export_csv(
        &self,
        subject: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<String> {
        self.coordinator(subject)?;
        let ctx = self.context();
        ctx.buffer.flush().await.context("failed to flush readings before export")?;

        let readings: Vec<StoredReading> = ctx.db.get_readings(subject, from, to).await?;
        let events = ctx.db.get_events(Some(subject), from, to, None).await?;
        Ok(export_csv(&readings, &events))
    }

    /// Export the whole local day `date`.
    pub async fn export_day_csv(&self, subject: &str, date: NaiveDate) -> Result<String> {
        let (start, end) = local_day_bounds(date);
        self.export_csv(subject, start, end).await
    }

    /// Export the last `days` local days ending now.
    pub async fn export_recent_csv(&self, subject: &str, days: u32) -> Result<String> {
        let now = Utc::now();
        self.export_csv(subject, now - Duration::days(i64::from(days)), now)
            .await
    }
}
