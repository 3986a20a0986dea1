use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::db::models::EventKind;

/// Fixed-width UTC text so lexical order matches chronological order in
/// range queries.
pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_datetime(&raw, field).map(Some),
        None => Ok(None),
    }
}

pub fn parse_event_kind(value: &str) -> Result<EventKind> {
    match value {
        "insulin" => Ok(EventKind::Insulin),
        "feeding" => Ok(EventKind::Feeding),
        other => Err(anyhow!("unknown event kind {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn formatted_timestamps_sort_lexically() {
        let early = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let late = early + chrono::Duration::milliseconds(1500);
        assert!(format_datetime(&early) < format_datetime(&late));
        assert_eq!(format_datetime(&early), "2026-03-01T09:00:00.000Z");
    }

    #[test]
    fn parse_round_trips_formatted_value() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        assert_eq!(parse_datetime(&format_datetime(&ts), "ts").unwrap(), ts);
        assert!(parse_datetime("yesterday", "ts").is_err());
    }
}
