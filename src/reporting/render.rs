use chrono::{DateTime, Local, Utc};

use crate::analytics::{Thresholds, Zone};
use crate::db::models::{Event, StoredReading};

use super::daily::{CurrentStatus, DailyReport, DailyStats};

const CSV_DELIMITER: char = ';';
const CSV_HEADER: [&str; 6] = [
    "timestamp_iso",
    "timestamp_local",
    "subject",
    "kind",
    "value",
    "detail",
];

fn zone_range(stats: &DailyStats, zone: Zone) -> String {
    match stats.thresholds.bounds(zone) {
        (None, Some(upper)) => format!("<{upper}"),
        (Some(lower), None) => format!(">{lower}"),
        (Some(lower), Some(upper)) => format!("{lower}-{upper}"),
        (None, None) => String::new(),
    }
}

fn thresholds_line(thresholds: &Thresholds) -> String {
    let mut parts = vec![format!("critical low <{}", thresholds.critical_low)];
    if let Some(very_low) = thresholds.very_low {
        parts.push(format!("very low <{very_low}"));
    }
    parts.push(format!("low <{}", thresholds.low));
    parts.push(format!("high >{}", thresholds.high));
    parts.push(format!("very high >{}", thresholds.very_high));
    format!("  Thresholds: {} mg/dL", parts.join(", "))
}

fn render_current(current: Option<&CurrentStatus>, lines: &mut Vec<String>) {
    let Some(current) = current else {
        lines.push("  Current glucose: N/A".to_string());
        lines.push("  Current status: N/A".to_string());
        return;
    };
    let value = match current.value {
        Some(value) => format!("{value} mg/dL"),
        None => "N/A".to_string(),
    };
    let trend = current.trend.map_or("unknown", |trend| trend.as_str());
    lines.push(format!("  Current glucose: {value} ({trend})"));
    lines.push(format!("  Current status: {}", current.status));
}

fn render_subject(stats: &DailyStats, lines: &mut Vec<String>) {
    lines.push(format!("--- {} ---", stats.subject));
    render_current(stats.current.as_ref(), lines);
    lines.push(thresholds_line(&stats.thresholds));

    let Some(values) = stats.values else {
        lines.push(format!("  No readings recorded for {}", stats.date));
        lines.push(String::new());
        return;
    };

    lines.push(format!(
        "  Readings: {} (gaps marked: {})",
        values.count, stats.gap_markers
    ));
    lines.push(format!(
        "  Glucose min/mean/median/max: {} / {} / {} / {} mg/dL",
        values.min, values.mean, values.median, values.max
    ));
    for zone in Zone::ALL {
        if zone == Zone::VeryLow && stats.thresholds.very_low.is_none() {
            continue;
        }
        lines.push(format!(
            "  {} ({}): {}%",
            zone.label(),
            zone_range(stats, zone),
            stats.window.zone(zone)
        ));
    }
    let completeness = &stats.window.completeness;
    lines.push(format!(
        "  Coverage: {}% ({} of {} expected readings, {} missed, {} min)",
        stats.window.coverage_pct,
        completeness.actual,
        completeness.expected,
        completeness.missed,
        completeness.missed_minutes
    ));
    lines.push(format!("  Total insulin: {} IU", stats.insulin_total));
    for (product, amount) in &stats.insulin_by_product {
        lines.push(format!("    {product}: {amount} IU"));
    }
    lines.push(format!("  Total feeding: {} BE", stats.feeding_total));
    for (category, amount) in &stats.feeding_by_category {
        lines.push(format!("    {category}: {amount} BE"));
    }
    if stats.emergencies > 0 {
        lines.push(format!("  Emergency rations: {}", stats.emergencies));
    }
    if stats.interventions > 0 {
        lines.push(format!("  Interventions: {}", stats.interventions));
    }
    lines.push(String::new());
}

/// Plain-text body of the daily report.
pub fn render_text(report: &DailyReport) -> String {
    let mut lines = vec![report.title(), "=".repeat(60), String::new()];
    if report.subjects.is_empty() {
        lines.push("No subjects configured".to_string());
    }
    for stats in &report.subjects {
        render_subject(stats, &mut lines);
    }
    lines.join("\n")
}

fn csv_field(value: &str) -> String {
    if value.contains(&[CSV_DELIMITER, '"', '\n', '\r'][..]) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_row(timestamp: &DateTime<Utc>, subject: &str, kind: &str, value: &str, detail: &str) -> String {
    let local = timestamp.with_timezone(&Local);
    [
        local.to_rfc3339(),
        local.format("%d.%m.%Y %H:%M").to_string(),
        subject.to_string(),
        kind.to_string(),
        value.to_string(),
        detail.to_string(),
    ]
    .iter()
    .map(|field| csv_field(field))
    .collect::<Vec<_>>()
    .join(&CSV_DELIMITER.to_string())
}

/// Readings and events merged into one `;`-separated table, oldest first.
pub fn export_csv(readings: &[StoredReading], events: &[Event]) -> String {
    let mut rows: Vec<(DateTime<Utc>, String)> = Vec::with_capacity(readings.len() + events.len());

    for reading in readings {
        let (kind, value) = match reading.value {
            Some(value) => ("reading", value.to_string()),
            None => ("gap", String::new()),
        };
        rows.push((
            reading.timestamp,
            csv_row(&reading.timestamp, &reading.subject, kind, &value, ""),
        ));
    }

    for event in events.iter().filter(|event| !event.archived) {
        let detail = match event.note.as_deref() {
            Some(note) if !note.is_empty() => format!("{} ({note})", event.detail()),
            _ => event.detail().to_string(),
        };
        rows.push((
            event.timestamp,
            csv_row(
                &event.timestamp,
                &event.subject,
                event.kind.as_str(),
                &format!("{} {}", event.amount, event.kind.unit()),
                &detail,
            ),
        ));
    }

    rows.sort_by_key(|(timestamp, _)| *timestamp);

    let mut out = CSV_HEADER.join(&CSV_DELIMITER.to_string());
    out.push('\n');
    for (_, row) in rows {
        out.push_str(&row);
        out.push('\n');
    }
    out
}
