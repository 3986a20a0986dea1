//! Glucose status and sensor link tracking.
//!
//! Link loss is decided purely from the raw state: an entity that reports
//! unavailable/unknown (or has vanished) is lost. A numeric value that has
//! not changed for hours is still a live link, because the source keeps
//! polling it and bumps `last_updated`.

use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, Serializer};

use crate::analytics::{normalizer::is_unavailable, normalize_state, Thresholds, Zone};
use crate::sources::SensorSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlucoseStatus {
    Zone(Zone),
    NoData,
}

impl GlucoseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GlucoseStatus::Zone(zone) => zone.as_str(),
            GlucoseStatus::NoData => "no_data",
        }
    }

    pub fn zone(&self) -> Option<Zone> {
        match self {
            GlucoseStatus::Zone(zone) => Some(*zone),
            GlucoseStatus::NoData => None,
        }
    }
}

impl Serialize for GlucoseStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Ok,
    Lost,
}

/// Result of one evaluation of the glucose entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub link: LinkState,
    pub link_changed: bool,
    pub status: GlucoseStatus,
    /// Normalised value, `None` when nothing trustworthy is available.
    pub value: Option<f64>,
    pub outage_minutes: Option<f64>,
    /// Minutes since the last good reading. Keeps growing through an outage.
    pub reading_age_minutes: Option<f64>,
}

fn minutes(duration: Duration) -> f64 {
    (duration.num_milliseconds() as f64 / 60_000.0).max(0.0)
}

#[derive(Debug, Clone)]
pub struct LinkTracker {
    link: LinkState,
    lost_since: Option<DateTime<Utc>>,
    last_good: Option<DateTime<Utc>>,
}

impl Default for LinkTracker {
    fn default() -> Self {
        Self {
            link: LinkState::Ok,
            lost_since: None,
            last_good: None,
        }
    }
}

impl LinkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn lost_since(&self) -> Option<DateTime<Utc>> {
        self.lost_since
    }

    pub fn last_good(&self) -> Option<DateTime<Utc>> {
        self.last_good
    }

    /// Seed the last good time, e.g. from persisted history after a restart.
    pub fn restore_last_good(&mut self, at: DateTime<Utc>) {
        if self.last_good.map_or(true, |current| at > current) {
            self.last_good = Some(at);
        }
    }

    /// Evaluate the current sample. `data_timeout` marks a numeric reading
    /// whose last poll is older than the timeout as absent without touching
    /// the link.
    pub fn observe(
        &mut self,
        sample: Option<&SensorSample>,
        thresholds: &Thresholds,
        data_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Observation {
        let link = match sample {
            Some(sample) if !is_unavailable(&sample.state) => LinkState::Ok,
            _ => LinkState::Lost,
        };

        let link_changed = link != self.link;
        match (self.link, link) {
            (LinkState::Ok, LinkState::Lost) => self.lost_since = Some(now),
            (LinkState::Lost, LinkState::Ok) => self.lost_since = None,
            _ => {}
        }
        self.link = link;

        let value = match (link, sample) {
            (LinkState::Ok, Some(sample)) => normalize_state(&sample.state, thresholds)
                .filter(|_| now - sample.last_updated <= data_timeout),
            _ => None,
        };

        if let (Some(_), Some(sample)) = (value, sample) {
            self.restore_last_good(sample.last_updated);
        }

        let status = match value {
            Some(value) => GlucoseStatus::Zone(thresholds.classify(value)),
            None => GlucoseStatus::NoData,
        };

        Observation {
            link,
            link_changed,
            status,
            value,
            outage_minutes: self.lost_since.map(|since| minutes(now - since)),
            reading_age_minutes: self.last_good.map(|good| minutes(now - good)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn sample(state: &str, last_updated: DateTime<Utc>) -> SensorSample {
        SensorSample {
            state: state.into(),
            last_updated,
        }
    }

    fn timeout() -> Duration {
        Duration::minutes(20)
    }

    #[test]
    fn stable_value_polled_recently_is_not_a_loss() {
        let mut tracker = LinkTracker::new();
        let t = Thresholds::default();
        // Same value for an hour, but the source polled it a minute ago.
        let now = t0() + Duration::hours(1);
        let obs = tracker.observe(Some(&sample("250", now - Duration::minutes(1))), &t, timeout(), now);

        assert_eq!(obs.link, LinkState::Ok);
        assert_eq!(obs.status, GlucoseStatus::Zone(Zone::InRange));
        assert!(!obs.link_changed);
    }

    #[test]
    fn unavailable_state_loses_link_and_age_keeps_growing() {
        let mut tracker = LinkTracker::new();
        let t = Thresholds::default();

        tracker.observe(Some(&sample("250", t0())), &t, timeout(), t0());

        let lost_at = t0() + Duration::minutes(5);
        let obs = tracker.observe(Some(&sample("unavailable", lost_at)), &t, timeout(), lost_at);
        assert_eq!(obs.link, LinkState::Lost);
        assert!(obs.link_changed);
        assert_eq!(obs.status, GlucoseStatus::NoData);
        assert_eq!(obs.outage_minutes, Some(0.0));
        assert_eq!(obs.reading_age_minutes, Some(5.0));

        let later = t0() + Duration::minutes(35);
        let obs = tracker.observe(Some(&sample("unavailable", later)), &t, timeout(), later);
        assert!(!obs.link_changed);
        assert_eq!(obs.outage_minutes, Some(30.0));
        assert_eq!(obs.reading_age_minutes, Some(35.0));
        assert_eq!(tracker.lost_since(), Some(lost_at));
    }

    #[test]
    fn recovery_clears_outage() {
        let mut tracker = LinkTracker::new();
        let t = Thresholds::default();
        tracker.observe(None, &t, timeout(), t0());
        assert_eq!(tracker.link(), LinkState::Lost);

        let back = t0() + Duration::minutes(10);
        let obs = tracker.observe(Some(&sample("120", back)), &t, timeout(), back);
        assert!(obs.link_changed);
        assert_eq!(obs.link, LinkState::Ok);
        assert_eq!(obs.outage_minutes, None);
        assert_eq!(obs.reading_age_minutes, Some(0.0));
    }

    #[test]
    fn stale_poll_is_no_data_with_link_ok() {
        let mut tracker = LinkTracker::new();
        let t = Thresholds::default();
        let now = t0() + Duration::minutes(30);
        let obs = tracker.observe(Some(&sample("120", t0())), &t, timeout(), now);

        assert_eq!(obs.link, LinkState::Ok);
        assert_eq!(obs.status, GlucoseStatus::NoData);
        assert_eq!(obs.value, None);
    }

    #[test]
    fn malformed_value_is_no_data_but_linked() {
        let mut tracker = LinkTracker::new();
        let obs = tracker.observe(
            Some(&sample("12abc", t0())),
            &Thresholds::default(),
            timeout(),
            t0(),
        );
        assert_eq!(obs.link, LinkState::Ok);
        assert_eq!(obs.status, GlucoseStatus::NoData);
        assert_eq!(obs.reading_age_minutes, None);
    }

    #[test]
    fn status_serializes_as_plain_string() {
        let json = serde_json::to_string(&GlucoseStatus::Zone(Zone::CriticalLow)).unwrap();
        assert_eq!(json, "\"critical_low\"");
        let json = serde_json::to_string(&GlucoseStatus::NoData).unwrap();
        assert_eq!(json, "\"no_data\"");
    }
}
