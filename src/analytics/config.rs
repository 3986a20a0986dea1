/// Longest a reading is trusted once the stream after it turns into a gap.
pub const GAP_CAP_MINUTES: f64 = 5.0;

/// Nominal CGM sampling interval.
pub const SAMPLING_INTERVAL_MINUTES: f64 = 5.0;

/// Tunables for the weighting and completeness models.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsConfig {
    /// Cap applied to a reading's weight when the next entry is a gap marker.
    pub gap_cap_minutes: f64,

    /// Expected spacing between readings, used by the gap-count model.
    pub sampling_interval_minutes: f64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            gap_cap_minutes: GAP_CAP_MINUTES,
            sampling_interval_minutes: SAMPLING_INTERVAL_MINUTES,
        }
    }
}
