pub mod completeness;
pub mod config;
pub mod normalizer;
pub mod weighting;
pub mod window;
pub mod zones;

pub use completeness::{count_completeness, Completeness};
pub use config::AnalyticsConfig;
pub use normalizer::{normalize, normalize_state, parse_trend, RawSample, ReadingEntry, Trend};
pub use weighting::{accumulate, compute_coverage, compute_zone_stats, CoverageAccumulator};
pub use window::WindowStats;
pub use zones::{classify, Thresholds, Zone, ZONE_COUNT};

/// Round to one decimal place, the precision used for every percentage we
/// hand to dashboards and reports.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
