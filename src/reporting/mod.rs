pub mod daily;
pub mod render;

pub use daily::{
    compute_daily_stats, local_day_bounds, summarize_values, CurrentStatus, DailyReport,
    DailyStats, ValueSummary,
};
pub use render::{export_csv, render_text};
