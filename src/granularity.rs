//! Time-bucket granularity selection for the metrics backend
//!
//! Pre-aggregated metrics are stored at day, hour and minute rollups. Reading
//! the coarsest rollup that exactly tiles the requested window keeps scans
//! small without changing results. Alignment of the window boundaries alone
//! decides; the span does not matter.

use chrono::{DateTime, Timelike, Utc};

/// One day, in seconds
pub const GRANULARITY_DAY: u64 = 86_400;
/// One hour, in seconds
pub const GRANULARITY_HOUR: u64 = 3_600;
/// One minute, in seconds
pub const GRANULARITY_MINUTE: u64 = 60;

fn is_midnight(t: DateTime<Utc>) -> bool {
    t.hour() == 0 && t.minute() == 0 && t.second() == 0
}

fn is_on_the_hour(t: DateTime<Utc>) -> bool {
    t.minute() == 0 && t.second() == 0
}

/// Pick the coarsest rollup whose buckets exactly tile `[start, end)`
///
/// Both boundaries at midnight select the day rollup, both on an hour
/// boundary the hour rollup, anything else the minute rollup.
pub fn select_granularity(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    if is_midnight(start) && is_midnight(end) {
        GRANULARITY_DAY
    } else if is_on_the_hour(start) && is_on_the_hour(end) {
        GRANULARITY_HOUR
    } else {
        GRANULARITY_MINUTE
    }
}
