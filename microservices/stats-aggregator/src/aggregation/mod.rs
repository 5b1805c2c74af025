//! Time-bucket aggregation: hourly rows, daily rollups and sliding windows

mod daily;
mod hourly;
mod topk;
mod window;

use std::time::Duration;

/// TTL for rows cached on a read miss. A read can load a row, lose the
/// race with a concurrent commit's invalidation and then cache the old
/// row; this bounds how long such a row is served.
pub const READ_FILL_TTL: Duration = Duration::from_secs(60);

pub use daily::{build_daily, validate_group, DailyAggregator, RollupReport};
pub use hourly::{apply_update, weighted_average, HourlyAggregator, HourlyUpdate};
pub use topk::{merge_top_keywords, rank_keywords, recount_top_keywords};
pub use window::{classify_trend, WindowAggregator};
