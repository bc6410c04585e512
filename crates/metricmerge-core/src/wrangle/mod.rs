//! Batch wrangling: timestamps, consolidation and metric normalization.

pub mod base_time;
pub mod consolidate;
pub mod normalize;

pub use base_time::{DEFAULT_TIMESTAMP_FORMAT, extract_base_time, parse_timestamp};
pub use consolidate::{Consolidated, consolidate};
pub use normalize::{ColumnCoverage, METRIC_COLUMNS, normalize_metrics, parse_count};
