//! Per-key consolidation of repeated observations.
//!
//! For every `post_id` in a batch the full history of
//! (`post_extracted_datetime`, `base_time`) pairs is kept, while every other
//! attribute collapses to the value observed in the most recent row. The
//! result is expanded back to one row per historical observation, so a key
//! observed N times yields exactly N rows, all sharing the latest attributes.
//!
//! Output ordering is deterministic: keys ascend lexicographically, and each
//! key's rows ascend by timestamp with unparseable (null) timestamps last.
//! Equal timestamps keep their batch order.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::NaiveDateTime;
use tracing::{info, warn};

use crate::error::StructuralError;
use crate::table::{BASE_TIME, POST_EXTRACTED_DATETIME, POST_ID, Table, Value, key_text};
use crate::wrangle::base_time::extract_base_time;
use crate::wrangle::normalize::{ColumnCoverage, METRIC_COLUMNS, normalize_metrics};

/// Result of consolidating one batch.
#[derive(Debug, Clone)]
pub struct Consolidated {
    pub table: Table,
    pub coverage: Vec<ColumnCoverage>,
    /// Rows discarded because their `post_id` was empty.
    pub dropped_empty_keys: usize,
}

type Observation = (Option<NaiveDateTime>, Option<NaiveDateTime>);

struct KeyGroup<'a> {
    key: &'a str,
    history: Vec<Observation>,
    latest_row: usize,
    latest_ts: Option<NaiveDateTime>,
}

impl KeyGroup<'_> {
    /// Track the most recent row. Later rows win ties; a row without a
    /// timestamp only wins while no timestamped row has been seen.
    fn observe(&mut self, row: usize, ts: Option<NaiveDateTime>) {
        let newer = match (ts, self.latest_ts) {
            (Some(candidate), Some(current)) => candidate >= current,
            (Some(_), None) | (None, None) => true,
            (None, Some(_)) => false,
        };
        if newer {
            self.latest_row = row;
            self.latest_ts = ts;
        }
    }
}

/// Order timestamps ascending with nulls last.
fn timestamp_order(a: Option<NaiveDateTime>, b: Option<NaiveDateTime>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Consolidate a batch of raw records.
///
/// Steps: attach `base_time`, group by `post_id` keeping every temporal pair,
/// take other attributes from each key's latest row, expand one row per pair,
/// sort, then normalize metric columns.
///
/// Output columns are `post_id`, the remaining input columns in input order,
/// `post_extracted_datetime`, `base_time`.
///
/// # Errors
///
/// Returns [`StructuralError::MissingColumn`] when `post_id` or
/// `post_extracted_datetime` is absent, and [`StructuralError::Invariant`] if
/// the expansion does not produce one row per retained input row.
pub fn consolidate(table: &Table, timestamp_format: &str) -> Result<Consolidated, StructuralError> {
    info!("consolidating {} records", table.len());

    let based = extract_base_time(table, timestamp_format)?;
    let key_index = based.require_column(POST_ID, "consolidation")?;
    let ts_index = based.require_column(POST_EXTRACTED_DATETIME, "consolidation")?;
    let bt_index = based.require_column(BASE_TIME, "consolidation")?;

    let other: Vec<usize> = (0..based.columns().len())
        .filter(|index| ![key_index, ts_index, bt_index].contains(index))
        .collect();

    let mut groups: Vec<KeyGroup<'_>> = Vec::new();
    let mut by_key: HashMap<&str, usize> = HashMap::new();
    let mut dropped_empty_keys = 0_usize;

    for (row_index, row) in based.rows().iter().enumerate() {
        let Some(key) = key_text(&row[key_index]) else {
            dropped_empty_keys += 1;
            continue;
        };
        let ts = row[ts_index].as_time();

        let slot = *by_key.entry(key).or_insert_with(|| {
            groups.push(KeyGroup {
                key,
                history: Vec::new(),
                latest_row: row_index,
                latest_ts: ts,
            });
            groups.len() - 1
        });

        let group = &mut groups[slot];
        group.history.push((ts, row[bt_index].as_time()));
        group.observe(row_index, ts);
    }

    if dropped_empty_keys > 0 {
        warn!(dropped_empty_keys, "dropped records without post_id");
    }

    groups.sort_by(|a, b| a.key.cmp(b.key));

    let mut columns = Vec::with_capacity(other.len() + 3);
    columns.push(POST_ID.to_string());
    columns.extend(other.iter().map(|&index| based.columns()[index].clone()));
    columns.push(POST_EXTRACTED_DATETIME.to_string());
    columns.push(BASE_TIME.to_string());

    let mut expanded = Table::new(columns);
    for group in &mut groups {
        group.history.sort_by(|a, b| timestamp_order(a.0, b.0));
        let latest = &based.rows()[group.latest_row];

        for &(ts, base_time) in &group.history {
            let mut row = Vec::with_capacity(other.len() + 3);
            row.push(Value::Text(group.key.to_string()));
            row.extend(other.iter().map(|&index| latest[index].clone()));
            row.push(ts.into());
            row.push(base_time.into());
            expanded.push_row(row);
        }
    }

    let expected = based.len() - dropped_empty_keys;
    if expanded.len() != expected {
        return Err(StructuralError::Invariant(format!(
            "expanded {} rows for {} keyed input rows",
            expanded.len(),
            expected
        )));
    }

    let key_count = groups.len();
    let (table, coverage) = normalize_metrics(&expanded, &METRIC_COLUMNS);
    info!(
        "consolidation finished: {} records across {} posts",
        table.len(),
        key_count
    );

    Ok(Consolidated {
        table,
        coverage,
        dropped_empty_keys,
    })
}
