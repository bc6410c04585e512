//! Per-key earliest observation time.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use tracing::info;

use crate::error::StructuralError;
use crate::table::{BASE_TIME, POST_EXTRACTED_DATETIME, POST_ID, Table, Value, key_text};

/// Timestamp format of `post_extracted_datetime` in source exports.
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

/// Parse one timestamp cell. Already-typed cells pass through.
#[must_use]
pub fn parse_timestamp(value: &Value, format: &str) -> Option<NaiveDateTime> {
    match value {
        Value::Time(ts) => Some(*ts),
        Value::Text(raw) => NaiveDateTime::parse_from_str(raw.trim(), format).ok(),
        Value::Null | Value::Int(_) => None,
    }
}

/// Parse `post_extracted_datetime` and attach `base_time` to every row.
///
/// `base_time` is the minimum parseable timestamp among the rows sharing a
/// `post_id`; rows whose key has no parseable timestamp get null. Unparseable
/// timestamps become null but their rows are kept. An existing `base_time`
/// column is replaced.
///
/// # Errors
///
/// Returns [`StructuralError::MissingColumn`] if `post_id` or
/// `post_extracted_datetime` is absent.
pub fn extract_base_time(table: &Table, format: &str) -> Result<Table, StructuralError> {
    let key_index = table.require_column(POST_ID, "base-time extraction")?;
    let ts_index = table.require_column(POST_EXTRACTED_DATETIME, "base-time extraction")?;

    let mut based = table.clone();
    based.map_column(ts_index, |value| parse_timestamp(value, format).into());

    let mut earliest: HashMap<&str, Option<NaiveDateTime>> = HashMap::new();
    for row in based.rows() {
        let Some(key) = key_text(&row[key_index]) else {
            continue;
        };
        let ts = row[ts_index].as_time();
        let slot = earliest.entry(key).or_insert(None);
        *slot = match (*slot, ts) {
            (Some(current), Some(candidate)) => Some(current.min(candidate)),
            (current, candidate) => current.or(candidate),
        };
    }

    let with_time = earliest.values().filter(|ts| ts.is_some()).count();
    info!(
        "base times extracted for {} of {} posts",
        with_time,
        earliest.len()
    );

    let base_times: Vec<Value> = based
        .rows()
        .iter()
        .map(|row| {
            key_text(&row[key_index])
                .and_then(|key| earliest.get(key).copied().flatten())
                .into()
        })
        .collect();

    based.upsert_column(BASE_TIME, base_times);
    Ok(based)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .and_then(|d| d.and_hms_opt(hour, 0, 0))
            .expect("valid timestamp")
    }

    fn sample() -> Table {
        Table::from_text(
            &["post_id", "post_extracted_datetime", "post_likes"],
            &[
                &["p1", "03/01/2024 10:00:00", "2"],
                &["p1", "01/01/2024 09:00:00", "1"],
                &["p2", "not a date", "5"],
                &["p1", "", "3"],
                &["p3", "02/01/2024 12:00:00", "7"],
            ],
        )
    }

    #[test]
    fn base_time_is_per_key_minimum() {
        let based = extract_base_time(&sample(), DEFAULT_TIMESTAMP_FORMAT).expect("extract");
        let bt = based.column_index(BASE_TIME).expect("base_time column");

        assert_eq!(based.rows()[0][bt], Value::Time(at(1, 9)));
        assert_eq!(based.rows()[1][bt], Value::Time(at(1, 9)));
        assert_eq!(based.rows()[3][bt], Value::Time(at(1, 9)));
        assert_eq!(based.rows()[4][bt], Value::Time(at(2, 12)));
    }

    #[test]
    fn unparseable_timestamps_are_null_but_rows_survive() {
        let based = extract_base_time(&sample(), DEFAULT_TIMESTAMP_FORMAT).expect("extract");
        let ts = based
            .column_index(POST_EXTRACTED_DATETIME)
            .expect("timestamp column");
        let bt = based.column_index(BASE_TIME).expect("base_time column");

        assert_eq!(based.len(), 5);
        assert_eq!(based.rows()[2][ts], Value::Null);
        assert_eq!(based.rows()[2][bt], Value::Null);
        assert_eq!(based.rows()[3][ts], Value::Null);
    }

    #[test]
    fn input_table_is_not_mutated() {
        let table = sample();
        let _ = extract_base_time(&table, DEFAULT_TIMESTAMP_FORMAT).expect("extract");
        assert_eq!(table, sample());
    }

    #[test]
    fn reapplying_is_idempotent() {
        let once = extract_base_time(&sample(), DEFAULT_TIMESTAMP_FORMAT).expect("extract");
        let twice = extract_base_time(&once, DEFAULT_TIMESTAMP_FORMAT).expect("extract");
        assert_eq!(once, twice);
    }

    #[test]
    fn missing_timestamp_column_is_structural() {
        let table = Table::from_text(&["post_id"], &[&["p1"]]);
        let err = extract_base_time(&table, DEFAULT_TIMESTAMP_FORMAT).expect_err("must fail");
        assert!(matches!(
            err,
            StructuralError::MissingColumn { column, .. } if column == POST_EXTRACTED_DATETIME
        ));
    }

    #[test]
    fn custom_format_is_honoured() {
        let table = Table::from_text(
            &["post_id", "post_extracted_datetime"],
            &[&["p1", "2024-01-03 10:00:00"]],
        );
        let based = extract_base_time(&table, "%Y-%m-%d %H:%M:%S").expect("extract");
        assert_eq!(based.rows()[0][2], Value::Time(at(3, 10)));
    }
}
