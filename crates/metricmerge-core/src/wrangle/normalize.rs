//! Numeric normalization of formatted metric strings.
//!
//! Exports render counters for humans: `"1.234"`, `"5k"`, `"2,5 mil"`,
//! `"456 comentários"`. [`parse_count`] keeps only the first run of digits
//! after removing `.` thousands separators. This is lossy for suffixed
//! magnitudes (`"5k"` becomes `5`, `"2,5 mil"` becomes `2`) and that is the
//! accepted behavior: the counters are compared across observations of the
//! same export format, not converted between formats.

use serde::Serialize;
use tracing::info;

use crate::table::{Table, Value};

/// Metric columns normalized to integers.
pub const METRIC_COLUMNS: [&str; 5] = [
    "post_likes",
    "post_comments",
    "post_visualizations",
    "followers",
    "post_video_visualizations",
];

/// Non-null coverage of one normalized column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnCoverage {
    pub column: String,
    pub non_null: usize,
    pub total: usize,
}

impl ColumnCoverage {
    /// Percentage of non-null cells, `0.0` for an empty table.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.non_null as f64 / self.total as f64 * 100.0
        }
    }
}

/// Parse the first digit run of `raw`, ignoring `.` separators.
///
/// Returns `None` when there is no digit or the run overflows `i64`.
#[must_use]
pub fn parse_count(raw: &str) -> Option<i64> {
    let mut digits = String::new();
    for c in raw.chars().filter(|c| *c != '.') {
        if c.is_ascii_digit() {
            digits.push(c);
        } else if !digits.is_empty() {
            break;
        }
    }

    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

fn normalize_cell(value: &Value) -> Value {
    match value {
        Value::Int(n) => Value::Int(*n),
        Value::Null => Value::Null,
        other => parse_count(&other.to_cell()).into(),
    }
}

/// Normalize each present column of `columns` to integers.
///
/// Returns the normalized copy plus per-column coverage. Absent columns are
/// ignored; malformed cells become null without failing the table.
#[must_use]
pub fn normalize_metrics(table: &Table, columns: &[&str]) -> (Table, Vec<ColumnCoverage>) {
    let mut normalized = table.clone();
    let mut coverage = Vec::new();

    for column in columns {
        let Some(index) = normalized.column_index(column) else {
            continue;
        };

        normalized.map_column(index, normalize_cell);

        let stats = ColumnCoverage {
            column: (*column).to_string(),
            non_null: normalized
                .column_values(index)
                .filter(|value| !value.is_null())
                .count(),
            total: normalized.len(),
        };
        info!(
            "column {}: {} valid values of {} ({:.2}%)",
            stats.column,
            stats.non_null,
            stats.total,
            stats.percent()
        );
        coverage.push(stats);
    }

    (normalized, coverage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn documented_examples() {
        assert_eq!(parse_count("1.234"), Some(1234));
        assert_eq!(parse_count("5k"), Some(5));
        assert_eq!(parse_count("abc"), None);
        assert_eq!(parse_count(""), None);
    }

    #[test]
    fn export_style_strings() {
        assert_eq!(parse_count("2,5 mil"), Some(2));
        assert_eq!(parse_count("3M"), Some(3));
        assert_eq!(parse_count("5\n mil"), Some(5));
        assert_eq!(parse_count("456 comentários"), Some(456));
        assert_eq!(parse_count("1,5k comentários"), Some(1));
        assert_eq!(parse_count("sem comentários"), None);
        assert_eq!(parse_count("2.345"), Some(2345));
        assert_eq!(parse_count("views: 1.000.000"), Some(1_000_000));
    }

    #[test]
    fn overflow_is_null() {
        assert_eq!(parse_count("99999999999999999999999"), None);
    }

    #[test]
    fn normalizes_present_columns_only() {
        let table = Table::from_text(
            &["post_id", "post_likes", "caption"],
            &[&["p1", "1.000", "12 likes"], &["p2", "abc", "x"]],
        );
        let (normalized, coverage) = normalize_metrics(&table, &METRIC_COLUMNS);

        assert_eq!(normalized.rows()[0][1], Value::Int(1000));
        assert_eq!(normalized.rows()[1][1], Value::Null);
        assert_eq!(normalized.rows()[0][2], Value::Text("12 likes".into()));
        assert_eq!(
            coverage,
            vec![ColumnCoverage {
                column: "post_likes".into(),
                non_null: 1,
                total: 2,
            }]
        );
        // caller's table is untouched
        assert_eq!(table.rows()[0][1], Value::Text("1.000".into()));
    }

    #[test]
    fn already_normalized_cells_are_stable() {
        let mut table = Table::new(vec!["followers".into()]);
        table.push_row(vec![Value::Int(42)]);
        let (once, _) = normalize_metrics(&table, &METRIC_COLUMNS);
        let (twice, _) = normalize_metrics(&once, &METRIC_COLUMNS);
        assert_eq!(once, twice);
        assert_eq!(twice.rows()[0][0], Value::Int(42));
    }

    #[test]
    fn coverage_percent_of_empty_table_is_zero() {
        let stats = ColumnCoverage {
            column: "followers".into(),
            non_null: 0,
            total: 0,
        };
        assert!(stats.percent().abs() < f64::EPSILON);
    }

    proptest! {
        #[test]
        fn plain_integers_round_trip(n in 0_i64..i64::MAX) {
            prop_assert_eq!(parse_count(&n.to_string()), Some(n));
        }

        #[test]
        fn strings_without_digits_are_null(s in "[^0-9]*") {
            prop_assert_eq!(parse_count(&s), None);
        }

        #[test]
        fn never_panics(s in ".*") {
            let _ = parse_count(&s);
        }
    }
}
