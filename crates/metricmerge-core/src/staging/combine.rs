//! Coarse merge of staged exports into the working input.
//!
//! The prior working snapshot and every staged file are concatenated under the
//! union of their columns, in first-seen order. Rows are streamed, never held
//! in memory. The result replaces the working input atomically.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ErrorCode, MergeError};
use crate::table::reader::{clean_header, csv_error, is_absent_or_empty, open_csv};

/// A source that was left out of the coarse merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CombineFailure {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CombineReport {
    /// Sources whose rows made it into the working input.
    pub sources: usize,
    pub columns: Vec<String>,
    pub rows_written: u64,
    pub failed: Vec<CombineFailure>,
    /// False when there was nothing to combine and the working input was left alone.
    pub written: bool,
}

struct Source {
    path: PathBuf,
    header: Vec<String>,
}

/// Read the header and check every record of `path`.
///
/// Any failure excludes the file as a whole, so a half-readable export never
/// contributes a partial set of rows.
fn inspect(path: &Path, delimiter: u8) -> Result<Option<Source>, MergeError> {
    if is_absent_or_empty(path)? {
        return Ok(None);
    }
    let mut reader = open_csv(path, delimiter)?;
    let header: Vec<String> = reader
        .headers()
        .map_err(|err| csv_error(path, err))?
        .iter()
        .map(clean_header)
        .collect();

    let mut record = csv::StringRecord::new();
    while reader
        .read_record(&mut record)
        .map_err(|err| csv_error(path, err))?
    {
        if record.len() > header.len() {
            return Err(MergeError::Parse {
                path: path.to_path_buf(),
                record: record.position().map_or(0, csv::Position::record),
                message: format!(
                    "record has {} fields, header has {}",
                    record.len(),
                    header.len()
                ),
            });
        }
    }
    Ok(Some(Source {
        path: path.to_path_buf(),
        header,
    }))
}

/// Concatenate `working` (if present) and `staged` into `working`.
///
/// Unreadable sources are skipped and listed in the report. When no source
/// contributes, the working input is left untouched.
///
/// # Errors
///
/// Returns [`MergeError::Io`] if the combined file cannot be written or
/// renamed into place.
pub fn combine_into(
    working: &Path,
    staged: &[PathBuf],
    delimiter: u8,
) -> Result<CombineReport, MergeError> {
    let mut report = CombineReport::default();
    let mut sources = Vec::new();

    let candidates = std::iter::once(working.to_path_buf()).chain(staged.iter().cloned());
    for path in candidates {
        match inspect(&path, delimiter) {
            Ok(Some(source)) => sources.push(source),
            Ok(None) => {}
            Err(err) if err.is_recoverable() || matches!(err, MergeError::Io { .. }) => {
                warn!(
                    code = ErrorCode::MalformedRecord.code(),
                    path = %path.display(),
                    "skipping unreadable source: {err}"
                );
                report.failed.push(CombineFailure {
                    path,
                    message: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }

    if sources.is_empty() {
        warn!(working = %working.display(), "no data to combine");
        return Ok(report);
    }

    let mut columns: Vec<String> = Vec::new();
    for source in &sources {
        for name in &source.header {
            if !columns.contains(name) {
                columns.push(name.clone());
            }
        }
    }

    if let Some(parent) = working.parent() {
        fs::create_dir_all(parent).map_err(|err| MergeError::io(parent, err))?;
    }
    let tmp = working.with_extension("csv.tmp");
    let file = File::create(&tmp).map_err(|err| MergeError::io(&tmp, err))?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(file);
    writer
        .write_record(&columns)
        .map_err(|err| csv_error(&tmp, err))?;

    let mut out_row = vec![String::new(); columns.len()];
    for source in &sources {
        let positions: Vec<usize> = source
            .header
            .iter()
            .map(|name| columns.iter().position(|c| c == name).unwrap_or_default())
            .collect();

        let mut reader = open_csv(&source.path, delimiter)?;
        let mut record = csv::StringRecord::new();
        let mut rows = 0_u64;
        while reader
            .read_record(&mut record)
            .map_err(|err| csv_error(&source.path, err))?
        {
            out_row.iter_mut().for_each(String::clear);
            for (field, &target) in record.iter().zip(&positions) {
                let cell = &mut out_row[target];
                cell.clear();
                cell.push_str(field);
            }
            writer
                .write_record(&out_row)
                .map_err(|err| csv_error(&tmp, err))?;
            rows += 1;
        }
        info!(source = %source.path.display(), rows, "combined source");
        report.rows_written += rows;
    }

    writer.flush().map_err(|err| MergeError::io(&tmp, err))?;
    drop(writer);
    fs::rename(&tmp, working).map_err(|err| MergeError::io(working, err))?;

    info!(
        "combined {} sources into {} ({} rows)",
        sources.len(),
        working.display(),
        report.rows_written
    );
    report.sources = sources.len();
    report.columns = columns;
    report.written = true;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, body).expect("write fixture");
        path
    }

    #[test]
    fn columns_are_unioned_in_first_seen_order() {
        let dir = TempDir::new().expect("tempdir");
        let working = write(&dir, "data.csv", "post_id;post_likes\np1;1\n");
        let staged = vec![
            write(&dir, "a.csv", "\u{feff}post_id;followers\np2;10\n"),
            write(&dir, "b.csv", "post_likes;post_id\n3;p3\n"),
        ];

        let report = combine_into(&working, &staged, b';').expect("combine");
        assert_eq!(report.sources, 3);
        assert_eq!(report.columns, vec!["post_id", "post_likes", "followers"]);
        assert_eq!(report.rows_written, 3);

        let text = fs::read_to_string(&working).expect("read");
        assert_eq!(
            text,
            "post_id;post_likes;followers\np1;1;\np2;;10\np3;3;\n"
        );
    }

    #[test]
    fn missing_working_snapshot_is_fine() {
        let dir = TempDir::new().expect("tempdir");
        let working = dir.path().join("data").join("data.csv");
        let staged = vec![write(&dir, "a.csv", "post_id\np1\n")];

        let report = combine_into(&working, &staged, b';').expect("combine");
        assert!(report.written);
        assert!(report.failed.is_empty());
        assert_eq!(fs::read_to_string(&working).expect("read"), "post_id\np1\n");
    }

    #[test]
    fn unreadable_staged_file_is_skipped() {
        let dir = TempDir::new().expect("tempdir");
        let working = dir.path().join("data.csv");
        let staged = vec![
            write(&dir, "good.csv", "post_id;post_likes\np1;1\n"),
            write(&dir, "bad.csv", "post_id\np2;extra;fields\n"),
            dir.path().join("vanished.csv"),
        ];

        let report = combine_into(&working, &staged, b';').expect("combine");
        assert_eq!(report.sources, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].path, dir.path().join("bad.csv"));
        assert_eq!(
            fs::read_to_string(&working).expect("read"),
            "post_id;post_likes\np1;1\n"
        );
    }

    #[test]
    fn nothing_to_combine_leaves_working_alone() {
        let dir = TempDir::new().expect("tempdir");
        let working = dir.path().join("data.csv");
        let report = combine_into(&working, &[], b';').expect("combine");
        assert!(!report.written);
        assert!(!working.exists());
    }
}
