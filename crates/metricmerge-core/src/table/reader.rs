//! Bounded-memory CSV reading.
//!
//! [`ChunkReader`] streams a delimited file in fixed-size record chunks so a
//! multi-gigabyte export never has to be resident at once. A chunk containing
//! a malformed record is not returned as rows; it is surfaced as
//! [`ChunkRead::Skipped`] so the caller can log it and move on, mirroring how
//! the merge engine treats per-chunk parse failures as recoverable.
//!
//! [`read_key_column`] reads a single column of an existing file into a set,
//! which is how the engine derives the known-keys set from its own output.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{MergeError, StructuralError};
use crate::table::{Table, Value};

/// A run of consecutive records from the input, ready for wrangling.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Zero-based chunk position in the file.
    pub index: usize,
    /// One-based number of the first data record in this chunk.
    pub first_record: u64,
    pub table: Table,
}

/// A chunk that could not be parsed and was skipped.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub first_record: u64,
    /// Number of records consumed by the skipped chunk.
    pub records: u64,
    pub message: String,
}

/// Outcome of reading one chunk.
#[derive(Debug, Clone)]
pub enum ChunkRead {
    Ready(Chunk),
    Skipped(ChunkFailure),
}

/// Strip a UTF-8 byte-order mark and surrounding whitespace from a header name.
#[must_use]
pub fn clean_header(name: &str) -> String {
    name.trim_start_matches('\u{feff}').trim().to_string()
}

/// Open `path` as a delimited file with a header row.
///
/// Records are read flexibly: short records are padded later, long records
/// are rejected by the callers that care.
pub(crate) fn open_csv(path: &Path, delimiter: u8) -> Result<csv::Reader<File>, MergeError> {
    let file = File::open(path).map_err(|err| MergeError::io(path, err))?;
    Ok(csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(file))
}

/// Convert a `csv` error into the pipeline taxonomy.
///
/// I/O failures stay fatal; everything else is a recoverable parse error.
pub(crate) fn csv_error(path: &Path, err: csv::Error) -> MergeError {
    let record = err.position().map_or(0, csv::Position::record);
    let message = err.to_string();
    match err.into_kind() {
        csv::ErrorKind::Io(source) => MergeError::io(path, source),
        _ => MergeError::Parse {
            path: path.to_path_buf(),
            record,
            message,
        },
    }
}

/// Whether `path` is missing or has no bytes at all.
pub(crate) fn is_absent_or_empty(path: &Path) -> Result<bool, MergeError> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len() == 0),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(err) => Err(MergeError::io(path, err)),
    }
}

/// Read the header row of `path`, or `None` if the file is absent or empty.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be opened, or a parse error if the
/// header row is not valid UTF-8.
pub fn read_header(path: &Path, delimiter: u8) -> Result<Option<Vec<String>>, MergeError> {
    if is_absent_or_empty(path)? {
        return Ok(None);
    }

    let mut reader = open_csv(path, delimiter)?;
    let header = reader
        .headers()
        .map_err(|err| csv_error(path, err))?
        .iter()
        .map(clean_header)
        .collect();
    Ok(Some(header))
}

/// Read every non-empty value of `column` from `path` into a set.
///
/// Only the requested field of each record is kept, so memory grows with the
/// number of distinct keys rather than with file width. A missing or empty file
/// yields an empty set. Records that fail to parse are skipped with a warning.
///
/// # Errors
///
/// Returns [`StructuralError::MissingColumn`] if the file has a header without
/// `column`, and an I/O error if the file cannot be read.
pub fn read_key_column(
    path: &Path,
    delimiter: u8,
    column: &str,
) -> Result<HashSet<String>, MergeError> {
    let mut keys = HashSet::new();
    if is_absent_or_empty(path)? {
        return Ok(keys);
    }

    let mut reader = open_csv(path, delimiter)?;
    let position = reader
        .headers()
        .map_err(|err| csv_error(path, err))?
        .iter()
        .position(|name| clean_header(name) == column)
        .ok_or_else(|| StructuralError::MissingColumn {
            column: column.to_string(),
            context: path.display().to_string(),
        })?;

    let mut skipped = 0_u64;
    for record in reader.byte_records() {
        match record {
            Ok(record) => {
                let Some(raw) = record.get(position) else {
                    continue;
                };
                match std::str::from_utf8(raw) {
                    Ok(key) if !key.trim().is_empty() => {
                        keys.insert(key.to_string());
                    }
                    Ok(_) => {}
                    Err(_) => skipped += 1,
                }
            }
            Err(err) if err.is_io_error() => return Err(csv_error(path, err)),
            Err(_) => skipped += 1,
        }
    }

    if skipped > 0 {
        warn!(
            path = %path.display(),
            skipped,
            "skipped unreadable records while collecting {column}"
        );
    }
    debug!(path = %path.display(), keys = keys.len(), "collected {column} values");
    Ok(keys)
}

/// Streams a delimited file as a sequence of [`ChunkRead`]s.
pub struct ChunkReader {
    path: PathBuf,
    reader: csv::Reader<File>,
    columns: Vec<String>,
    chunk_size: usize,
    next_index: usize,
    records_read: u64,
    finished: bool,
}

impl ChunkReader {
    /// Open `path` and read its header row.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened, or a parse error if
    /// the header row is unreadable.
    pub fn open(path: &Path, delimiter: u8, chunk_size: usize) -> Result<Self, MergeError> {
        let mut reader = open_csv(path, delimiter)?;
        let columns = reader
            .headers()
            .map_err(|err| csv_error(path, err))?
            .iter()
            .map(clean_header)
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            columns,
            chunk_size: chunk_size.max(1),
            next_index: 0,
            records_read: 0,
            finished: false,
        })
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Data records consumed so far, including those in skipped chunks.
    #[must_use]
    pub const fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Fail fast if the header lacks any of `names`.
    ///
    /// # Errors
    ///
    /// Returns the first missing column as [`StructuralError::MissingColumn`].
    pub fn require_columns(&self, names: &[&str]) -> Result<(), StructuralError> {
        for name in names {
            if !self.columns.iter().any(|column| column == name) {
                return Err(StructuralError::MissingColumn {
                    column: (*name).to_string(),
                    context: self.path.display().to_string(),
                });
            }
        }
        Ok(())
    }

    fn read_chunk(&mut self) -> Result<Option<ChunkRead>, MergeError> {
        let mut table = Table::new(self.columns.clone());
        let first_record = self.records_read + 1;
        let mut consumed = 0_u64;
        let mut failure: Option<String> = None;
        let mut record = csv::StringRecord::new();

        while consumed < self.chunk_size as u64 {
            match self.reader.read_record(&mut record) {
                Ok(true) => {
                    self.records_read += 1;
                    consumed += 1;
                    if failure.is_some() {
                        continue;
                    }
                    if record.len() > self.columns.len() {
                        failure = Some(format!(
                            "record {} has {} fields, header has {}",
                            self.records_read,
                            record.len(),
                            self.columns.len()
                        ));
                        continue;
                    }
                    table.push_row(record.iter().map(Value::from_raw).collect());
                }
                Ok(false) => {
                    self.finished = true;
                    break;
                }
                Err(err) if err.is_io_error() => return Err(csv_error(&self.path, err)),
                Err(err) => {
                    self.records_read += 1;
                    consumed += 1;
                    failure.get_or_insert_with(|| {
                        format!("record {}: {err}", self.records_read)
                    });
                }
            }
        }

        if consumed == 0 {
            self.finished = true;
            return Ok(None);
        }

        let index = self.next_index;
        self.next_index += 1;

        Ok(Some(match failure {
            Some(message) => ChunkRead::Skipped(ChunkFailure {
                chunk_index: index,
                first_record,
                records: consumed,
                message,
            }),
            None => ChunkRead::Ready(Chunk {
                index,
                first_record,
                table,
            }),
        }))
    }
}

impl Iterator for ChunkReader {
    type Item = Result<ChunkRead, MergeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let result = self.read_chunk();
        if result.is_err() {
            self.finished = true;
        }
        result.transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).expect("fixture must be written");
        path
    }

    fn collect(reader: ChunkReader) -> Vec<ChunkRead> {
        reader
            .collect::<Result<Vec<_>, _>>()
            .expect("no fatal errors")
    }

    #[test]
    fn splits_records_into_chunks() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(
            &dir,
            "in.csv",
            b"post_id;post_likes\np1;1\np2;2\np3;3\np4;4\np5;5\n",
        );
        let reader = ChunkReader::open(&path, b';', 2).expect("open");
        let chunks = collect(reader);
        assert_eq!(chunks.len(), 3);

        let sizes: Vec<usize> = chunks
            .iter()
            .map(|chunk| match chunk {
                ChunkRead::Ready(c) => c.table.len(),
                ChunkRead::Skipped(_) => 0,
            })
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        let ChunkRead::Ready(last) = &chunks[2] else {
            panic!("last chunk must be readable");
        };
        assert_eq!(last.index, 2);
        assert_eq!(last.first_record, 5);
    }

    #[test]
    fn strips_byte_order_mark_from_header() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(&dir, "bom.csv", "\u{feff}post_id;x\np1;1\n".as_bytes());
        let reader = ChunkReader::open(&path, b';', 10).expect("open");
        assert_eq!(reader.columns()[0], "post_id");
        assert!(reader.require_columns(&["post_id"]).is_ok());
    }

    #[test]
    fn overlong_record_skips_only_its_chunk() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(&dir, "bad.csv", b"post_id;x\np1;1\np2;2;extra\np3;3\np4;4\n");
        let reader = ChunkReader::open(&path, b';', 2).expect("open");
        let chunks = collect(reader);
        assert_eq!(chunks.len(), 2);
        assert!(matches!(
            &chunks[0],
            ChunkRead::Skipped(ChunkFailure { chunk_index: 0, first_record: 1, records: 2, .. })
        ));
        assert!(matches!(&chunks[1], ChunkRead::Ready(c) if c.table.len() == 2));
    }

    #[test]
    fn short_records_are_padded_with_nulls() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(&dir, "short.csv", b"post_id;x;y\np1;1\n");
        let reader = ChunkReader::open(&path, b';', 10).expect("open");
        let chunks = collect(reader);
        let ChunkRead::Ready(chunk) = &chunks[0] else {
            panic!("chunk must be readable");
        };
        assert_eq!(chunk.table.rows()[0][2], Value::Null);
    }

    #[test]
    fn invalid_utf8_is_a_recoverable_failure() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(&dir, "utf8.csv", b"post_id;x\np1;\xff\xfe\np2;2\n");
        let reader = ChunkReader::open(&path, b';', 1).expect("open");
        let chunks = collect(reader);
        assert!(matches!(&chunks[0], ChunkRead::Skipped(_)));
        assert!(matches!(&chunks[1], ChunkRead::Ready(_)));
    }

    #[test]
    fn missing_required_column_is_structural() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(&dir, "cols.csv", b"id;x\n1;2\n");
        let reader = ChunkReader::open(&path, b';', 10).expect("open");
        let err = reader
            .require_columns(&["post_id"])
            .expect_err("post_id is missing");
        assert!(matches!(err, StructuralError::MissingColumn { column, .. } if column == "post_id"));
    }

    #[test]
    fn key_column_reads_distinct_values() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(&dir, "out.csv", b"post_id;x\np1;1\np1;2\np2;3\n;4\n");
        let keys = read_key_column(&path, b';', "post_id").expect("read keys");
        assert_eq!(keys.len(), 2);
        assert!(keys.contains("p1"));
        assert!(keys.contains("p2"));
    }

    #[test]
    fn key_column_of_missing_file_is_empty() {
        let dir = TempDir::new().expect("tempdir");
        let keys = read_key_column(&dir.path().join("absent.csv"), b';', "post_id")
            .expect("missing file is not an error");
        assert!(keys.is_empty());
    }

    #[test]
    fn key_column_requires_header() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(&dir, "out.csv", b"id;x\n1;2\n");
        let err = read_key_column(&path, b';', "post_id").expect_err("header lacks post_id");
        assert!(matches!(err, MergeError::Structural(_)));
    }

    #[test]
    fn header_of_empty_file_is_none() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(&dir, "empty.csv", b"");
        assert_eq!(read_header(&path, b';').expect("read"), None);
    }
}
