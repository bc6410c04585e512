//! Chunked incremental merge into the canonical output.
//!
//! A run moves through these states:
//!
//! ```text
//! Idle -> ReadingKnownKeys
//!      -> { StreamingChunk -> FilteringKnownKeys -> Consolidating -> Appending }*
//!      -> Verifying -> Done
//! ```
//!
//! Any fatal error moves the engine to `Failed`. Chunks already appended are
//! never rolled back; a rerun re-derives the known keys from whatever the
//! output holds, so an interrupted run is safe to resume.
//!
//! Before reading keys, an append cut short by a crash is truncated away, so
//! the output never carries part of a chunk into the next run.
//!
//! Re-ingestion is idempotent by key: rows whose `post_id` already appears in
//! the output are skipped, whatever their timestamp.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{KeyTracking, MergeConfig};
use crate::error::{ErrorCode, MergeError};
use crate::lock::OutputLock;
use crate::table::reader::{ChunkFailure, ChunkRead, ChunkReader, is_absent_or_empty, read_key_column};
use crate::table::writer::{AppendWriter, recover_interrupted_append};
use crate::table::{POST_EXTRACTED_DATETIME, POST_ID, key_text};
use crate::wrangle::consolidate;

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    Idle,
    ReadingKnownKeys,
    StreamingChunk,
    FilteringKnownKeys,
    Consolidating,
    Appending,
    Verifying,
    Done,
    Failed,
}

/// Summary of one merge run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeReport {
    /// Bytes of an interrupted earlier append removed before the run.
    pub recovered_bytes: u64,
    /// Keys present in the output before the run.
    pub known_keys: usize,
    pub chunks_read: usize,
    pub chunks_skipped: usize,
    pub failures: Vec<ChunkFailure>,
    pub rows_read: u64,
    pub rows_filtered_known: u64,
    pub rows_dropped_empty_key: u64,
    pub rows_written: u64,
    /// Output size after the run, if the file exists.
    pub output_bytes: Option<u64>,
    /// Rows were written but the output file is missing afterwards.
    pub integrity_warning: bool,
}

impl MergeReport {
    /// Output size in megabytes, for logs and human output.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn output_megabytes(&self) -> Option<f64> {
        self.output_bytes.map(|bytes| bytes as f64 / 1024.0 / 1024.0)
    }
}

/// Drives one input file into the canonical output.
#[derive(Debug)]
pub struct MergeEngine {
    config: MergeConfig,
    state: MergeState,
}

impl MergeEngine {
    #[must_use]
    pub const fn new(config: MergeConfig) -> Self {
        Self {
            config,
            state: MergeState::Idle,
        }
    }

    #[must_use]
    pub const fn state(&self) -> MergeState {
        self.state
    }

    #[must_use]
    pub const fn config(&self) -> &MergeConfig {
        &self.config
    }

    fn transition(&mut self, next: MergeState) {
        debug!(from = ?self.state, to = ?next, "merge state");
        self.state = next;
    }

    /// Merge `input` into `output`.
    ///
    /// Holds the output's advisory lock for the whole run.
    ///
    /// # Errors
    ///
    /// Returns a fatal [`MergeError`]: I/O failures, lock contention, or a
    /// structural problem such as a missing `post_id` column. Per-chunk parse
    /// failures are not errors; they are listed in the report.
    pub fn run(&mut self, input: &Path, output: &Path) -> Result<MergeReport, MergeError> {
        info!("processing input file: {}", input.display());
        info!("output will be written to: {}", output.display());

        match self.run_inner(input, output) {
            Ok(report) => {
                self.transition(MergeState::Done);
                info!(
                    rows_written = report.rows_written,
                    chunks_skipped = report.chunks_skipped,
                    "merge finished: {} records written",
                    report.rows_written
                );
                Ok(report)
            }
            Err(err) => {
                self.transition(MergeState::Failed);
                error!(
                    code = err.code().code(),
                    input = %input.display(),
                    output = %output.display(),
                    "merge failed: {err}"
                );
                Err(err)
            }
        }
    }

    fn run_inner(&mut self, input: &Path, output: &Path) -> Result<MergeReport, MergeError> {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).map_err(|err| MergeError::io(parent, err))?;
        }
        let _lock = OutputLock::for_output(output, self.config.lock_timeout)?;

        let mut report = MergeReport::default();

        self.transition(MergeState::ReadingKnownKeys);
        report.recovered_bytes = recover_interrupted_append(output)?;
        let mut known = read_key_column(output, self.config.delimiter, POST_ID)?;
        report.known_keys = known.len();
        if !known.is_empty() {
            info!("found {} existing post_ids", known.len());
        }

        if is_absent_or_empty(input)? {
            if !input.exists() {
                return Err(MergeError::io(
                    input,
                    io::Error::new(io::ErrorKind::NotFound, "input file not found"),
                ));
            }
            warn!(input = %input.display(), "input file is empty; nothing to merge");
            self.verify(output, &mut report)?;
            return Ok(report);
        }

        let mut chunks = ChunkReader::open(input, self.config.delimiter, self.config.chunk_size)?;
        chunks.require_columns(&[POST_ID, POST_EXTRACTED_DATETIME])?;
        let mut writer = AppendWriter::new(output, self.config.delimiter)?;

        loop {
            self.transition(MergeState::StreamingChunk);
            let Some(read) = chunks.next() else {
                break;
            };

            let mut chunk = match read? {
                ChunkRead::Ready(chunk) => chunk,
                ChunkRead::Skipped(failure) => {
                    warn!(
                        code = ErrorCode::MalformedRecord.code(),
                        input = %input.display(),
                        chunk = failure.chunk_index,
                        first_record = failure.first_record,
                        "skipping malformed chunk: {}",
                        failure.message
                    );
                    report.chunks_read += 1;
                    report.chunks_skipped += 1;
                    report.failures.push(failure);
                    continue;
                }
            };
            report.chunks_read += 1;

            self.transition(MergeState::FilteringKnownKeys);
            if !known.is_empty() {
                let key_index = chunk.table.require_column(POST_ID, "input chunk")?;
                let before = chunk.table.len();
                chunk
                    .table
                    .retain_rows(|row| key_text(&row[key_index]).is_none_or(|key| !known.contains(key)));
                report.rows_filtered_known += (before - chunk.table.len()) as u64;
            }

            if chunk.table.is_empty() {
                debug!(chunk = chunk.index, "chunk holds only known keys");
                continue;
            }

            self.transition(MergeState::Consolidating);
            let consolidated = consolidate(&chunk.table, &self.config.timestamp_format)?;
            report.rows_dropped_empty_key += consolidated.dropped_empty_keys as u64;

            self.transition(MergeState::Appending);
            let written = writer.append(&consolidated.table)?;
            report.rows_written += written as u64;
            info!("processed {} records so far", report.rows_written);

            if self.config.key_tracking == KeyTracking::Rolling {
                remember_keys(&mut known, &consolidated.table);
            }
        }

        report.rows_read = chunks.records_read();
        self.verify(output, &mut report)?;
        Ok(report)
    }

    fn verify(&mut self, output: &Path, report: &mut MergeReport) -> Result<(), MergeError> {
        self.transition(MergeState::Verifying);
        match fs::metadata(output) {
            Ok(meta) => {
                report.output_bytes = Some(meta.len());
                info!(
                    "output file ready. size: {:.2} MB",
                    report.output_megabytes().unwrap_or_default()
                );
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if report.rows_written > 0 {
                    report.integrity_warning = true;
                    error!(
                        code = ErrorCode::OutputMissing.code(),
                        output = %output.display(),
                        rows_written = report.rows_written,
                        "output file was not created"
                    );
                } else {
                    info!(output = %output.display(), "no new records; output not created");
                }
            }
            Err(err) => return Err(MergeError::io(output, err)),
        }
        Ok(())
    }
}

fn remember_keys(known: &mut HashSet<String>, table: &crate::table::Table) {
    if let Some(key_index) = table.column_index(POST_ID) {
        known.extend(table.keys(key_index).map(ToString::to_string));
    }
}

/// Merge `input` into `output` with a fresh engine.
///
/// # Errors
///
/// See [`MergeEngine::run`].
pub fn process_csv_file(
    input: &Path,
    output: &Path,
    config: &MergeConfig,
) -> Result<MergeReport, MergeError> {
    MergeEngine::new(config.clone()).run(input, output)
}
