//! `metricmerge merge`: run the merge engine on a local file.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;
use metricmerge_core::MergeReport;
use metricmerge_core::config::AppConfig;
use metricmerge_core::process_csv_file;

use crate::output::{OutputMode, pretty_kv, pretty_section, render};

#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Input CSV (defaults to `paths.working_input`).
    #[arg(long, short)]
    pub input: Option<PathBuf>,

    /// Canonical output CSV (defaults to `paths.canonical_output`).
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Records per chunk.
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Also skip keys appended by earlier chunks of this run.
    #[arg(long)]
    pub rolling: bool,
}

pub fn run_merge(args: &MergeArgs, config: &AppConfig, mode: OutputMode) -> Result<()> {
    let settings = super::merge_settings(config, args.chunk_size, args.rolling)?;
    let input = args.input.as_ref().unwrap_or(&config.paths.working_input);
    let output = args.output.as_ref().unwrap_or(&config.paths.canonical_output);

    let report = process_csv_file(input, output, &settings)
        .with_context(|| format!("merging {} into {}", input.display(), output.display()))?;
    render(mode, &report, |report, w| write_report(report, mode, w))
}

/// Human rendering of a merge report, shared with `metricmerge run`.
pub fn write_report(report: &MergeReport, mode: OutputMode, w: &mut dyn Write) -> io::Result<()> {
    let size = report
        .output_megabytes()
        .map_or_else(|| "-".to_string(), |mb| format!("{mb:.2} MB"));

    if mode == OutputMode::Text {
        writeln!(
            w,
            "rows_read={} rows_written={} rows_filtered_known={} chunks_skipped={} output_size={size}",
            report.rows_read, report.rows_written, report.rows_filtered_known, report.chunks_skipped
        )?;
    } else {
        pretty_section(w, "Merge")?;
        if report.recovered_bytes > 0 {
            pretty_kv(w, "Recovered bytes", report.recovered_bytes.to_string())?;
        }
        pretty_kv(w, "Known keys", report.known_keys.to_string())?;
        pretty_kv(w, "Chunks", report.chunks_read.to_string())?;
        pretty_kv(w, "Rows read", report.rows_read.to_string())?;
        pretty_kv(w, "Already known", report.rows_filtered_known.to_string())?;
        pretty_kv(w, "Empty post_id", report.rows_dropped_empty_key.to_string())?;
        pretty_kv(w, "Rows written", report.rows_written.to_string())?;
        pretty_kv(w, "Output size", size)?;
    }

    for failure in &report.failures {
        writeln!(
            w,
            "skipped chunk {} (records {}..{}): {}",
            failure.chunk_index,
            failure.first_record,
            failure.first_record + failure.records.saturating_sub(1),
            failure.message
        )?;
    }
    if report.integrity_warning {
        writeln!(w, "warning: rows were written but the output file is missing")?;
    }
    Ok(())
}
