//! `metricmerge run`: the full pipeline.

use std::io::Write as _;

use anyhow::{Context as _, Result};
use clap::Args;
use metricmerge_core::MergeReport;
use metricmerge_core::config::AppConfig;
use metricmerge_core::process_csv_file;
use serde::Serialize;
use tracing::{info, warn};

use super::stage::{StageOutcome, stage_and_combine, write_outcome};
use crate::output::{OutputMode, render};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Download every CSV in the folder, ignoring the processed-files registry.
    #[arg(long)]
    pub all: bool,

    /// Records per chunk.
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Also skip keys appended by earlier chunks of this run.
    #[arg(long)]
    pub rolling: bool,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub stage: StageOutcome,
    /// `None` when there was no working input to merge.
    pub merge: Option<MergeReport>,
}

pub fn run_pipeline(args: &RunArgs, config: &AppConfig, mode: OutputMode) -> Result<()> {
    let settings = super::merge_settings(config, args.chunk_size, args.rolling)?;

    info!("starting pipeline");
    let stage = stage_and_combine(config, args.all)?;

    let input = &config.paths.working_input;
    let output = &config.paths.canonical_output;
    let merge = if input.exists() {
        Some(
            process_csv_file(input, output, &settings).with_context(|| {
                format!("merging {} into {}", input.display(), output.display())
            })?,
        )
    } else {
        warn!(input = %input.display(), "no working input yet; skipping merge");
        None
    };

    let report = RunReport { stage, merge };
    render(mode, &report, |report, w| {
        write_outcome(&report.stage, mode, w)?;
        match &report.merge {
            Some(merge) => super::merge::write_report(merge, mode, w),
            None => writeln!(w, "merge skipped: no working input"),
        }
    })
}
