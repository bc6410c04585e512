//! `metricmerge stage`: download new exports and combine them into the working input.

use std::io::Write;

use anyhow::{Context as _, Result};
use clap::Args;
use metricmerge_core::config::AppConfig;
use metricmerge_core::staging::{
    CombineReport, ProcessedRegistry, RemoteFile, StageReport, Stager, TokenProvider,
    combine_into,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::dropbox::DropboxStore;
use crate::dropbox::auth::CredentialManager;
use crate::output::{OutputMode, pretty_kv, pretty_section, render};

#[derive(Args, Debug)]
pub struct StageArgs {
    /// Download every CSV in the folder, ignoring the processed-files registry.
    #[arg(long)]
    pub all: bool,
}

/// Result of staging plus coarse merge.
#[derive(Debug, Default, Serialize)]
pub struct StageOutcome {
    pub stage: StageReport,
    pub combine: CombineReport,
    pub cleaned: usize,
    pub registry_updated: bool,
}

/// Files that made it into the working input, for the registry.
fn combined_files(stage: &StageReport, combine: &CombineReport) -> Vec<RemoteFile> {
    stage
        .staged
        .iter()
        .zip(&stage.fetched)
        .filter(|(path, _)| !combine.failed.iter().any(|failed| failed.path == **path))
        .map(|(_, file)| file.clone())
        .collect()
}

/// Token, stage, coarse merge, cleanup, registry update.
///
/// A missing token aborts before any file is touched.
pub fn stage_and_combine(config: &AppConfig, all: bool) -> Result<StageOutcome> {
    anyhow::ensure!(
        !config.remote.folder.is_empty(),
        "no remote folder configured; set remote.folder or PATH_DROPBOX"
    );
    let settings = config.merge_config()?;

    let credentials = CredentialManager::new(&config.remote, &config.paths.token_cache);
    let token = credentials
        .get_valid_token()
        .context("obtaining Dropbox access token")?;
    let store = DropboxStore::new(token);

    let registry_path = &config.paths.processed_registry;
    let mut registry = ProcessedRegistry::load(registry_path)?;
    let stager = Stager::new(&config.paths.staging_dir);

    let mut outcome = StageOutcome {
        stage: stager.stage(&store, &config.remote.folder, (!all).then_some(&registry))?,
        ..StageOutcome::default()
    };

    if outcome.stage.staged.is_empty() {
        info!("no new or modified files found");
        return Ok(outcome);
    }

    let staged = stager.staged_files()?;
    let combined = combine_into(&config.paths.working_input, &staged, settings.delimiter);
    outcome.cleaned = stager.stage_cleanup();
    outcome.combine = combined.context("combining staged files")?;

    let recorded = combined_files(&outcome.stage, &outcome.combine);
    if recorded.is_empty() {
        warn!("no staged file could be combined; registry left unchanged");
    } else {
        registry.record(&recorded);
        registry.save(registry_path)?;
        outcome.registry_updated = true;
    }
    Ok(outcome)
}

pub fn run_stage(args: &StageArgs, config: &AppConfig, mode: OutputMode) -> Result<()> {
    let outcome = stage_and_combine(config, args.all)?;
    render(mode, &outcome, |outcome, w| write_outcome(outcome, mode, w))
}

/// Human rendering of a stage outcome, shared with `metricmerge run`.
pub fn write_outcome(
    outcome: &StageOutcome,
    mode: OutputMode,
    w: &mut dyn Write,
) -> std::io::Result<()> {
    if mode == OutputMode::Text {
        writeln!(
            w,
            "listed={} unchanged={} downloaded={} rows_combined={} registry_updated={}",
            outcome.stage.listed,
            outcome.stage.unchanged,
            outcome.stage.staged.len(),
            outcome.combine.rows_written,
            outcome.registry_updated
        )?;
    } else {
        pretty_section(w, "Stage")?;
        pretty_kv(w, "CSV files listed", outcome.stage.listed.to_string())?;
        pretty_kv(w, "Unchanged", outcome.stage.unchanged.to_string())?;
        pretty_kv(w, "Downloaded", outcome.stage.staged.len().to_string())?;
        pretty_kv(w, "Rows combined", outcome.combine.rows_written.to_string())?;
    }
    for failure in &outcome.stage.failures {
        writeln!(w, "download failed: {}: {}", failure.path, failure.message)?;
    }
    for failure in &outcome.combine.failed {
        writeln!(w, "not combined: {}: {}", failure.path.display(), failure.message)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use metricmerge_core::staging::combine::CombineFailure;
    use std::path::PathBuf;

    fn remote(name: &str) -> RemoteFile {
        RemoteFile {
            path: format!("/exports/{name}"),
            name: name.into(),
            rev: "1".into(),
        }
    }

    #[test]
    fn files_that_failed_to_combine_are_not_recorded() {
        let stage = StageReport {
            staged: vec![PathBuf::from("s/a.csv"), PathBuf::from("s/b.csv")],
            fetched: vec![remote("a.csv"), remote("b.csv")],
            ..StageReport::default()
        };
        let combine = CombineReport {
            failed: vec![CombineFailure {
                path: PathBuf::from("s/b.csv"),
                message: "bad".into(),
            }],
            ..CombineReport::default()
        };
        assert_eq!(combined_files(&stage, &combine), vec![remote("a.csv")]);
    }

    fn outcome_with_failure() -> StageOutcome {
        StageOutcome {
            stage: StageReport {
                listed: 3,
                unchanged: 1,
                staged: vec![PathBuf::from("s/a.csv"), PathBuf::from("s/b.csv")],
                fetched: vec![remote("a.csv"), remote("b.csv")],
                ..StageReport::default()
            },
            combine: CombineReport {
                rows_written: 40,
                failed: vec![CombineFailure {
                    path: PathBuf::from("s/b.csv"),
                    message: "bad".into(),
                }],
                ..CombineReport::default()
            },
            cleaned: 2,
            registry_updated: true,
        }
    }

    #[test]
    fn text_outcome_is_one_line_plus_failures() {
        let mut buf = Vec::new();
        write_outcome(&outcome_with_failure(), OutputMode::Text, &mut buf).expect("write");
        let text = String::from_utf8(buf).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "listed=3 unchanged=1 downloaded=2 rows_combined=40 registry_updated=true"
        );
        assert_eq!(lines[1], "not combined: s/b.csv: bad");
    }

    #[test]
    fn pretty_outcome_has_section() {
        let mut buf = Vec::new();
        write_outcome(&outcome_with_failure(), OutputMode::Pretty, &mut buf).expect("write");
        let text = String::from_utf8(buf).expect("utf8");
        assert!(text.starts_with("Stage\n"));
        assert!(text.contains("Rows combined:"));
        assert!(!text.contains("listed="));
    }

    #[test]
    fn empty_folder_is_rejected_before_network() {
        let config = AppConfig::default();
        let err = stage_and_combine(&config, false).expect_err("folder unset");
        assert!(err.to_string().contains("PATH_DROPBOX"));
    }
}
