#![forbid(unsafe_code)]

mod cmd;
mod dropbox;
mod output;

use clap::{CommandFactory, Parser, Subcommand};
use metricmerge_core::config::{AppConfig, LoggingConfig, resolve_config};
use output::{CliError, OutputMode, render_error, resolve_output_mode};
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "metricmerge: incremental merge of post metric CSV exports",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Config file (defaults to ./metricmerge.toml when present).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn output_mode(&self) -> OutputMode {
        resolve_output_mode(self.json)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Stage new exports, combine them and merge into the canonical output",
        long_about = "Obtain an access token, download new or modified CSV exports from the \
                      remote folder, combine them into the working input, then merge the \
                      working input into the canonical output.",
        after_help = "EXAMPLES:\n    # Regular incremental run\n    metricmerge run\n\n    # Re-download every export, ignoring the registry\n    metricmerge run --all\n\n    # Emit machine-readable output\n    metricmerge run --json"
    )]
    Run(cmd::run::RunArgs),

    #[command(
        about = "Merge a local CSV into the canonical output",
        long_about = "Stream a local CSV in chunks, skip posts already in the output, \
                      consolidate the rest and append them.",
        after_help = "EXAMPLES:\n    # Merge the configured working input\n    metricmerge merge\n\n    # Merge explicit files with smaller chunks\n    metricmerge merge --input export.csv --output final.csv --chunk-size 5000\n\n    # Skip keys repeated across chunks of one run\n    metricmerge merge --rolling"
    )]
    Merge(cmd::merge::MergeArgs),

    #[command(
        about = "Download new exports and combine them into the working input",
        long_about = "Download new or modified CSV exports and combine them with the \
                      working input. Does not touch the canonical output.",
        after_help = "EXAMPLES:\n    # Stage what changed since the last run\n    metricmerge stage\n\n    # Stage everything\n    metricmerge stage --all"
    )]
    Stage(cmd::stage::StageArgs),

    #[command(
        about = "Obtain a Dropbox refresh token",
        long_about = "Run the offline OAuth code flow: open the printed URL, approve access, \
                      and paste the code back to receive a refresh token.",
        after_help = "EXAMPLES:\n    # Interactive flow\n    metricmerge authorize\n\n    # Code already at hand\n    metricmerge authorize --code <CODE>"
    )]
    Authorize(cmd::authorize::AuthorizeArgs),

    #[command(
        about = "Generate shell completion scripts",
        long_about = "Generate shell completion scripts for supported shells.",
        after_help = "EXAMPLES:\n    # Generate bash completions\n    metricmerge completions bash\n\n    # Generate zsh completions\n    metricmerge completions zsh"
    )]
    Completions(cmd::completions::CompletionsArgs),
}

/// Filter directives used when `METRICMERGE_LOG` is unset.
fn default_directives(verbose: bool, logging: &LoggingConfig) -> String {
    if verbose || logging.debug {
        "metricmerge=debug,info".to_string()
    } else {
        format!("metricmerge={},warn", logging.level)
    }
}

/// Open the log file for appending, creating its directory.
fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn init_tracing(verbose: bool, logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_env("METRICMERGE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose, logging)));

    let format = env::var("METRICMERGE_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let (log_file, open_error) = match logging.path.as_deref().map(open_log_file) {
        Some(Ok(file)) => (Some(file), None),
        Some(Err(err)) => (None, Some(err)),
        None => (None, None),
    };
    let file_layer =
        log_file.map(|file| fmt::layer().with_ansi(false).with_writer(Mutex::new(file)));

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(io::stderr))
                .init();
        }
    }

    if let (Some(err), Some(path)) = (open_error, logging.path.as_deref()) {
        warn!("cannot open log file {}: {err}; logging to stderr only", path.display());
    }
}

/// Resolve the config a command needs. Completions run without one.
fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    if matches!(cli.command, Commands::Completions(_)) {
        return Ok(AppConfig::default());
    }
    let project_root = env::current_dir()?;
    resolve_config(cli.config.as_deref(), &project_root)
}

fn dispatch(cli: &Cli, config: &AppConfig, output: OutputMode) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Run(args) => cmd::run::run_pipeline(args, config, output),
        Commands::Merge(args) => cmd::merge::run_merge(args, config, output),
        Commands::Stage(args) => cmd::stage::run_stage(args, config, output),
        Commands::Authorize(args) => cmd::authorize::run_authorize(args, config, output),
        Commands::Completions(args) => {
            let mut command = Cli::command();
            cmd::completions::run_completions(args.shell, &mut command)
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli);

    // A broken config still gets default logging so the error is reported.
    let logging = config
        .as_ref()
        .map(|config| config.logging.clone())
        .unwrap_or_default();
    init_tracing(cli.verbose, &logging);

    if cli.verbose {
        info!("Verbose mode enabled");
    }

    let output = cli.output_mode();
    if let Err(err) = config.and_then(|config| dispatch(&cli, &config, output)) {
        error!("{err:#}");
        render_error(output, &CliError::from(&err))?;
        std::process::exit(1);
    }
    Ok(())
}
