use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::MergeError;
use crate::wrangle::DEFAULT_TIMESTAMP_FORMAT;

/// Default config file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "metricmerge.toml";

/// How the known-keys set evolves during one merge run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyTracking {
    /// Keys are read from the output once, before the first chunk.
    #[default]
    Snapshot,
    /// Keys appended by each chunk are also skipped by later chunks.
    Rolling,
}

/// Settings consumed by the merge engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConfig {
    pub delimiter: u8,
    pub chunk_size: usize,
    pub timestamp_format: String,
    pub key_tracking: KeyTracking,
    pub lock_timeout: Duration,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            delimiter: b';',
            chunk_size: default_chunk_size(),
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
            key_tracking: KeyTracking::default(),
            lock_timeout: Duration::from_millis(default_lock_timeout_ms()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub csv: CsvConfig,
    #[serde(default)]
    pub merge: MergeSection,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvConfig {
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            timestamp_format: default_timestamp_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSection {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub key_tracking: KeyTracking,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for MergeSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            key_tracking: KeyTracking::default(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Coarse-merged input fed to the merge engine.
    #[serde(default = "default_working_input")]
    pub working_input: PathBuf,
    /// Canonical, append-only output.
    #[serde(default = "default_canonical_output")]
    pub canonical_output: PathBuf,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    #[serde(default = "default_processed_registry")]
    pub processed_registry: PathBuf,
    #[serde(default = "default_token_cache")]
    pub token_cache: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            working_input: default_working_input(),
            canonical_output: default_canonical_output(),
            staging_dir: default_staging_dir(),
            processed_registry: default_processed_registry(),
            token_cache: default_token_cache(),
        }
    }
}

/// Log level and optional log file, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level for `metricmerge` targets (`error` .. `trace`).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file written alongside stderr.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Force debug level.
    #[serde(default)]
    pub debug: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            path: None,
            debug: false,
        }
    }
}

impl LoggingConfig {
    /// Check that `level` names a tracing level.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::Config`] for an unknown level.
    pub fn validate(&self) -> Result<(), MergeError> {
        self.level
            .parse::<tracing::Level>()
            .map(|_| ())
            .map_err(|_| {
                MergeError::Config(format!(
                    "logging.level must be one of error, warn, info, debug, trace; got {:?}",
                    self.level
                ))
            })
    }
}

/// Parse a boolean environment value the way `.env` files spell them.
fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "y" | "t" => Ok(true),
        "0" | "false" | "no" | "off" | "n" | "f" => Ok(false),
        _ => anyhow::bail!("{name} must be a boolean, got '{raw}'"),
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Remote folder listed for new exports, e.g. `/exports/instagram`.
    #[serde(default)]
    pub folder: String,
    #[serde(default)]
    pub app_key: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default)]
    pub refresh_token: String,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn presence(value: &str) -> &'static str {
            if value.is_empty() { "<unset>" } else { "<set>" }
        }

        f.debug_struct("RemoteConfig")
            .field("folder", &self.folder)
            .field("app_key", &presence(&self.app_key))
            .field("app_secret", &presence(&self.app_secret))
            .field("refresh_token", &presence(&self.refresh_token))
            .finish()
    }
}

impl AppConfig {
    /// Build the engine settings, validating delimiter and chunk size.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::Config`] when the delimiter is not a single ASCII
    /// byte or the chunk size is zero.
    pub fn merge_config(&self) -> Result<MergeConfig, MergeError> {
        let delimiter = match self.csv.delimiter.as_bytes() {
            [byte] if byte.is_ascii() => *byte,
            _ => {
                return Err(MergeError::Config(format!(
                    "csv.delimiter must be a single ASCII character, got {:?}",
                    self.csv.delimiter
                )));
            }
        };

        if self.merge.chunk_size == 0 {
            return Err(MergeError::Config(
                "merge.chunk_size must be greater than zero".to_string(),
            ));
        }

        Ok(MergeConfig {
            delimiter,
            chunk_size: self.merge.chunk_size,
            timestamp_format: self.csv.timestamp_format.clone(),
            key_tracking: self.merge.key_tracking,
            lock_timeout: Duration::from_millis(self.merge.lock_timeout_ms),
        })
    }
}

/// Load `explicit`, or `<project_root>/metricmerge.toml` when present.
///
/// A missing default file yields defaults; a missing explicit file is an error.
pub fn load_config(explicit: Option<&Path>, project_root: &Path) -> Result<AppConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = project_root.join(CONFIG_FILE_NAME);
            if !path.exists() {
                return Ok(AppConfig::default());
            }
            path
        }
    };

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<AppConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Apply environment overrides on top of file settings.
///
/// `lookup` resolves a variable name; production passes `std::env::var`.
pub fn apply_env_overrides(
    config: &mut AppConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let get = |name: &str| lookup(name).filter(|value| !value.is_empty());

    if let Some(delimiter) = get("CSV_DELIMITER") {
        config.csv.delimiter = delimiter;
    }
    if let Some(path) = get("CSV_OUTPUT_PATH") {
        config.paths.working_input = PathBuf::from(path);
    }
    if let Some(path) = get("TEMP_DOWNLOAD_PATH") {
        config.paths.staging_dir = PathBuf::from(path);
    }
    if let Some(folder) = get("PATH_DROPBOX") {
        config.remote.folder = folder;
    }
    if let Some(key) = get("DROPBOX_APP_KEY") {
        config.remote.app_key = key;
    }
    if let Some(secret) = get("DROPBOX_APP_SECRET") {
        config.remote.app_secret = secret;
    }
    if let Some(token) = get("DROPBOX_REFRESH_TOKEN") {
        config.remote.refresh_token = token;
    }
    if let Some(level) = get("LOG_LEVEL") {
        config.logging.level = level.to_lowercase();
    }
    if let Some(path) = get("LOG_PATH") {
        config.logging.path = Some(PathBuf::from(path));
    }
    if let Some(raw) = get("DEBUG") {
        config.logging.debug = parse_bool("DEBUG", &raw)?;
    }
    if let Some(raw) = get("METRICMERGE_CHUNK_SIZE") {
        config.merge.chunk_size = raw
            .trim()
            .parse()
            .with_context(|| format!("METRICMERGE_CHUNK_SIZE is not a number: '{raw}'"))?;
    }

    Ok(())
}

/// Load the file config, apply process environment overrides and validate.
pub fn resolve_config(explicit: Option<&Path>, project_root: &Path) -> Result<AppConfig> {
    let mut config = load_config(explicit, project_root)?;
    apply_env_overrides(&mut config, |name| env::var(name).ok())?;
    config.merge_config()?;
    config.logging.validate()?;
    Ok(config)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_delimiter() -> String {
    ";".to_string()
}

fn default_timestamp_format() -> String {
    DEFAULT_TIMESTAMP_FORMAT.to_string()
}

const fn default_chunk_size() -> usize {
    100_000
}

const fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_working_input() -> PathBuf {
    PathBuf::from("data/data.csv")
}

fn default_canonical_output() -> PathBuf {
    PathBuf::from("data/final_data.csv")
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("data/temp_downloads")
}

fn default_processed_registry() -> PathBuf {
    PathBuf::from("data/processed_files.txt")
}

fn default_token_cache() -> PathBuf {
    dirs::cache_dir().map_or_else(
        || PathBuf::from(".metricmerge/token.json"),
        |dir| dir.join("metricmerge/token.json"),
    )
}
