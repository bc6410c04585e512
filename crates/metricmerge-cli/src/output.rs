//! Shared output layer for pretty/text/JSON parity across CLI commands.
//!
//! # Output mode resolution
//!
//! Precedence (highest wins):
//! 1. `--json` flag
//! 2. `FORMAT` env var: `"pretty"` | `"text"` | `"json"`
//! 3. Default: [`OutputMode::Pretty`] if stdout is a TTY; [`OutputMode::Text`] if piped.

use metricmerge_core::MergeError;
use serde::Serialize;
use std::io::{self, IsTerminal, Write};

/// Shared width for human pretty separators.
pub const PRETTY_RULE_WIDTH: usize = 60;

pub fn pretty_rule(w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, "{:-<width$}", "", width = PRETTY_RULE_WIDTH)
}

/// Write a section heading followed by a separator.
pub fn pretty_section(w: &mut dyn Write, heading: &str) -> io::Result<()> {
    writeln!(w, "{heading}")?;
    pretty_rule(w)
}

/// Render a left-aligned key/value line in human output.
pub fn pretty_kv(w: &mut dyn Write, key: &str, value: impl AsRef<str>) -> io::Result<()> {
    writeln!(w, "{:<20} {}", format!("{key}:"), value.as_ref())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Sections and aligned key/value lines.
    Pretty,
    /// One `key=value` line per field, for pipes and scripts.
    Text,
    Json,
}

fn resolve_output_mode_inner(json_flag: bool, format_env: Option<&str>, is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    if let Some(val) = format_env {
        match val.to_lowercase().as_str() {
            "json" => return OutputMode::Json,
            "text" => return OutputMode::Text,
            "pretty" => return OutputMode::Pretty,
            _ => {}
        }
    }

    if is_tty {
        OutputMode::Pretty
    } else {
        OutputMode::Text
    }
}

/// Resolve the output mode from the `--json` flag, `FORMAT`, and the TTY default.
pub fn resolve_output_mode(json_flag: bool) -> OutputMode {
    let env_val = std::env::var("FORMAT").ok();
    let is_tty = io::stdout().is_terminal();
    resolve_output_mode_inner(json_flag, env_val.as_deref(), is_tty)
}

/// A structured error with optional suggestion and error code.
#[derive(Debug, Serialize)]
pub struct CliError {
    pub message: String,
    /// Short description of the error class behind `error_code`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Machine-readable error code (e.g. "E5002").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl CliError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            summary: None,
            suggestion: None,
            error_code: None,
        }
    }
}

impl From<&MergeError> for CliError {
    fn from(err: &MergeError) -> Self {
        Self {
            message: err.to_string(),
            summary: Some(err.code().message().to_string()),
            suggestion: err.hint().map(ToString::to_string),
            error_code: Some(err.code().code().to_string()),
        }
    }
}

impl From<&anyhow::Error> for CliError {
    fn from(err: &anyhow::Error) -> Self {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<MergeError>())
            .map_or_else(|| Self::new(format!("{err:#}")), |merge| {
                let mut cli = Self::from(merge);
                cli.message = format!("{err:#}");
                cli
            })
    }
}

/// Render a serializable value to stdout in the requested format.
///
/// In JSON mode the value is serialized with `serde_json`; otherwise
/// `human_fn` writes the output.
pub fn render<T: Serialize>(
    mode: OutputMode,
    value: &T,
    human_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match mode {
        OutputMode::Json => {
            serde_json::to_writer_pretty(&mut out, value)?;
            writeln!(out)?;
        }
        OutputMode::Pretty | OutputMode::Text => {
            human_fn(value, &mut out)?;
        }
    }
    Ok(())
}

/// Render an error to stderr in the requested format.
pub fn render_error(mode: OutputMode, error: &CliError) -> anyhow::Result<()> {
    let stderr = io::stderr();
    let mut out = stderr.lock();
    write_error(mode, error, &mut out)
}

fn write_error(mode: OutputMode, error: &CliError, out: &mut dyn Write) -> anyhow::Result<()> {
    match mode {
        OutputMode::Json => {
            let wrapper = serde_json::json!({
                "error": error,
            });
            serde_json::to_writer_pretty(&mut *out, &wrapper)?;
            writeln!(out)?;
        }
        OutputMode::Pretty | OutputMode::Text => {
            match (&error.error_code, &error.summary) {
                (Some(code), Some(summary)) => {
                    writeln!(out, "error[{code}] {summary}: {}", error.message)?;
                }
                (Some(code), None) => writeln!(out, "error[{code}]: {}", error.message)?,
                (None, _) => writeln!(out, "error: {}", error.message)?,
            }
            if let Some(ref suggestion) = error.suggestion {
                writeln!(out, "  suggestion: {suggestion}")?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use metricmerge_core::StructuralError;

    #[test]
    fn json_flag_wins_over_env() {
        let mode = resolve_output_mode_inner(true, Some("pretty"), true);
        assert_eq!(mode, OutputMode::Json);
    }

    #[test]
    fn format_env_is_case_insensitive() {
        assert_eq!(
            resolve_output_mode_inner(false, Some("TEXT"), true),
            OutputMode::Text
        );
        assert_eq!(
            resolve_output_mode_inner(false, Some("json"), false),
            OutputMode::Json
        );
    }

    #[test]
    fn unknown_env_falls_through_to_tty() {
        assert_eq!(
            resolve_output_mode_inner(false, Some("fancy"), true),
            OutputMode::Pretty
        );
        assert_eq!(
            resolve_output_mode_inner(false, Some("fancy"), false),
            OutputMode::Text
        );
    }

    #[test]
    fn cli_error_carries_merge_error_code() {
        let err = MergeError::Structural(StructuralError::MissingColumn {
            column: "post_id".into(),
            context: "in.csv".into(),
        });
        let cli = CliError::from(&err);
        assert!(cli.message.contains("post_id"));
        assert_eq!(cli.error_code.as_deref(), Some("E3001"));
        assert_eq!(cli.summary.as_deref(), Some("Required column missing"));
        assert!(cli.suggestion.is_some());
    }

    #[test]
    fn cli_error_finds_merge_error_behind_context() {
        let err = anyhow::Error::new(MergeError::Credential("no refresh token".into()))
            .context("obtaining access token");
        let cli = CliError::from(&err);
        assert_eq!(cli.error_code.as_deref(), Some("E1003"));
        assert!(cli.message.starts_with("obtaining access token"));
    }

    #[test]
    fn plain_anyhow_error_has_no_code() {
        let err = anyhow::anyhow!("boom");
        let cli = CliError::from(&err);
        assert_eq!(cli.message, "boom");
        assert!(cli.error_code.is_none());
        assert!(cli.summary.is_none());
    }

    #[test]
    fn human_error_includes_code_and_suggestion() {
        let err = CliError {
            message: "lock held".into(),
            summary: None,
            suggestion: Some("wait for the other run".into()),
            error_code: Some("E5002".into()),
        };
        let mut buf = Vec::new();
        write_error(OutputMode::Text, &err, &mut buf).expect("write");
        let text = String::from_utf8(buf).expect("utf8");
        assert_eq!(
            text,
            "error[E5002]: lock held\n  suggestion: wait for the other run\n"
        );
    }

    #[test]
    fn human_error_names_error_class() {
        let err = CliError::from(&MergeError::Config("chunk_size must be positive".into()));
        let mut buf = Vec::new();
        write_error(OutputMode::Pretty, &err, &mut buf).expect("write");
        let text = String::from_utf8(buf).expect("utf8");
        assert!(
            text.starts_with("error[E1002] Config file parse error: "),
            "unexpected: {text}"
        );
        assert!(text.contains("chunk_size must be positive"));
    }

    #[test]
    fn json_error_is_wrapped() {
        let err = CliError::new("bad input");
        let mut buf = Vec::new();
        write_error(OutputMode::Json, &err, &mut buf).expect("write");
        let value: serde_json::Value = serde_json::from_slice(&buf).expect("json");
        assert_eq!(value["error"]["message"], "bad input");
        assert!(value["error"].get("error_code").is_none());
    }

    #[test]
    fn render_json_output() {
        #[derive(Serialize)]
        struct TestData {
            rows: u32,
        }
        let result = render(OutputMode::Json, &TestData { rows: 3 }, |_, _| Ok(()));
        assert!(result.is_ok());
    }
}
