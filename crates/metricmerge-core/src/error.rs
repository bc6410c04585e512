use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::lock::LockError;

/// Machine-readable error codes for operators and scripted callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    CredentialUnavailable,
    MalformedRecord,
    MissingColumn,
    ConsolidationInvariant,
    SourceUnavailable,
    OutputWriteFailed,
    LockContention,
    OutputMissing,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1002",
            Self::CredentialUnavailable => "E1003",
            Self::MalformedRecord => "E2001",
            Self::MissingColumn => "E3001",
            Self::ConsolidationInvariant => "E3002",
            Self::SourceUnavailable => "E4001",
            Self::OutputWriteFailed => "E5001",
            Self::LockContention => "E5002",
            Self::OutputMissing => "E6001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::CredentialUnavailable => "No valid access token",
            Self::MalformedRecord => "Malformed CSV record",
            Self::MissingColumn => "Required column missing",
            Self::ConsolidationInvariant => "Consolidation invariant violated",
            Self::SourceUnavailable => "Remote source unavailable",
            Self::OutputWriteFailed => "Output file write failed",
            Self::LockContention => "Lock contention",
            Self::OutputMissing => "Output file missing after run",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in metricmerge.toml and retry."),
            Self::CredentialUnavailable => Some(
                "Check DROPBOX_APP_KEY, DROPBOX_APP_SECRET and DROPBOX_REFRESH_TOKEN, \
                 or run `metricmerge authorize`.",
            ),
            Self::MalformedRecord => None,
            Self::MissingColumn => {
                Some("Input files must carry post_id and post_extracted_datetime headers.")
            }
            Self::ConsolidationInvariant => {
                Some("Retry once. If persistent, report a bug with the offending chunk.")
            }
            Self::SourceUnavailable => Some("The file is retried on the next run."),
            Self::OutputWriteFailed => Some("Check disk space and write permissions."),
            Self::LockContention => {
                Some("Retry after the other `metricmerge` process releases its lock.")
            }
            Self::OutputMissing => Some("Inspect the output directory and the run log."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors that make a batch unprocessable.
#[derive(Debug, thiserror::Error)]
pub enum StructuralError {
    /// A column the pipeline depends on is absent.
    #[error("required column '{column}' missing from {context}")]
    MissingColumn { column: String, context: String },

    /// Consolidation produced output that breaks its own guarantees.
    #[error("consolidation invariant violated: {0}")]
    Invariant(String),
}

impl StructuralError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::MissingColumn { .. } => ErrorCode::MissingColumn,
            Self::Invariant(_) => ErrorCode::ConsolidationInvariant,
        }
    }
}

/// Pipeline error taxonomy.
///
/// `TransientSource` and `Parse` are recoverable per item: callers log them,
/// skip the file or chunk, and keep going. Everything else aborts the run.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("remote source unavailable for {target}: {message}")]
    TransientSource { target: String, message: String },

    #[error("malformed CSV in {} near record {record}: {message}", path.display())]
    Parse {
        path: PathBuf,
        record: u64,
        message: String,
    },

    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error("no valid access token: {0}")]
    Credential(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl MergeError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn source_unavailable(target: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::TransientSource {
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::TransientSource { .. } => ErrorCode::SourceUnavailable,
            Self::Parse { .. } => ErrorCode::MalformedRecord,
            Self::Structural(inner) => inner.code(),
            Self::Credential(_) => ErrorCode::CredentialUnavailable,
            Self::Config(_) => ErrorCode::ConfigParseError,
            Self::Io { .. } => ErrorCode::OutputWriteFailed,
            Self::Lock(inner) => inner.code(),
        }
    }

    /// Whether the pipeline may skip the offending item and continue.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::TransientSource { .. } | Self::Parse { .. })
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}
