//! Download staging: remote listing, local staging dir, coarse merge.
//!
//! The remote side is abstracted behind [`RemoteStore`] and [`TokenProvider`]
//! so the pipeline can run against any backend (the CLI ships a Dropbox one)
//! and against in-memory fakes in tests.

pub mod combine;
pub mod registry;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ErrorCode, MergeError};

pub use combine::{CombineReport, combine_into};
pub use registry::ProcessedRegistry;

/// One file entry in a remote listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Lower-cased remote path; the registry key.
    pub path: String,
    pub name: String,
    /// Opaque revision identifier; changes when the remote file changes.
    pub rev: String,
}

/// A remote folder of CSV exports.
pub trait RemoteStore {
    /// List the files directly under `folder`.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::TransientSource`] when the listing cannot be read.
    fn list(&self, folder: &str) -> Result<Vec<RemoteFile>, MergeError>;

    /// Download `file` to `dest`.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::TransientSource`] on a failed transfer, or
    /// [`MergeError::Io`] when `dest` cannot be written.
    fn fetch(&self, file: &RemoteFile, dest: &Path) -> Result<(), MergeError>;
}

/// Source of bearer tokens for the remote store.
pub trait TokenProvider {
    /// Return a token valid for the duration of a run.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::Credential`] when no token can be obtained.
    fn get_valid_token(&self) -> Result<String, MergeError>;
}

/// Whether a remote file name looks like a CSV export.
#[must_use]
pub fn is_csv_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
}

/// A file that could not be staged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFailure {
    pub path: String,
    pub message: String,
}

/// Outcome of one staging pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    /// CSV files found in the listing.
    pub listed: usize,
    /// Files skipped because the registry already holds their revision.
    pub unchanged: usize,
    pub staged: Vec<PathBuf>,
    /// Remote files that were downloaded, for the registry update.
    pub fetched: Vec<RemoteFile>,
    pub failures: Vec<StageFailure>,
}

/// Local staging directory for downloaded exports.
#[derive(Debug, Clone)]
pub struct Stager {
    dir: PathBuf,
}

impl Stager {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// List `folder`, keep CSV files not yet in `registry`, and download them.
    ///
    /// Remote failures never escape: a failed listing stages nothing and a
    /// failed download skips that file. Only local I/O on the staging dir is
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::Io`] if the staging directory cannot be created.
    pub fn stage(
        &self,
        store: &dyn RemoteStore,
        folder: &str,
        registry: Option<&ProcessedRegistry>,
    ) -> Result<StageReport, MergeError> {
        fs::create_dir_all(&self.dir).map_err(|err| MergeError::io(&self.dir, err))?;

        let mut report = StageReport::default();
        let listing = match store.list(folder) {
            Ok(files) => files,
            Err(err) => {
                warn!(
                    code = err.code().code(),
                    folder,
                    "listing remote folder failed: {err}"
                );
                return Ok(report);
            }
        };

        let csv_files: Vec<RemoteFile> = listing
            .into_iter()
            .filter(|file| is_csv_name(&file.name))
            .collect();
        report.listed = csv_files.len();
        info!("found {} csv files in {folder}", csv_files.len());

        let pending = match registry {
            Some(registry) => registry.pending(&csv_files),
            None => csv_files,
        };
        report.unchanged = report.listed - pending.len();
        if report.unchanged > 0 {
            info!("{} files already processed", report.unchanged);
        }

        for file in pending {
            let dest = self.dir.join(&file.name);
            match store.fetch(&file, &dest) {
                Ok(()) => {
                    info!(remote = %file.path, "staged {}", dest.display());
                    report.staged.push(dest);
                    report.fetched.push(file);
                }
                Err(err) if err.is_recoverable() => {
                    warn!(
                        code = ErrorCode::SourceUnavailable.code(),
                        remote = %file.path,
                        "download failed, skipping: {err}"
                    );
                    report.failures.push(StageFailure {
                        path: file.path,
                        message: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        Ok(report)
    }

    /// CSV files currently in the staging dir, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::Io`] if the directory exists but cannot be read.
    pub fn staged_files(&self) -> Result<Vec<PathBuf>, MergeError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(MergeError::io(&self.dir, err)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| MergeError::io(&self.dir, err))?.path();
            let is_csv = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(is_csv_name);
            if path.is_file() && is_csv {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Remove every file in the staging dir. Returns how many were removed.
    ///
    /// Files that cannot be removed are logged and left behind.
    pub fn stage_cleanup(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) => warn!(path = %path.display(), "could not remove staged file: {err}"),
            }
        }
        info!("removed {removed} staged files");
        removed
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// In-memory remote store for tests.
    #[derive(Debug, Default)]
    pub struct FakeStore {
        pub files: Vec<RemoteFile>,
        pub contents: HashMap<String, String>,
        pub fail_listing: bool,
        pub fail_paths: Vec<String>,
        pub fetched: RefCell<Vec<String>>,
    }

    impl FakeStore {
        pub fn with_file(mut self, name: &str, rev: &str, body: &str) -> Self {
            let path = format!("/exports/{}", name.to_lowercase());
            self.files.push(RemoteFile {
                path: path.clone(),
                name: name.to_string(),
                rev: rev.to_string(),
            });
            self.contents.insert(path, body.to_string());
            self
        }
    }

    impl RemoteStore for FakeStore {
        fn list(&self, folder: &str) -> Result<Vec<RemoteFile>, MergeError> {
            if self.fail_listing {
                return Err(MergeError::source_unavailable(folder, "listing refused"));
            }
            Ok(self.files.clone())
        }

        fn fetch(&self, file: &RemoteFile, dest: &Path) -> Result<(), MergeError> {
            if self.fail_paths.contains(&file.path) {
                return Err(MergeError::source_unavailable(&file.path, "connection reset"));
            }
            self.fetched.borrow_mut().push(file.path.clone());
            let body = self.contents.get(&file.path).cloned().unwrap_or_default();
            fs::write(dest, body).map_err(|err| MergeError::io(dest, err))
        }
    }
}
