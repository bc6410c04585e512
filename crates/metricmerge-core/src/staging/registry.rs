//! Record of remote files already staged, keyed by path with their revision.
//!
//! Stored as plain text, one `path,rev` line per file.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tracing::{debug, warn};

use super::RemoteFile;
use crate::error::MergeError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedRegistry {
    entries: BTreeMap<String, String>,
}

impl ProcessedRegistry {
    /// Load the registry, or an empty one if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::Io`] if the file exists but cannot be read.
    pub fn load(path: &Path) -> Result<Self, MergeError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no processed-files registry yet");
                return Ok(Self::default());
            }
            Err(err) => return Err(MergeError::io(path, err)),
        };
        Ok(Self::parse(&text, path))
    }

    fn parse(text: &str, origin: &Path) -> Self {
        let mut entries = BTreeMap::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once(',') {
                Some((path, rev)) if !path.is_empty() && !rev.is_empty() && !rev.contains(',') => {
                    entries.insert(path.to_string(), rev.to_string());
                }
                _ => warn!(
                    path = %origin.display(),
                    line = number + 1,
                    "ignoring malformed registry line"
                ),
            }
        }
        Self { entries }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn revision(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    /// Files that are new or whose revision differs from the recorded one.
    #[must_use]
    pub fn pending(&self, listing: &[RemoteFile]) -> Vec<RemoteFile> {
        listing
            .iter()
            .filter(|file| self.revision(&file.path) != Some(file.rev.as_str()))
            .cloned()
            .collect()
    }

    /// Record the current revision of each file.
    pub fn record(&mut self, files: &[RemoteFile]) {
        for file in files {
            self.entries.insert(file.path.clone(), file.rev.clone());
        }
    }

    /// Write the registry via a temporary sibling and rename.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::Io`] if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), MergeError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| MergeError::io(parent, err))?;
        }
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).map_err(|err| MergeError::io(&tmp, err))?;
        for (remote, rev) in &self.entries {
            writeln!(file, "{remote},{rev}").map_err(|err| MergeError::io(&tmp, err))?;
        }
        file.sync_all().map_err(|err| MergeError::io(&tmp, err))?;
        fs::rename(&tmp, path).map_err(|err| MergeError::io(path, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn remote(path: &str, rev: &str) -> RemoteFile {
        RemoteFile {
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            rev: rev.to_string(),
        }
    }

    #[test]
    fn missing_file_is_empty_registry() {
        let dir = TempDir::new().expect("tempdir");
        let registry = ProcessedRegistry::load(&dir.path().join("absent.txt")).expect("load");
        assert!(registry.is_empty());
    }

    #[test]
    fn pending_detects_new_and_changed_revisions() {
        let mut registry = ProcessedRegistry::default();
        registry.record(&[remote("/x/a.csv", "1"), remote("/x/b.csv", "1")]);

        let listing = [
            remote("/x/a.csv", "1"),
            remote("/x/b.csv", "2"),
            remote("/x/c.csv", "1"),
        ];
        let pending: Vec<String> = registry
            .pending(&listing)
            .into_iter()
            .map(|file| file.path)
            .collect();
        assert_eq!(pending, vec!["/x/b.csv", "/x/c.csv"]);
    }

    #[test]
    fn save_then_load_preserves_entries() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("state").join("processed_files.txt");
        let mut registry = ProcessedRegistry::default();
        registry.record(&[remote("/x/a.csv", "015f"), remote("/x/b.csv", "0a1")]);
        registry.save(&path).expect("save");

        let text = fs::read_to_string(&path).expect("read");
        assert_eq!(text, "/x/a.csv,015f\n/x/b.csv,0a1\n");
        assert_eq!(ProcessedRegistry::load(&path).expect("load"), registry);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("processed_files.txt");
        fs::write(&path, "/x/a.csv,1\ngarbage\n\n,2\n/x/b.csv,2,extra\n/x/c.csv,3\n")
            .expect("write");

        let registry = ProcessedRegistry::load(&path).expect("load");
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.revision("/x/a.csv"), Some("1"));
        assert_eq!(registry.revision("/x/c.csv"), Some("3"));
    }
}
