//! Dropbox HTTP API client: folder listing and file download.

pub mod auth;

use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::time::Duration;

use metricmerge_core::MergeError;
use metricmerge_core::staging::{RemoteFile, RemoteStore};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

const API_BASE: &str = "https://api.dropboxapi.com/2";
const CONTENT_BASE: &str = "https://content.dropboxapi.com/2";
const USER_AGENT: &str = concat!("metricmerge/", env!("CARGO_PKG_VERSION"));

/// One page of `files/list_folder`.
#[derive(Debug, Deserialize)]
struct ListFolderPage {
    entries: Vec<Entry>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
enum Entry {
    File {
        name: String,
        path_lower: Option<String>,
        rev: String,
    },
    Folder {},
    Deleted {},
}

impl Entry {
    fn into_remote_file(self) -> Option<RemoteFile> {
        match self {
            Self::File {
                name,
                path_lower,
                rev,
            } => Some(RemoteFile {
                path: path_lower.unwrap_or_else(|| name.to_lowercase()),
                name,
                rev,
            }),
            Self::Folder {} | Self::Deleted {} => None,
        }
    }
}

/// Dropbox-backed [`RemoteStore`] authenticated with a bearer token.
pub struct DropboxStore {
    agent: ureq::Agent,
    token: String,
}

impl DropboxStore {
    pub fn new(token: String) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(15))
            .timeout_read(Duration::from_secs(120))
            .user_agent(USER_AGENT)
            .build();
        Self { agent, token }
    }

    fn rpc<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<T, MergeError> {
        let url = format!("{API_BASE}/{endpoint}");
        debug!(%url, "dropbox rpc");
        let response = self
            .agent
            .post(&url)
            .set("Authorization", &format!("Bearer {}", self.token))
            .send_json(body)
            .map_err(|err| MergeError::source_unavailable(endpoint, describe(err)))?;
        response
            .into_json::<T>()
            .map_err(|err| MergeError::source_unavailable(endpoint, err))
    }
}

/// Flatten a `ureq` error into a log-friendly message, keeping the API body on
/// status errors.
fn describe(err: ureq::Error) -> String {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            format!("HTTP {code}: {}", body.trim())
        }
        ureq::Error::Transport(transport) => transport.to_string(),
    }
}

impl RemoteStore for DropboxStore {
    fn list(&self, folder: &str) -> Result<Vec<RemoteFile>, MergeError> {
        let mut page: ListFolderPage = self.rpc(
            "files/list_folder",
            &serde_json::json!({ "path": folder, "recursive": false }),
        )?;
        let mut files = Vec::new();
        loop {
            files.extend(page.entries.into_iter().filter_map(Entry::into_remote_file));
            if !page.has_more {
                break;
            }
            page = self.rpc(
                "files/list_folder/continue",
                &serde_json::json!({ "cursor": page.cursor }),
            )?;
        }
        debug!(folder, count = files.len(), "listed remote folder");
        Ok(files)
    }

    fn fetch(&self, file: &RemoteFile, dest: &Path) -> Result<(), MergeError> {
        let arg = serde_json::json!({ "path": file.path }).to_string();
        let response = self
            .agent
            .post(&format!("{CONTENT_BASE}/files/download"))
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("Dropbox-API-Arg", &arg)
            .call()
            .map_err(|err| MergeError::source_unavailable(&file.path, describe(err)))?;

        let tmp = dest.with_extension("part");
        let mut out = File::create(&tmp).map_err(|err| MergeError::io(&tmp, err))?;
        let copied = io::copy(&mut response.into_reader(), &mut out);
        if let Err(err) = copied {
            let _ = fs::remove_file(&tmp);
            return Err(MergeError::source_unavailable(&file.path, err));
        }
        drop(out);
        fs::rename(&tmp, dest).map_err(|err| MergeError::io(dest, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_page_keeps_files_only() {
        let page: ListFolderPage = serde_json::from_str(
            r#"{
                "entries": [
                    {".tag": "file", "name": "Export 01.csv", "path_lower": "/exports/export 01.csv",
                     "path_display": "/Exports/Export 01.csv", "id": "id:a", "rev": "015f0a", "size": 12},
                    {".tag": "folder", "name": "old", "path_lower": "/exports/old", "id": "id:b"},
                    {".tag": "deleted", "name": "gone.csv", "path_lower": "/exports/gone.csv"}
                ],
                "cursor": "AAE",
                "has_more": false
            }"#,
        )
        .expect("valid page");

        let files: Vec<RemoteFile> = page
            .entries
            .into_iter()
            .filter_map(Entry::into_remote_file)
            .collect();
        assert_eq!(
            files,
            vec![RemoteFile {
                path: "/exports/export 01.csv".into(),
                name: "Export 01.csv".into(),
                rev: "015f0a".into(),
            }]
        );
        assert_eq!(page.cursor, "AAE");
        assert!(!page.has_more);
    }

    #[test]
    fn file_without_path_falls_back_to_name() {
        let entry: Entry =
            serde_json::from_str(r#"{".tag": "file", "name": "A.csv", "rev": "1"}"#)
                .expect("valid entry");
        assert_eq!(
            entry.into_remote_file().map(|file| file.path),
            Some("a.csv".to_string())
        );
    }
}
