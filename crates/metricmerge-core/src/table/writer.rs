//! Append-only CSV writer for the canonical output.
//!
//! The output file is only ever opened in append mode. The header row is
//! written exactly once: on the first append to a file that is absent or
//! empty. Later appends, including appends from later runs, are aligned to
//! the header already on disk.
//!
//! Each chunk reaches the file whole or not at all. The chunk is serialized in
//! memory and committed with a single write. Before the write, the current
//! file length is recorded in `<output>.pending`; the marker is removed once
//! the chunk is synced. A failed write is truncated back immediately. A killed
//! process leaves the marker behind, and [`recover_interrupted_append`] cuts
//! the output back to the recorded length before the next run reads its keys.

use std::borrow::Cow;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::MergeError;
use crate::table::Table;
use crate::table::reader::{csv_error, read_header};

/// Marker file that exists only while a chunk is being appended to `output`.
#[must_use]
pub fn pending_marker_for(output: &Path) -> PathBuf {
    let mut name: OsString = output.as_os_str().to_owned();
    name.push(".pending");
    PathBuf::from(name)
}

/// Destination of committed chunks.
trait ChunkSink: Write {
    fn committed_len(&mut self) -> io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl ChunkSink for File {
    fn committed_len(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Write `bytes` in one go. On failure the sink is cut back to `before`.
fn commit_chunk(sink: &mut impl ChunkSink, before: u64, bytes: &[u8]) -> io::Result<()> {
    let written = sink.write_all(bytes).and_then(|()| sink.flush());
    if let Err(err) = written {
        if let Err(rollback) = sink.truncate_to(before) {
            warn!("could not roll back partial chunk: {rollback}");
        }
        return Err(err);
    }
    Ok(())
}

/// Length of `file` up to and including its last newline.
fn complete_prefix_len(file: &mut File, len: u64) -> io::Result<u64> {
    const BLOCK: u64 = 8 * 1024;
    let mut end = len;
    let mut buf = vec![0_u8; 8 * 1024];
    while end > 0 {
        let start = end.saturating_sub(BLOCK);
        let size = usize::try_from(end - start).unwrap_or(buf.len());
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf[..size])?;
        if let Some(pos) = buf[..size].iter().rposition(|byte| *byte == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

/// Undo an append that never completed, so the output holds whole chunks only.
///
/// With a pending marker present, the output is truncated to the length it
/// records. Without one, a trailing record that lacks its newline is trimmed.
/// Returns the number of bytes removed.
///
/// # Errors
///
/// Returns [`MergeError::Io`] if the output or marker cannot be read or
/// truncated.
pub fn recover_interrupted_append(output: &Path) -> Result<u64, MergeError> {
    let marker = pending_marker_for(output);
    let recorded = match fs::read_to_string(&marker) {
        Ok(text) => {
            let parsed = text.trim().parse::<u64>().ok();
            if parsed.is_none() {
                warn!(marker = %marker.display(), "ignoring malformed pending marker");
            }
            parsed
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => return Err(MergeError::io(&marker, err)),
    };

    let mut file = match OpenOptions::new().read(true).write(true).open(output) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            remove_marker(&marker)?;
            return Ok(0);
        }
        Err(err) => return Err(MergeError::io(output, err)),
    };
    let len = file
        .metadata()
        .map_err(|err| MergeError::io(output, err))?
        .len();

    let keep = match recorded {
        Some(before) => before.min(len),
        None => complete_prefix_len(&mut file, len).map_err(|err| MergeError::io(output, err))?,
    };
    if keep < len {
        file.set_len(keep).map_err(|err| MergeError::io(output, err))?;
        file.sync_all().map_err(|err| MergeError::io(output, err))?;
        warn!(
            output = %output.display(),
            removed = len - keep,
            "truncated incomplete append from an interrupted run"
        );
    }
    remove_marker(&marker)?;
    Ok(len - keep)
}

fn remove_marker(marker: &Path) -> Result<(), MergeError> {
    match fs::remove_file(marker) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(MergeError::io(marker, err)),
    }
}

/// Appends tables to a delimited file, writing the header only once.
pub struct AppendWriter {
    path: PathBuf,
    marker: PathBuf,
    delimiter: u8,
    header: Option<Vec<String>>,
    file: Option<File>,
}

impl AppendWriter {
    /// Prepare to append to `path`. The file is not created until the first
    /// non-empty append.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file's header cannot be read.
    pub fn new(path: &Path, delimiter: u8) -> Result<Self, MergeError> {
        let header = read_header(path, delimiter)?;
        Ok(Self {
            path: path.to_path_buf(),
            marker: pending_marker_for(path),
            delimiter,
            header,
            file: None,
        })
    }

    fn file(&mut self) -> Result<&mut File, MergeError> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|err| MergeError::io(&self.path, err))?;
            self.file = Some(file);
        }
        self.file.as_mut().ok_or_else(|| {
            MergeError::io(&self.path, io::Error::other("append writer unavailable"))
        })
    }

    /// Position of each on-disk header column within `table`.
    fn layout_for(&self, table: &Table) -> Vec<Option<usize>> {
        let Some(header) = &self.header else {
            return (0..table.columns().len()).map(Some).collect();
        };

        let dropped: Vec<&str> = table
            .columns()
            .iter()
            .filter(|column| !header.contains(column))
            .map(String::as_str)
            .collect();
        if !dropped.is_empty() {
            warn!(
                path = %self.path.display(),
                ?dropped,
                "columns not present in the existing header are not written"
            );
        }

        header
            .iter()
            .map(|column| table.column_index(column))
            .collect()
    }

    fn serialize(&self, table: &Table) -> Result<Vec<u8>, MergeError> {
        let layout = self.layout_for(table);
        let mut buffer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .from_writer(Vec::new());

        if self.header.is_none() {
            debug!(path = %self.path.display(), "writing header to fresh output");
            buffer
                .write_record(table.columns())
                .map_err(|err| csv_error(&self.path, err))?;
        }
        for row in table.rows() {
            let cells: Vec<Cow<'_, str>> = layout
                .iter()
                .map(|slot| slot.map_or(Cow::Borrowed(""), |index| row[index].to_cell()))
                .collect();
            buffer
                .write_record(cells.iter().map(|cell| cell.as_bytes()))
                .map_err(|err| csv_error(&self.path, err))?;
        }
        buffer
            .into_inner()
            .map_err(|err| MergeError::io(&self.path, err.into_error()))
    }

    /// Append every row of `table` as one unit, then sync.
    ///
    /// Returns the number of rows written.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened, written or synced.
    /// A failed write leaves the file at its previous length.
    pub fn append(&mut self, table: &Table) -> Result<usize, MergeError> {
        if table.is_empty() {
            return Ok(0);
        }

        let bytes = self.serialize(table)?;
        let path = self.path.clone();
        let marker = self.marker.clone();
        let file = self.file()?;

        let before = file.committed_len().map_err(|err| MergeError::io(&path, err))?;
        fs::write(&marker, before.to_string()).map_err(|err| MergeError::io(&marker, err))?;
        commit_chunk(file, before, &bytes).map_err(|err| MergeError::io(&path, err))?;
        file.sync_data().map_err(|err| MergeError::io(&path, err))?;
        remove_marker(&marker)?;

        if self.header.is_none() {
            self.header = Some(table.columns().to_vec());
        }
        Ok(table.len())
    }
}
