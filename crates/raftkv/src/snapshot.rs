//! Point-in-time snapshots of the [`StateStore`].
//!
//! Snapshots are a JSON object of key to value. They carry no Raft metadata;
//! openraft keeps the last log id and membership in the snapshot meta.

use crate::store::StateStore;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Serialized copy of the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    data: Vec<u8>,
}

impl Snapshot {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Errors while producing or writing a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write snapshot: {0}")]
    Write(#[source] io::Error),

    #[error("failed to cancel snapshot after write error {write}: {cancel}")]
    Cancel { write: io::Error, cancel: io::Error },
}

/// A snapshot could not be turned back into a store map.
#[derive(Debug, Error)]
#[error("failed to restore snapshot: {0}")]
pub struct RestoreError(#[from] serde_json::Error);

/// Destination for snapshot bytes.
///
/// Written bytes must not become visible as a complete snapshot until
/// [`SnapshotSink::close`] succeeds. [`SnapshotSink::cancel`] discards
/// everything written so far.
pub trait SnapshotSink: Write + Send {
    /// Identifier of the snapshot being written.
    fn id(&self) -> &str;

    /// Finish the snapshot and make it visible.
    fn close(&mut self) -> io::Result<()>;

    /// Abort the snapshot and discard partial data.
    fn cancel(&mut self) -> io::Result<()>;
}

/// Take a consistent copy of `store` and serialize it.
///
/// The copy is taken under the store lock; serialization happens after the
/// lock is released.
pub fn capture(store: &StateStore) -> Result<Snapshot, SnapshotError> {
    let copy = store.snapshot_copy();
    let data = serde_json::to_vec(&copy)?;
    Ok(Snapshot { data })
}

/// Write `snapshot` to `sink`, cancelling the sink on any failure.
pub fn persist(snapshot: &Snapshot, sink: &mut dyn SnapshotSink) -> Result<(), SnapshotError> {
    let result = sink
        .write_all(snapshot.as_bytes())
        .and_then(|()| sink.flush())
        .and_then(|()| sink.close());

    match result {
        Ok(()) => Ok(()),
        Err(write) => match sink.cancel() {
            Ok(()) => Err(SnapshotError::Write(write)),
            Err(cancel) => Err(SnapshotError::Cancel { write, cancel }),
        },
    }
}

/// Write `snapshot` as `<dir>/<id>.snap`, then delete every other completed
/// snapshot in `dir`.
///
/// Only the newest snapshot is kept. Stale files are removed after the new
/// one is renamed into place, so a crash in between leaves extra files, never
/// zero.
pub fn persist_to_dir(
    dir: &Path,
    id: &str,
    snapshot: &Snapshot,
) -> Result<PathBuf, SnapshotError> {
    let mut sink = FileSnapshotSink::create(dir, id).map_err(SnapshotError::Write)?;
    persist(snapshot, &mut sink)?;
    let path = sink.path().to_path_buf();

    for entry in fs::read_dir(dir).map_err(SnapshotError::Write)? {
        let stale = entry.map_err(SnapshotError::Write)?.path();
        if stale == path || stale.extension().is_none_or(|ext| ext != "snap") {
            continue;
        }
        match fs::remove_file(&stale) {
            Ok(()) => tracing::debug!(path = %stale.display(), "removed old snapshot"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(SnapshotError::Write(e)),
        }
    }

    Ok(path)
}

/// Deserialize a full replacement map.
pub fn restore(bytes: &[u8]) -> Result<BTreeMap<String, String>, RestoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// In-memory sink. Bytes become readable only after `close`.
#[derive(Debug, Default)]
pub struct MemorySnapshotSink {
    id: String,
    buffer: Vec<u8>,
    committed: Option<Vec<u8>>,
    cancelled: bool,
}

impl MemorySnapshotSink {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// The completed snapshot bytes, if the sink was closed.
    pub fn committed(&self) -> Option<&[u8]> {
        self.committed.as_deref()
    }

    pub fn into_committed(self) -> Option<Vec<u8>> {
        self.committed
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

impl Write for MemorySnapshotSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.cancelled || self.committed.is_some() {
            return Err(io::Error::other("snapshot sink is finished"));
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SnapshotSink for MemorySnapshotSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn close(&mut self) -> io::Result<()> {
        if self.cancelled {
            return Err(io::Error::other("snapshot sink was cancelled"));
        }
        self.committed = Some(std::mem::take(&mut self.buffer));
        Ok(())
    }

    fn cancel(&mut self) -> io::Result<()> {
        self.buffer.clear();
        self.cancelled = true;
        Ok(())
    }
}

/// File-backed sink.
///
/// Writes go to `<dir>/<id>.snap.tmp`; `close` fsyncs and renames the file
/// to `<dir>/<id>.snap`, `cancel` removes the temporary file.
pub struct FileSnapshotSink {
    id: String,
    temp_path: PathBuf,
    final_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileSnapshotSink {
    /// Create a sink for snapshot `id` inside `dir`, creating `dir` if needed.
    pub fn create(dir: &Path, id: impl Into<String>) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let id = id.into();
        let temp_path = dir.join(format!("{}.snap.tmp", id));
        let final_path = dir.join(format!("{}.snap", id));

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;

        Ok(Self {
            id,
            temp_path,
            final_path,
            writer: Some(BufWriter::new(file)),
        })
    }

    /// Path of the completed snapshot file.
    pub fn path(&self) -> &Path {
        &self.final_path
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("snapshot sink is finished"))
    }
}

impl Write for FileSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn close(&mut self) -> io::Result<()> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| io::Error::other("snapshot sink is finished"))?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&self.temp_path, &self.final_path)
    }

    fn cancel(&mut self) -> io::Result<()> {
        self.writer = None;
        match fs::remove_file(&self.temp_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for FileSnapshotSink {
    fn drop(&mut self) {
        // A sink dropped without close must not leave a partial file behind.
        if self.writer.is_some() {
            let _ = self.cancel();
        }
    }
}
