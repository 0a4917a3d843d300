//! Raft storage implementation (combined log + state machine for v0.9).
//!
//! The log lives in memory. The state machine side delegates to
//! [`KvStateMachine`]; this module only adapts it to openraft's
//! `RaftStorage` interface. Snapshots are kept in memory and, when a
//! snapshot directory is configured, also written there; only the newest
//! snapshot file is kept.

use crate::snapshot::{self, MemorySnapshotSink, SnapshotSink};
use crate::state_machine::{AppliedState, FatalError, KvStateMachine};
use crate::type_config::{Entry, LogId, SnapshotMeta, StorageError, StoredMembership, TypeConfig};
use crate::{CommandResponse, NodeId};

use openraft::storage::{LogState, RaftLogReader, RaftSnapshotBuilder, Snapshot};
use openraft::{
    EntryPayload, OptionalSend, RaftLogId, RaftStorage, RaftTypeConfig, StorageIOError, Vote,
};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory Raft log bound to a key-value state machine.
pub struct MemRaftStore {
    /// Last purged log ID
    last_purged_log_id: RwLock<Option<LogId>>,

    /// The Raft log entries stored as JSON strings
    log: RwLock<BTreeMap<u64, String>>,

    /// Current vote
    vote: RwLock<Option<Vote<NodeId>>>,

    /// Committed log ID (optional save)
    committed: RwLock<Option<LogId>>,

    /// Snapshot index counter
    snapshot_idx: RwLock<u64>,

    /// Current snapshot
    current_snapshot: RwLock<Option<StoredSnapshot>>,

    /// The replicated key-value state
    state_machine: Arc<KvStateMachine>,

    /// Where built snapshots are also written, if anywhere
    snapshot_dir: Option<PathBuf>,
}

/// Stored snapshot data
#[derive(Debug)]
pub struct StoredSnapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

/// Type alias for the store wrapped in Arc
pub type LogStore = Arc<MemRaftStore>;

impl MemRaftStore {
    /// Create a store feeding `state_machine`.
    pub fn new(state_machine: Arc<KvStateMachine>) -> Self {
        Self {
            last_purged_log_id: RwLock::new(None),
            log: RwLock::new(BTreeMap::new()),
            vote: RwLock::new(None),
            committed: RwLock::new(None),
            snapshot_idx: RwLock::new(0),
            current_snapshot: RwLock::new(None),
            state_machine,
            snapshot_dir: None,
        }
    }

    /// Also write every built snapshot to `dir`.
    pub fn with_snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_dir = Some(dir.into());
        self
    }

    pub fn state_machine(&self) -> &Arc<KvStateMachine> {
        &self.state_machine
    }

    /// Write snapshot bytes through the configured sinks.
    ///
    /// The file write runs on the blocking pool and prunes older snapshot
    /// files once the new one is in place.
    async fn persist_snapshot(
        &self,
        snapshot_id: &str,
        captured: snapshot::Snapshot,
    ) -> Result<Vec<u8>, StorageError> {
        let signature: Option<openraft::storage::SnapshotSignature<NodeId>> = None;
        let captured = Arc::new(captured);

        if let Some(dir) = self.snapshot_dir.clone() {
            let id = snapshot_id.to_string();
            let to_write = captured.clone();
            let path = tokio::task::spawn_blocking(move || {
                snapshot::persist_to_dir(&dir, &id, &to_write)
            })
            .await
            .map_err(|e| StorageIOError::write_snapshot(signature.clone(), &e))?
            .map_err(|e| StorageIOError::write_snapshot(signature.clone(), &e))?;
            tracing::info!(path = %path.display(), "snapshot written");
        }

        let mut sink = MemorySnapshotSink::new(snapshot_id);
        snapshot::persist(&captured, &mut sink)
            .map_err(|e| StorageIOError::write_snapshot(signature.clone(), &e))?;
        debug_assert_eq!(sink.id(), snapshot_id);
        sink.into_committed().ok_or_else(|| {
            StorageIOError::write_snapshot(
                signature,
                &std::io::Error::other("snapshot sink closed without data"),
            )
            .into()
        })
    }
}

/// Create an in-memory store for a new state machine.
pub fn new_log_store(state_machine: Arc<KvStateMachine>) -> LogStore {
    Arc::new(MemRaftStore::new(state_machine))
}

fn fatal_to_storage(log_id: LogId, err: FatalError) -> StorageError {
    StorageIOError::apply(log_id, &err).into()
}

// Implement RaftLogReader for Arc<MemRaftStore>
impl RaftLogReader<TypeConfig> for Arc<MemRaftStore> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry>, StorageError> {
        let mut entries = vec![];
        let log = self.log.read().await;
        for (_, serialized) in log.range(range) {
            let ent: Entry =
                serde_json::from_str(serialized).map_err(|e| StorageIOError::read_logs(&e))?;
            entries.push(ent);
        }
        Ok(entries)
    }
}

// Implement RaftSnapshotBuilder for Arc<MemRaftStore>
impl RaftSnapshotBuilder<TypeConfig> for Arc<MemRaftStore> {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError> {
        let captured = self
            .state_machine
            .snapshot()
            .map_err(|e| StorageIOError::read_state_machine(&e))?;
        let AppliedState {
            last_applied_log,
            last_membership,
        } = captured.applied;

        let mut idx = self.snapshot_idx.write().await;
        *idx += 1;
        let snapshot_idx = *idx;
        drop(idx);

        let snapshot_id = if let Some(last) = last_applied_log {
            format!("{}-{}-{}", last.leader_id, last.index, snapshot_idx)
        } else {
            format!("--{}", snapshot_idx)
        };

        let data = self.persist_snapshot(&snapshot_id, captured.snapshot).await?;

        let meta = SnapshotMeta {
            last_log_id: last_applied_log,
            last_membership,
            snapshot_id,
        };

        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            bytes = data.len(),
            "built snapshot"
        );

        let snapshot = StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        };

        let mut current_snapshot = self.current_snapshot.write().await;
        *current_snapshot = Some(snapshot);

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

// Implement RaftStorage for Arc<MemRaftStore>
impl RaftStorage<TypeConfig> for Arc<MemRaftStore> {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError> {
        let log = self.log.read().await;
        let last_serialized = log.iter().next_back().map(|(_, ent)| ent);

        let last = match last_serialized {
            None => None,
            Some(serialized) => {
                let ent: Entry =
                    serde_json::from_str(serialized).map_err(|e| StorageIOError::read_logs(&e))?;
                Some(*ent.get_log_id())
            }
        };

        let last_purged = *self.last_purged_log_id.read().await;

        let last = match last {
            None => last_purged,
            Some(x) => Some(x),
        };

        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id: last,
        })
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError> {
        let mut h = self.vote.write().await;
        *h = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError> {
        Ok(*self.vote.read().await)
    }

    async fn save_committed(&mut self, committed: Option<LogId>) -> Result<(), StorageError> {
        let mut c = self.committed.write().await;
        *c = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId>, StorageError> {
        Ok(*self.committed.read().await)
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId>, StoredMembership), StorageError> {
        let applied = self.state_machine.applied_state();
        Ok((applied.last_applied_log, applied.last_membership))
    }

    async fn delete_conflict_logs_since(&mut self, log_id: LogId) -> Result<(), StorageError> {
        let mut log = self.log.write().await;
        let keys: Vec<u64> = log.range(log_id.index..).map(|(k, _)| *k).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId) -> Result<(), StorageError> {
        {
            let mut ld = self.last_purged_log_id.write().await;
            *ld = Some(log_id);
        }
        {
            let mut log = self.log.write().await;
            let keys: Vec<u64> = log.range(..=log_id.index).map(|(k, _)| *k).collect();
            for key in keys {
                log.remove(&key);
            }
        }
        Ok(())
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = Entry> + OptionalSend,
    {
        let mut log = self.log.write().await;
        for entry in entries {
            let s = serde_json::to_string(&entry)
                .map_err(|e| StorageIOError::write_log_entry(*entry.get_log_id(), &e))?;
            log.insert(entry.log_id.index, s);
        }
        Ok(())
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry],
    ) -> Result<Vec<CommandResponse>, StorageError> {
        let mut res = Vec::with_capacity(entries.len());

        for entry in entries {
            let log_id = entry.log_id;
            let applied = match &entry.payload {
                EntryPayload::Blank => self.state_machine.apply_blank(log_id),
                EntryPayload::Normal(envelope) => self.state_machine.apply(log_id, &envelope.0),
                EntryPayload::Membership(mem) => self
                    .state_machine
                    .apply_membership(StoredMembership::new(Some(log_id), mem.clone())),
            };
            res.push(applied.map_err(|e| fatal_to_storage(log_id, e))?);
        }

        Ok(res)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<<TypeConfig as RaftTypeConfig>::SnapshotData>, StorageError> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta,
        snapshot: Box<<TypeConfig as RaftTypeConfig>::SnapshotData>,
    ) -> Result<(), StorageError> {
        let new_snapshot = StoredSnapshot {
            meta: meta.clone(),
            data: snapshot.into_inner(),
        };

        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            bytes = new_snapshot.data.len(),
            "installing snapshot"
        );

        self.state_machine
            .restore(
                &new_snapshot.data,
                AppliedState {
                    last_applied_log: meta.last_log_id,
                    last_membership: meta.last_membership.clone(),
                },
            )
            .map_err(|e| {
                StorageError::from(StorageIOError::read_snapshot(
                    Some(new_snapshot.meta.signature()),
                    &e,
                ))
            })?;

        let mut current_snapshot = self.current_snapshot.write().await;
        *current_snapshot = Some(new_snapshot);

        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<Snapshot<TypeConfig>>, StorageError> {
        let current_snapshot = self.current_snapshot.read().await;
        match &*current_snapshot {
            Some(snapshot) => {
                let data = snapshot.data.clone();
                Ok(Some(Snapshot {
                    meta: snapshot.meta.clone(),
                    snapshot: Box::new(Cursor::new(data)),
                }))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::type_config::Envelope;
    use tempfile::TempDir;

    fn make_entry(index: u64, term: u64, cmd: &Command) -> Entry {
        Entry {
            log_id: LogId::new(openraft::CommittedLeaderId::new(term, 1), index),
            payload: EntryPayload::Normal(Envelope(cmd.encode().unwrap())),
        }
    }

    #[tokio::test]
    async fn test_memstore_basic() {
        let mut store = new_log_store(Arc::new(KvStateMachine::new()));

        // Check initial state
        let state = store.get_log_state().await.unwrap();
        assert!(state.last_log_id.is_none());
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let mut store = new_log_store(Arc::new(KvStateMachine::new()));

        let entry = make_entry(1, 1, &Command::put("a", "1"));
        store.append_to_log(vec![entry]).await.unwrap();

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.unwrap().index, 1);

        let entries = store.try_get_log_entries(1..=1).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_apply_mutates_state_machine() {
        let sm = Arc::new(KvStateMachine::new());
        let mut store = new_log_store(sm.clone());

        let entries = vec![
            make_entry(1, 1, &Command::put("a", "1")),
            make_entry(2, 1, &Command::put("b", "2")),
            make_entry(3, 1, &Command::delete("a")),
        ];
        let responses = store.apply_to_state_machine(&entries).await.unwrap();

        assert_eq!(responses.len(), 3);
        assert_eq!(sm.store().get("a"), None);
        assert_eq!(sm.store().get("b"), Some("2".into()));

        let (last_applied, _) = store.last_applied_state().await.unwrap();
        assert_eq!(last_applied.unwrap().index, 3);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_fatal() {
        let sm = Arc::new(KvStateMachine::new());
        let mut store = new_log_store(sm.clone());

        let corrupt = Entry {
            log_id: LogId::new(openraft::CommittedLeaderId::new(1, 1), 1),
            payload: EntryPayload::Normal(Envelope(vec![0xff, 0x00])),
        };
        assert!(store.apply_to_state_machine(&[corrupt]).await.is_err());
        assert!(!sm.health().is_serving());
    }

    #[tokio::test]
    async fn test_rebuilt_snapshot_replaces_file() {
        let dir = TempDir::new().unwrap();
        let sm = Arc::new(KvStateMachine::new());
        let mut store = Arc::new(MemRaftStore::new(sm).with_snapshot_dir(dir.path()));

        let mut ids = Vec::new();
        for index in 1..=3 {
            let entry = make_entry(index, 1, &Command::put(format!("k{index}"), "v"));
            store.apply_to_state_machine(&[entry]).await.unwrap();
            ids.push(store.build_snapshot().await.unwrap().meta.snapshot_id);
        }

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files, vec![std::ffi::OsString::from(format!("{}.snap", ids[2]))]);
    }

    #[tokio::test]
    async fn test_snapshot_install_round_trip() {
        let dir = TempDir::new().unwrap();
        let source_sm = Arc::new(KvStateMachine::new());
        let mut source =
            Arc::new(MemRaftStore::new(source_sm.clone()).with_snapshot_dir(dir.path()));

        let entries = vec![
            make_entry(1, 1, &Command::put("x", "10")),
            make_entry(2, 1, &Command::put("y", "")),
        ];
        source.apply_to_state_machine(&entries).await.unwrap();

        let built = source.build_snapshot().await.unwrap();
        assert_eq!(built.meta.last_log_id.unwrap().index, 2);
        let file = dir.path().join(format!("{}.snap", built.meta.snapshot_id));
        assert!(file.exists());

        let target_sm = Arc::new(KvStateMachine::new());
        let mut target = new_log_store(target_sm.clone());
        target
            .install_snapshot(&built.meta, built.snapshot)
            .await
            .unwrap();

        assert_eq!(
            target_sm.store().snapshot_copy(),
            source_sm.store().snapshot_copy()
        );
        let current = target.get_current_snapshot().await.unwrap().unwrap();
        assert_eq!(current.meta.snapshot_id, built.meta.snapshot_id);
    }
}
