//! Client-facing key-value operations.
//!
//! [`KvStore`] is what the HTTP adapter serves. [`RaftKv`] implements it on
//! top of the replicated log; [`MemoryKv`] is a single-process backend for
//! tests and local tooling.
//!
//! Reads and writes are leader-only. A follower answers
//! [`KvError::NotLeader`] with the best-known leader address instead of
//! serving possibly stale data.

use crate::command::Command;
use crate::consensus::{Consensus, Leadership, SubmitError};
use crate::error::{KvError, KvResult};
use crate::membership::MembershipManager;
use crate::state_machine::{Health, KvStateMachine};
use crate::store::StateStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on how long a write waits to commit.
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Key-value operations exposed to clients.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Current value of `key`, `None` if absent.
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Set every pair. An empty map succeeds without replicating anything.
    async fn put(&self, pairs: BTreeMap<String, String>) -> KvResult<()>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> KvResult<()>;

    /// Add a node to the cluster.
    async fn join(&self, node_id: &str, addr: &str) -> KvResult<()>;

    /// Who leads the cluster, reported by the client `/health` endpoint.
    fn leadership(&self) -> Leadership;

    fn health(&self) -> Health;
}

/// [`KvStore`] replicated through a [`Consensus`] implementation.
#[derive(Clone)]
pub struct RaftKv {
    consensus: Arc<dyn Consensus>,
    state_machine: Arc<KvStateMachine>,
    membership: MembershipManager,
    apply_timeout: Duration,
}

impl RaftKv {
    pub fn new(consensus: Arc<dyn Consensus>, state_machine: Arc<KvStateMachine>) -> Self {
        Self {
            membership: MembershipManager::new(consensus.clone()),
            consensus,
            state_machine,
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
        }
    }

    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    pub fn membership(&self) -> &MembershipManager {
        &self.membership
    }

    /// Leadership as reported live by the consensus module.
    pub fn is_leader(&self) -> Leadership {
        self.consensus.leadership()
    }

    fn ensure_serving(&self) -> KvResult<()> {
        match self.state_machine.health() {
            Health::Serving => Ok(()),
            Health::Halted { reason } => Err(KvError::Halted(reason)),
        }
    }

    fn ensure_leader(&self) -> KvResult<()> {
        self.ensure_serving()?;
        let leadership = self.consensus.leadership();
        if leadership.is_leader {
            Ok(())
        } else {
            Err(KvError::not_leader(leadership.leader_hint))
        }
    }

    /// Replicate `cmd` and wait for it to apply, for at most the apply
    /// timeout regardless of how the consensus module handles its deadline.
    async fn submit(&self, cmd: Command) -> KvResult<()> {
        let payload = cmd.encode()?;
        let submitted = self.consensus.submit(payload, self.apply_timeout);
        let response = tokio::time::timeout(self.apply_timeout, submitted)
            .await
            .map_err(|_| KvError::Apply(SubmitError::Timeout(self.apply_timeout).to_string()))?
            .map_err(|e| match e {
                SubmitError::Fatal(reason) => KvError::Consensus(reason),
                other => KvError::Apply(other.to_string()),
            })?;
        tracing::debug!(key = %cmd.key, ?response, "command committed");
        Ok(())
    }
}

#[async_trait]
impl KvStore for RaftKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.ensure_leader()?;
        Ok(self.state_machine.store().get(key))
    }

    async fn put(&self, pairs: BTreeMap<String, String>) -> KvResult<()> {
        self.ensure_leader()?;
        for (key, value) in pairs {
            self.submit(Command::put(key, value)).await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.ensure_leader()?;
        self.submit(Command::delete(key)).await
    }

    async fn join(&self, node_id: &str, addr: &str) -> KvResult<()> {
        self.ensure_serving()?;
        self.membership.join(node_id, addr).await
    }

    fn leadership(&self) -> Leadership {
        self.is_leader()
    }

    fn health(&self) -> Health {
        self.state_machine.health()
    }
}

/// Unreplicated [`KvStore`] that always acts as leader.
#[derive(Debug, Default)]
pub struct MemoryKv {
    store: StateStore,
    members: Mutex<BTreeMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn members(&self) -> BTreeMap<String, String> {
        self.members.lock().clone()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.store.get(key))
    }

    async fn put(&self, pairs: BTreeMap<String, String>) -> KvResult<()> {
        for (key, value) in pairs {
            self.store.set(key, value);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.store.delete(key);
        Ok(())
    }

    async fn join(&self, node_id: &str, addr: &str) -> KvResult<()> {
        if node_id.is_empty() || addr.is_empty() {
            return Err(KvError::InvalidArgument(
                "node id and address are required".into(),
            ));
        }
        let mut members = self.members.lock();
        match members.get(node_id) {
            Some(existing) if existing != addr => Err(KvError::Conflict {
                node_id: node_id.to_string(),
                existing: existing.clone(),
                requested: addr.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                members.insert(node_id.to_string(), addr.to_string());
                Ok(())
            }
        }
    }

    fn leadership(&self) -> Leadership {
        Leadership::leader()
    }

    fn health(&self) -> Health {
        Health::Serving
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::fake::FakeConsensus;
    use std::time::Instant;

    fn raft_kv(fake: FakeConsensus) -> (Arc<FakeConsensus>, RaftKv) {
        let fake = Arc::new(fake);
        let kv = RaftKv::new(fake.clone(), fake.state_machine.clone());
        (fake, kv)
    }

    fn pairs(items: &[(&str, &str)]) -> BTreeMap<String, String> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn leader_put_get_delete() {
        let (_, kv) = raft_kv(FakeConsensus::leader());
        assert!(kv.is_leader().is_leader);

        kv.put(pairs(&[("a", "1")])).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some("1".into()));

        kv.delete("a").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_absent_key_succeeds() {
        let (_, kv) = raft_kv(FakeConsensus::leader());
        kv.delete("a").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_value_is_distinct_from_absent() {
        let (_, kv) = raft_kv(FakeConsensus::leader());
        kv.put(pairs(&[("blank", "")])).await.unwrap();
        assert_eq!(kv.get("blank").await.unwrap(), Some(String::new()));
        assert_eq!(kv.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_put_submits_nothing() {
        let (fake, kv) = raft_kv(FakeConsensus::leader());
        kv.put(BTreeMap::new()).await.unwrap();
        assert_eq!(fake.submitted(), 0);
    }

    #[tokio::test]
    async fn put_submits_one_command_per_pair() {
        let (fake, kv) = raft_kv(FakeConsensus::leader());
        kv.put(pairs(&[("b", "2"), ("a", "1"), ("c", "3")]))
            .await
            .unwrap();
        assert_eq!(fake.submitted(), 3);
        assert_eq!(fake.state_machine.store().len(), 3);
    }

    #[tokio::test]
    async fn follower_rejects_reads_and_writes() {
        let (fake, kv) = raft_kv(FakeConsensus::follower("127.0.0.1:7001"));

        let leadership = kv.is_leader();
        assert!(!leadership.is_leader);
        assert_eq!(leadership.leader_hint, "127.0.0.1:7001");

        for result in [
            kv.get("a").await.map(|_| ()),
            kv.put(pairs(&[("a", "1")])).await,
            kv.delete("a").await,
        ] {
            match result {
                Err(KvError::NotLeader { hint }) => assert_eq!(hint, "127.0.0.1:7001"),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(fake.submitted(), 0);
    }

    #[tokio::test]
    async fn leadership_is_read_live() {
        let (fake, kv) = raft_kv(FakeConsensus::leader());
        assert!(kv.is_leader().is_leader);

        *fake.leadership.lock() = Leadership::follower("");
        assert!(!kv.is_leader().is_leader);
        assert!(matches!(
            kv.get("a").await,
            Err(KvError::NotLeader { hint }) if hint.is_empty()
        ));
    }

    #[tokio::test]
    async fn uncommitted_write_times_out_with_apply_error() {
        let (_, kv) = raft_kv(FakeConsensus::never_commits());

        let started = Instant::now();
        let err = kv.put(pairs(&[("a", "1")])).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, KvError::Apply(_)), "got {err:?}");
        assert!(elapsed >= Duration::from_millis(900), "took {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn halted_node_refuses_operations() {
        let (fake, kv) = raft_kv(FakeConsensus::leader());
        fake.state_machine.halt("corrupt entry");

        assert!(matches!(kv.health(), Health::Halted { .. }));
        assert!(matches!(kv.get("a").await, Err(KvError::Halted(_))));
        assert!(matches!(
            kv.put(pairs(&[("a", "1")])).await,
            Err(KvError::Halted(_))
        ));
        assert!(matches!(
            kv.join("n2", "127.0.0.1:7002").await,
            Err(KvError::Halted(_))
        ));
    }

    #[tokio::test]
    async fn memory_kv_join_semantics() {
        let kv = MemoryKv::new();
        kv.join("n2", "a:1").await.unwrap();
        kv.join("n2", "a:1").await.unwrap();
        assert!(matches!(
            kv.join("n2", "b:2").await,
            Err(KvError::Conflict { .. })
        ));
        assert_eq!(kv.members().len(), 1);
    }
}
