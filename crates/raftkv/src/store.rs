//! In-memory key-value state for the Raft state machine.
//!
//! Every node owns one [`StateStore`]. Committed commands are applied here in
//! log order; the leader also serves reads from it.

use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Mutex-guarded key-value map.
///
/// The lock is held for a single map operation (O(1)-ish) or a single full
/// copy/replace (O(n)). It is never held across an `.await`.
#[derive(Debug, Default)]
pub struct StateStore {
    data: Mutex<BTreeMap<String, String>>,
}

impl StateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for `key`, or `None` if absent.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.lock().get(key).cloned()
    }

    /// Stores `value` under `key`, returning the previous value.
    pub fn set(&self, key: String, value: String) -> Option<String> {
        self.data.lock().insert(key, value)
    }

    /// Removes `key`, returning the removed value. Absent keys are fine.
    pub fn delete(&self, key: &str) -> Option<String> {
        self.data.lock().remove(key)
    }

    /// Copies the whole map under the lock.
    pub fn snapshot_copy(&self) -> BTreeMap<String, String> {
        self.data.lock().clone()
    }

    /// Swaps in a full replacement map.
    pub fn replace(&self, data: BTreeMap<String, String>) {
        let old = std::mem::replace(&mut *self.data.lock(), data);
        // Drop the previous map outside the lock.
        drop(old);
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}
