// src/store/cache.rs

//! In-memory mirror of the persistent group state. Readers get cheap
//! copy-on-write snapshots; the reconciler replaces the whole map after each
//! converged round.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type StateSnapshot = Arc<BTreeMap<String, String>>;

#[derive(Default)]
pub struct LocalState {
    state: RwLock<StateSnapshot>,
}

impl LocalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an immutable snapshot of the whole state.
    pub fn get_state(&self) -> StateSnapshot {
        Arc::clone(&self.state.read())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.state.read().get(key).cloned()
    }

    /// All entries whose key starts with `prefix`.
    pub fn prefixed(&self, prefix: &str) -> Vec<(String, String)> {
        self.state
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn add_key(&self, key: &str, val: &str) {
        let mut guard = self.state.write();
        let mut next = (**guard).clone();
        next.insert(key.to_string(), val.to_string());
        *guard = Arc::new(next);
    }

    pub fn remove_key(&self, key: &str) {
        let mut guard = self.state.write();
        let mut next = (**guard).clone();
        next.remove(key);
        *guard = Arc::new(next);
    }

    /// Atomically replaces the local mirror with a full remote snapshot.
    pub fn replace(&self, full_map: BTreeMap<String, String>) {
        *self.state.write() = Arc::new(full_map);
    }

    pub fn clear(&self) {
        *self.state.write() = Arc::new(BTreeMap::new());
    }
}
