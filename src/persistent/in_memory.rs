//! In-memory backing store.
//!
//! Keeps everything in a map, never touches disk. Loads can be deferred and
//! completed by hand, which is what the task-sequencing tests build on; the
//! command log records every sync the core issues.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::canon;
use crate::cookie::Cookie;
use crate::persistent::{FlushCallback, LoadedCallback, PersistentStore};

/// One sync command received from the core, keyed by creation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Add(i128),
    UpdateAccess(i128),
    Delete(i128),
}

#[derive(Default)]
struct State {
    records: BTreeMap<i128, Cookie>,
    deferred: bool,
    pending_load: Vec<LoadedCallback>,
    pending_key_loads: Vec<(String, LoadedCallback)>,
    ops: Vec<StoreOp>,
    force_keep_session: bool,
}

#[derive(Default)]
pub struct InMemoryPersistentStore {
    state: Mutex<State>,
}

impl InMemoryPersistentStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A store whose loads stay pending until [`Self::complete_load`] /
    /// [`Self::complete_key_load`] are called.
    pub fn with_deferred_load() -> Arc<Self> {
        let store = Self::default();
        store.state.lock().unwrap().deferred = true;
        Arc::new(store)
    }

    /// Pre-populates the store, as if the records had been persisted by an
    /// earlier session.
    pub fn seed(&self, cookies: Vec<Cookie>) {
        let mut state = self.state.lock().unwrap();
        for c in cookies {
            state.records.insert(c.creation_id(), c);
        }
    }

    pub fn records(&self) -> Vec<Cookie> {
        self.state.lock().unwrap().records.values().cloned().collect()
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn delete_ops(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter(|op| matches!(op, StoreOp::Delete(_)))
            .count()
    }

    /// Completes the pending global load(s) with the current record set.
    pub fn complete_load(&self) {
        let (callbacks, snapshot) = {
            let mut state = self.state.lock().unwrap();
            let callbacks = std::mem::take(&mut state.pending_load);
            let snapshot: Vec<Cookie> = state.records.values().cloned().collect();
            (callbacks, snapshot)
        };
        for cb in callbacks {
            cb(snapshot.clone());
        }
    }

    /// Completes pending loads for one domain key.
    pub fn complete_key_load(&self, key: &str) {
        let (callbacks, snapshot) = {
            let mut state = self.state.lock().unwrap();
            let mut matched = Vec::new();
            let mut rest = Vec::new();
            for (k, cb) in state.pending_key_loads.drain(..) {
                if k == key {
                    matched.push(cb);
                } else {
                    rest.push((k, cb));
                }
            }
            state.pending_key_loads = rest;
            (matched, key_snapshot(&state, key))
        };
        for cb in callbacks {
            cb(snapshot.clone());
        }
    }
}

fn key_snapshot(state: &State, key: &str) -> Vec<Cookie> {
    state
        .records
        .values()
        .filter(|c| canon::domain_key(c.domain()) == key)
        .cloned()
        .collect()
}

impl PersistentStore for InMemoryPersistentStore {
    fn load(&self, callback: LoadedCallback) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            if state.deferred {
                state.pending_load.push(callback);
                return;
            }
            state.records.values().cloned().collect::<Vec<_>>()
        };
        callback(snapshot);
    }

    fn load_for_key(&self, key: &str, callback: LoadedCallback) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            if state.deferred {
                state.pending_key_loads.push((key.to_string(), callback));
                return;
            }
            key_snapshot(&state, key)
        };
        callback(snapshot);
    }

    fn add(&self, cookie: &Cookie) {
        let mut state = self.state.lock().unwrap();
        state.records.insert(cookie.creation_id(), cookie.clone());
        state.ops.push(StoreOp::Add(cookie.creation_id()));
    }

    fn update_access_time(&self, cookie: &Cookie) {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.records.get_mut(&cookie.creation_id()) {
            existing.set_last_access(cookie.last_access());
        }
        state.ops.push(StoreOp::UpdateAccess(cookie.creation_id()));
    }

    fn delete(&self, cookie: &Cookie) {
        let mut state = self.state.lock().unwrap();
        state.records.remove(&cookie.creation_id());
        state.ops.push(StoreOp::Delete(cookie.creation_id()));
    }

    fn flush(&self, callback: FlushCallback) {
        callback();
    }

    fn set_force_keep_session_state(&self) {
        self.state.lock().unwrap().force_keep_session = true;
    }
}
