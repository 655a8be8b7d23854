//! JSON-file backing store.
//!
//! One file holds the whole cookie set, serialized via `serde`. Writes are
//! best-effort: failures are logged and the in-memory state stays
//! authoritative until the next successful write. Good for simple setups;
//! use the SQLite backend where write volume matters.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::canon;
use crate::cookie::Cookie;
use crate::errors::PersistError;
use crate::persistent::{FlushCallback, LoadedCallback, PersistentStore};

#[derive(Default)]
struct State {
    records: BTreeMap<i128, Cookie>,
    /// Ids deleted before the disk load finished; the load must not
    /// resurrect them.
    tombstones: HashSet<i128>,
    loaded_from_disk: bool,
}

pub struct JsonPersistentStore {
    path: PathBuf,
    state: Arc<Mutex<State>>,
}

impl JsonPersistentStore {
    pub fn open(path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            path,
            state: Arc::new(Mutex::new(State::default())),
        })
    }

    fn write_back(&self) {
        let state = self.state.lock().unwrap();
        // Never rewrite the file from a partial view.
        if !state.loaded_from_disk {
            return;
        }
        let records: Vec<&Cookie> = state.records.values().collect();
        if let Err(err) = write_records(&self.path, &records) {
            log::warn!("failed to write cookies to {}: {err}", self.path.display());
        }
    }
}

fn read_records(path: &Path) -> Result<Vec<Cookie>, PersistError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

fn write_records(path: &Path, records: &[&Cookie]) -> Result<(), PersistError> {
    let data = serde_json::to_string_pretty(records)?;
    std::fs::write(path, data)?;
    Ok(())
}

impl PersistentStore for JsonPersistentStore {
    fn load(&self, callback: LoadedCallback) {
        let path = self.path.clone();
        let state = self.state.clone();
        std::thread::spawn(move || {
            let loaded = match read_records(&path) {
                Ok(records) => records,
                Err(err) => {
                    log::warn!("failed to read cookies from {}: {err}", path.display());
                    Vec::new()
                }
            };
            let snapshot = {
                let mut state = state.lock().unwrap();
                for c in loaded {
                    let id = c.creation_id();
                    if !state.tombstones.contains(&id) {
                        state.records.entry(id).or_insert(c);
                    }
                }
                state.loaded_from_disk = true;
                state.tombstones.clear();
                state.records.values().cloned().collect::<Vec<_>>()
            };
            callback(snapshot);
        });
    }

    fn load_for_key(&self, key: &str, callback: LoadedCallback) {
        let path = self.path.clone();
        let state = self.state.clone();
        let key = key.to_string();
        std::thread::spawn(move || {
            let loaded = read_records(&path).unwrap_or_default();
            let snapshot = {
                let state = state.lock().unwrap();
                let mut out: BTreeMap<i128, Cookie> = state
                    .records
                    .values()
                    .filter(|c| canon::domain_key(c.domain()) == key)
                    .map(|c| (c.creation_id(), c.clone()))
                    .collect();
                for c in loaded {
                    if canon::domain_key(c.domain()) == key
                        && !state.tombstones.contains(&c.creation_id())
                    {
                        out.entry(c.creation_id()).or_insert(c);
                    }
                }
                out.into_values().collect::<Vec<_>>()
            };
            callback(snapshot);
        });
    }

    fn add(&self, cookie: &Cookie) {
        {
            let mut state = self.state.lock().unwrap();
            state.records.insert(cookie.creation_id(), cookie.clone());
            state.tombstones.remove(&cookie.creation_id());
        }
        self.write_back();
    }

    fn update_access_time(&self, cookie: &Cookie) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = state.records.get_mut(&cookie.creation_id()) {
                existing.set_last_access(cookie.last_access());
            }
        }
        self.write_back();
    }

    fn delete(&self, cookie: &Cookie) {
        {
            let mut state = self.state.lock().unwrap();
            state.records.remove(&cookie.creation_id());
            if !state.loaded_from_disk {
                state.tombstones.insert(cookie.creation_id());
            }
        }
        self.write_back();
    }

    fn flush(&self, callback: FlushCallback) {
        self.write_back();
        callback();
    }

    fn set_force_keep_session_state(&self) {
        // Session cookies only reach this store when the core was built with
        // persist_session_cookies; nothing extra to do here.
    }
}
