//! Durable backing store contract and backends.
//!
//! A [`PersistentStore`] mirrors the in-memory cookie state to durable
//! storage. The core calls it fire-and-forget: loads deliver their result
//! through a callback (from whatever thread the backend likes — the core
//! re-acquires its own lock inside the callback), mutations are one-way.
//! Session cookies are not synced unless the store was built with
//! `persist_session_cookies`.
//!
//! Three backends ship with the crate:
//! - [`InMemoryPersistentStore`]: no durability; supports deferred load
//!   completion, which makes it the substitute of choice in tests.
//! - [`JsonPersistentStore`]: one JSON file, best-effort writes.
//! - [`SqlitePersistentStore`]: SQLite database behind the
//!   `sqlite_cookie_store` feature.

mod in_memory;
mod json;
#[cfg(feature = "sqlite_cookie_store")]
mod sqlite;

use std::sync::Arc;

use crate::cookie::Cookie;

pub use in_memory::{InMemoryPersistentStore, StoreOp};
pub use json::JsonPersistentStore;
#[cfg(feature = "sqlite_cookie_store")]
pub use sqlite::SqlitePersistentStore;

pub type LoadedCallback = Box<dyn FnOnce(Vec<Cookie>) + Send + 'static>;
pub type FlushCallback = Box<dyn FnOnce() + Send + 'static>;

/// Contract between the cookie store core and durable storage.
///
/// Implementations must be `Send + Sync`; the core holds the handle as
/// `Arc<dyn PersistentStore>` and never calls into it while holding its own
/// lock.
pub trait PersistentStore: Send + Sync {
    /// Loads every persisted cookie. The callback may be invoked from any
    /// thread, exactly once.
    fn load(&self, callback: LoadedCallback);

    /// Loads the cookies for one domain key ahead of the full load. Records
    /// delivered here will be delivered again by `load`; the core
    /// deduplicates by creation time.
    fn load_for_key(&self, key: &str, callback: LoadedCallback);

    fn add(&self, cookie: &Cookie);

    fn update_access_time(&self, cookie: &Cookie);

    fn delete(&self, cookie: &Cookie);

    /// Flushes pending writes, then invokes the callback.
    fn flush(&self, callback: FlushCallback);

    /// Keep session cookies on disk across the next shutdown (normally they
    /// are dropped).
    fn set_force_keep_session_state(&self);
}

pub type PersistentStoreHandle = Arc<dyn PersistentStore>;
