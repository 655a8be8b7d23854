//! An in-process cookie store with lazy persistence.
//!
//! The [`CookieStore`] keeps the canonical cookie set in memory and answers
//! set/query/delete operations from any thread. An optional
//! [`PersistentStore`](persistent::PersistentStore) backend mirrors the
//! state to durable storage and is loaded lazily: the store services
//! operations for a domain as soon as that domain's records arrive, without
//! waiting for the full load. An optional
//! [`CookieDelegate`](events::CookieDelegate) observes every externally
//! visible change.
//!
//! ```no_run
//! use gosub_cookies::{CookieOptions, CookieStore};
//! use url::Url;
//!
//! # async fn demo() -> Result<(), gosub_cookies::Canceled> {
//! let store = CookieStore::new(None, None);
//! let url = Url::parse("https://www.example.com/").unwrap();
//!
//! store
//!     .set_cookie_with_line(&url, "session=abc123; Secure", CookieOptions::http())
//!     .await?;
//! let header = store.cookie_header_for_url(&url, CookieOptions::http()).await?;
//! assert_eq!(header.as_deref(), Some("session=abc123"));
//! # Ok(())
//! # }
//! ```

pub mod canon;
pub mod cookie;
pub mod errors;
pub mod events;
pub mod options;
pub mod parse;
pub mod persistent;
pub mod store;

mod dedup;
mod eviction;
mod index;

pub use cookie::{Cookie, CookiePriority};
pub use errors::{Canceled, PersistError};
pub use events::{ChangeCause, CookieDelegate, CookieDelegateHandle};
pub use options::CookieOptions;
pub use persistent::{
    InMemoryPersistentStore, JsonPersistentStore, PersistentStore, PersistentStoreHandle,
};
#[cfg(feature = "sqlite_cookie_store")]
pub use persistent::SqlitePersistentStore;
pub use store::{CookieStore, CookieStoreBuilder, Pending};
