//! SQLite backing store.
//!
//! One `cookies` table for the whole store, one row per cookie, addressed by
//! the unique creation timestamp. Database access goes through an `r2d2`
//! pool so loads can run off-thread while mutations use their own
//! connections.
//!
//! Expiry is persisted at whole-second precision; creation and last-access
//! keep nanosecond precision since creation doubles as the primary key.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::rusqlite::{params, Row};
use r2d2_sqlite::SqliteConnectionManager;
use time::OffsetDateTime;

use crate::canon;
use crate::cookie::{Cookie, CookiePriority};
use crate::errors::PersistError;
use crate::persistent::{FlushCallback, LoadedCallback, PersistentStore};

pub struct SqlitePersistentStore {
    pool: Pool<SqliteConnectionManager>,
    force_keep_session: AtomicBool,
}

impl SqlitePersistentStore {
    /// Opens (or creates) the database at `path` and ensures the schema
    /// exists.
    pub fn open(path: PathBuf) -> anyhow::Result<Arc<Self>> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::new(manager)?;

        {
            let conn = pool.get()?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS cookies (
                    creation_utc INTEGER NOT NULL PRIMARY KEY,
                    host_key TEXT NOT NULL,
                    domain TEXT NOT NULL,
                    source TEXT NOT NULL,
                    name TEXT NOT NULL,
                    value TEXT NOT NULL,
                    path TEXT NOT NULL,
                    expires_utc INTEGER NOT NULL,
                    last_access_utc INTEGER NOT NULL,
                    secure INTEGER NOT NULL,
                    httponly INTEGER NOT NULL,
                    priority INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS cookies_host_key ON cookies (host_key);",
            )?;
        }

        Ok(Arc::new(Self {
            pool,
            force_keep_session: AtomicBool::new(false),
        }))
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, PersistError> {
        Ok(self.pool.get()?)
    }
}

fn query(
    pool: &Pool<SqliteConnectionManager>,
    key: Option<&str>,
) -> Result<Vec<Cookie>, PersistError> {
    let conn = pool.get()?;
    let sql = "SELECT creation_utc, domain, source, name, value, path, expires_utc, \
               last_access_utc, secure, httponly, priority FROM cookies";
    let mut out = Vec::new();
    match key {
        Some(key) => {
            let mut stmt = conn.prepare(&format!("{sql} WHERE host_key = ?1"))?;
            let rows = stmt.query_map(params![key], row_to_cookie)?;
            for row in rows {
                out.extend(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], row_to_cookie)?;
            for row in rows {
                out.extend(row?);
            }
        }
    }
    Ok(out)
}

fn row_to_cookie(row: &Row<'_>) -> r2d2_sqlite::rusqlite::Result<Option<Cookie>> {
    let creation: i64 = row.get(0)?;
    let expires: i64 = row.get(6)?;
    let last_access: i64 = row.get(7)?;
    let priority: i64 = row.get(10)?;

    let creation = match OffsetDateTime::from_unix_timestamp_nanos(creation as i128) {
        Ok(t) => t,
        Err(_) => return Ok(None),
    };
    let last_access = OffsetDateTime::from_unix_timestamp_nanos(last_access as i128)
        .unwrap_or(creation);
    let expiry = (expires != 0)
        .then(|| OffsetDateTime::from_unix_timestamp(expires).ok())
        .flatten();

    Ok(Cookie::from_parts(
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(1)?,
        row.get(5)?,
        creation,
        expiry,
        last_access,
        row.get::<_, i64>(8)? != 0,
        row.get::<_, i64>(9)? != 0,
        match priority {
            0 => CookiePriority::Low,
            2 => CookiePriority::High,
            _ => CookiePriority::Medium,
        },
    ))
}

fn priority_to_int(priority: CookiePriority) -> i64 {
    match priority {
        CookiePriority::Low => 0,
        CookiePriority::Medium => 1,
        CookiePriority::High => 2,
    }
}

impl PersistentStore for SqlitePersistentStore {
    fn load(&self, callback: LoadedCallback) {
        let pool = self.pool.clone();
        std::thread::spawn(move || {
            let cookies = query(&pool, None).unwrap_or_else(|err| {
                log::warn!("failed to load cookies from SQLite: {err}");
                Vec::new()
            });
            callback(cookies);
        });
    }

    fn load_for_key(&self, key: &str, callback: LoadedCallback) {
        let pool = self.pool.clone();
        let key = key.to_string();
        std::thread::spawn(move || {
            let cookies = query(&pool, Some(&key)).unwrap_or_else(|err| {
                log::warn!("failed to load cookies for key {key} from SQLite: {err}");
                Vec::new()
            });
            callback(cookies);
        });
    }

    fn add(&self, cookie: &Cookie) {
        let result: Result<(), PersistError> = (|| {
            let conn = self.conn()?;
            conn.execute(
                "INSERT OR REPLACE INTO cookies (creation_utc, host_key, domain, source, \
                 name, value, path, expires_utc, last_access_utc, secure, httponly, priority) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    cookie.creation_id() as i64,
                    canon::domain_key(cookie.domain()),
                    cookie.domain(),
                    cookie.source(),
                    cookie.name(),
                    cookie.value(),
                    cookie.path(),
                    cookie.expiry().map_or(0, |e| e.unix_timestamp()),
                    cookie.last_access().unix_timestamp_nanos() as i64,
                    cookie.secure() as i64,
                    cookie.http_only() as i64,
                    priority_to_int(cookie.priority()),
                ],
            )?;
            Ok(())
        })();
        if let Err(err) = result {
            log::warn!("failed to persist cookie: {err}");
        }
    }

    fn update_access_time(&self, cookie: &Cookie) {
        let result: Result<(), PersistError> = (|| {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE cookies SET last_access_utc = ?1 WHERE creation_utc = ?2",
                params![
                    cookie.last_access().unix_timestamp_nanos() as i64,
                    cookie.creation_id() as i64,
                ],
            )?;
            Ok(())
        })();
        if let Err(err) = result {
            log::warn!("failed to update cookie access time: {err}");
        }
    }

    fn delete(&self, cookie: &Cookie) {
        let result: Result<(), PersistError> = (|| {
            let conn = self.conn()?;
            conn.execute(
                "DELETE FROM cookies WHERE creation_utc = ?1",
                params![cookie.creation_id() as i64],
            )?;
            Ok(())
        })();
        if let Err(err) = result {
            log::warn!("failed to delete persisted cookie: {err}");
        }
    }

    fn flush(&self, callback: FlushCallback) {
        // Writes are synchronous; nothing is buffered.
        callback();
    }

    fn set_force_keep_session_state(&self) {
        self.force_keep_session.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use time::macros::datetime;

    fn cookie(name: &str, secs: i64) -> Cookie {
        let t = datetime!(2025-01-01 00:00:00 UTC) + time::Duration::seconds(secs);
        Cookie::from_parts(
            "http://example.com".into(),
            name.into(),
            "v".into(),
            ".example.com".into(),
            "/".into(),
            t,
            Some(datetime!(2026-01-01 00:00:00 UTC)),
            t,
            true,
            true,
            CookiePriority::High,
        )
        .unwrap()
    }

    fn load_blocking(store: &SqlitePersistentStore) -> Vec<Cookie> {
        let (tx, rx) = mpsc::channel();
        store.load(Box::new(move |cookies| {
            let _ = tx.send(cookies);
        }));
        rx.recv().unwrap()
    }

    #[test]
    fn roundtrip_preserves_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqlitePersistentStore::open(dir.path().join("cookies.db")).unwrap();

        let original = cookie("session", 0);
        store.add(&original);

        let loaded = load_blocking(&store);
        assert_eq!(loaded.len(), 1);
        let got = &loaded[0];
        assert_eq!(got.name(), original.name());
        assert_eq!(got.value(), original.value());
        assert_eq!(got.domain(), original.domain());
        assert_eq!(got.path(), original.path());
        assert_eq!(got.secure(), original.secure());
        assert_eq!(got.http_only(), original.http_only());
        assert_eq!(got.priority(), original.priority());
        assert_eq!(got.creation(), original.creation());
        // Expiry survives to whole-second precision.
        assert_eq!(
            got.expiry().map(|e| e.unix_timestamp()),
            original.expiry().map(|e| e.unix_timestamp())
        );
    }

    #[test]
    fn key_scoped_load_filters_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqlitePersistentStore::open(dir.path().join("cookies.db")).unwrap();

        store.add(&cookie("a", 0));
        let other = Cookie::from_parts(
            "http://other.com".into(),
            "b".into(),
            "v".into(),
            "other.com".into(),
            "/".into(),
            datetime!(2025-01-01 00:00:01 UTC),
            None,
            datetime!(2025-01-01 00:00:01 UTC),
            false,
            false,
            CookiePriority::Medium,
        )
        .unwrap();
        store.add(&other);

        let (tx, rx) = mpsc::channel();
        store.load_for_key(
            "example.com",
            Box::new(move |cookies| {
                let _ = tx.send(cookies);
            }),
        );
        let loaded = rx.recv().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name(), "a");

        let deleted = cookie("a", 0);
        store.delete(&deleted);
        let remaining = load_blocking(&store);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name(), "b");
    }
}
