//! The cookie store core.
//!
//! [`CookieStore`] owns the in-memory cookie collection and accepts
//! mutations and queries from any thread. All shared state sits behind one
//! exclusive lock; public operations never block on the backing store.
//!
//! # Deferred operations
//! With a persistent backend attached, the first operation kicks off the
//! global load. Until it completes, operations without a domain scope queue
//! on a global FIFO; operations scoped to a domain key trigger a key-scoped
//! load and queue on that key's FIFO (one load per key). Each queue drains
//! strictly in arrival order when its load completes, so two operations on
//! the same key can never reorder, while operations on unrelated keys are
//! serviced independently.
//!
//! # Results
//! Every operation returns a [`Pending`] handle backed by a oneshot channel.
//! If the store is already loaded the handle is resolved before the call
//! returns; otherwise it resolves when the deferred task replays. Queued
//! operations are never cancelled.
//!
//! # Backing-store sync
//! Mutations record their sync and notification side effects while the lock
//! is held and dispatch them after it is released; backend callbacks
//! re-acquire the lock before touching state. No I/O ever happens under the
//! lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use http::HeaderMap;
use time::{Duration, OffsetDateTime};
use tokio::sync::oneshot;
use url::Url;

use crate::canon;
use crate::cookie::{Cookie, CookiePriority};
use crate::dedup;
use crate::errors::Canceled;
use crate::events::{ChangeCause, CookieDelegateHandle, DeletionCause};
use crate::eviction;
use crate::index::{self, CookieIndex};
use crate::options::CookieOptions;
use crate::parse;
use crate::persistent::PersistentStoreHandle;

/// Reads bump a cookie's access time at most once per this window, to bound
/// write amplification toward the backing store.
pub const DEFAULT_ACCESS_UPDATE_THRESHOLD: Duration = Duration::seconds(60);

/// Handle for the result of a store operation.
///
/// Resolves on the caller's own execution context once the operation has
/// run. Errs with [`Canceled`] only if the store was dropped first.
pub struct Pending<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for Pending<T> {
    type Output = Result<T, Canceled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| Canceled))
    }
}

impl<T> Pending<T> {
    /// Blocking variant for synchronous callers. Must not be used from an
    /// async context.
    pub fn blocking_wait(self) -> Result<T, Canceled> {
        self.rx.blocking_recv().map_err(|_| Canceled)
    }
}

fn resolved<T>(value: T) -> Pending<T> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(value);
    Pending { rx }
}

type Task = Box<dyn FnOnce(&mut Inner) + Send + 'static>;

enum Effect {
    Add(Cookie),
    UpdateAccess(Cookie),
    Delete(Cookie),
    Changed {
        cookie: Cookie,
        removed: bool,
        cause: ChangeCause,
    },
}

pub struct CookieStoreBuilder {
    store: Option<PersistentStoreHandle>,
    delegate: Option<CookieDelegateHandle>,
    persist_session_cookies: bool,
    keep_expired_cookies: bool,
    last_access_threshold: Duration,
}

impl CookieStoreBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            delegate: None,
            persist_session_cookies: false,
            keep_expired_cookies: false,
            last_access_threshold: DEFAULT_ACCESS_UPDATE_THRESHOLD,
        }
    }

    pub fn persistent(mut self, store: PersistentStoreHandle) -> Self {
        self.store = Some(store);
        self
    }

    pub fn delegate(mut self, delegate: CookieDelegateHandle) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Sync session cookies to the backing store as well.
    pub fn persist_session_cookies(mut self, enabled: bool) -> Self {
        self.persist_session_cookies = enabled;
        self
    }

    /// Retain expired cookies instead of purging them.
    pub fn keep_expired_cookies(mut self, enabled: bool) -> Self {
        self.keep_expired_cookies = enabled;
        self
    }

    pub fn last_access_threshold(mut self, threshold: Duration) -> Self {
        self.last_access_threshold = threshold;
        self
    }

    pub fn build(self) -> CookieStore {
        CookieStore {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    index: CookieIndex::new(),
                    // With no backing store there is nothing to load.
                    loaded: self.store.is_none(),
                    load_requested: false,
                    keys_loaded: HashSet::new(),
                    tasks_pending: VecDeque::new(),
                    tasks_pending_for_key: HashMap::new(),
                    seen_creation_times: HashSet::new(),
                    earliest_access: None,
                    last_time_seen: OffsetDateTime::UNIX_EPOCH,
                    persist_session_cookies: self.persist_session_cookies,
                    keep_expired_cookies: self.keep_expired_cookies,
                    last_access_threshold: self.last_access_threshold,
                    has_store: self.store.is_some(),
                    has_delegate: self.delegate.is_some(),
                    effects: Vec::new(),
                }),
                store: self.store,
                delegate: self.delegate,
            }),
        }
    }
}

impl Default for CookieStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The in-process cookie store.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CookieStore {
    shared: Arc<Shared>,
}

struct Shared {
    inner: Mutex<Inner>,
    store: Option<PersistentStoreHandle>,
    delegate: Option<CookieDelegateHandle>,
}

struct Inner {
    index: CookieIndex,
    loaded: bool,
    load_requested: bool,
    keys_loaded: HashSet<String>,
    tasks_pending: VecDeque<Task>,
    tasks_pending_for_key: HashMap<String, VecDeque<Task>>,
    /// Creation times seen while loading; duplicates from the backing store
    /// are dropped. Cleared once the store is fully loaded.
    seen_creation_times: HashSet<i128>,
    /// Oldest last-access time in the store; gates the global purge.
    earliest_access: Option<OffsetDateTime>,
    last_time_seen: OffsetDateTime,
    persist_session_cookies: bool,
    keep_expired_cookies: bool,
    last_access_threshold: Duration,
    has_store: bool,
    has_delegate: bool,
    effects: Vec<Effect>,
}

impl CookieStore {
    pub fn new(
        store: Option<PersistentStoreHandle>,
        delegate: Option<CookieDelegateHandle>,
    ) -> Self {
        let mut builder = CookieStoreBuilder::new();
        if let Some(store) = store {
            builder = builder.persistent(store);
        }
        if let Some(delegate) = delegate {
            builder = builder.delegate(delegate);
        }
        builder.build()
    }

    pub fn builder() -> CookieStoreBuilder {
        CookieStoreBuilder::new()
    }

    /// Stores one `Set-Cookie` line for `url`.
    ///
    /// Resolves to `false` when the scheme is not cookieable, the line does
    /// not canonicalize, or an http-only cookie blocked the overwrite.
    pub fn set_cookie_with_line(
        &self,
        url: &Url,
        line: &str,
        options: CookieOptions,
    ) -> Pending<bool> {
        if !canon::is_cookieable(url) {
            log::debug!("rejecting cookie for unsupported scheme {}", url.scheme());
            return resolved(false);
        }
        let url = url.clone();
        let line = line.to_string();
        self.run_task(key_for_url(&url), move |inner| {
            let creation = inner.next_creation_time();
            match Cookie::from_set_cookie_line(&url, &line, creation, &options) {
                Some(cookie) => inner.set_canonical(cookie, &options),
                None => {
                    log::debug!("failed to canonicalize Set-Cookie line");
                    false
                }
            }
        })
    }

    /// Stores a cookie built from explicit fields. Every field goes through
    /// the same validation the line parser applies.
    #[allow(clippy::too_many_arguments)]
    pub fn set_cookie_with_details(
        &self,
        url: &Url,
        name: &str,
        value: &str,
        domain: &str,
        path: &str,
        expiry: Option<OffsetDateTime>,
        secure: bool,
        http_only: bool,
        priority: CookiePriority,
    ) -> Pending<bool> {
        if !canon::is_cookieable(url) {
            return resolved(false);
        }
        let url = url.clone();
        let name = name.to_string();
        let value = value.to_string();
        let domain = domain.to_string();
        let path = path.to_string();
        self.run_task(key_for_url(&url), move |inner| {
            let creation = inner.next_creation_time();
            let Some(cookie) = Cookie::from_details(
                &url, &name, &value, &domain, &path, expiry, secure, http_only, priority,
                creation,
            ) else {
                return false;
            };
            // Structured callers are trusted with http-only cookies.
            inner.set_canonical(cookie, &CookieOptions::http())
        })
    }

    /// Stores every `Set-Cookie` header in `headers` for `url`, in header
    /// order. Resolves to the number of cookies accepted.
    pub fn store_response_cookies(&self, url: &Url, headers: &HeaderMap) -> Pending<usize> {
        if !canon::is_cookieable(url) {
            return resolved(0);
        }
        let lines: Vec<String> = headers
            .get_all(http::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(String::from)
            .collect();
        let url = url.clone();
        self.run_task(key_for_url(&url), move |inner| {
            let options = CookieOptions::http();
            let mut accepted = 0;
            for line in &lines {
                let creation = inner.next_creation_time();
                if let Some(cookie) = Cookie::from_set_cookie_line(&url, line, creation, &options)
                {
                    if inner.set_canonical(cookie, &options) {
                        accepted += 1;
                    }
                }
            }
            accepted
        })
    }

    /// Cookies to send for a request to `url`, sorted longest-path-first
    /// then earliest-creation. Updates access times (throttled) and purges
    /// expired cookies under the domain key along the way.
    pub fn cookies_for_url(&self, url: &Url, options: CookieOptions) -> Pending<Vec<Cookie>> {
        if !canon::is_cookieable(url) {
            return resolved(Vec::new());
        }
        let url = url.clone();
        self.run_task(key_for_url(&url), move |inner| {
            inner.find_cookies(&url, &options, true)
        })
    }

    /// The `Cookie:` request header value for `url`, or `None` when nothing
    /// matches.
    pub fn cookie_header_for_url(
        &self,
        url: &Url,
        options: CookieOptions,
    ) -> Pending<Option<String>> {
        if !canon::is_cookieable(url) {
            return resolved(None);
        }
        let url = url.clone();
        self.run_task(key_for_url(&url), move |inner| {
            let cookies = inner.find_cookies(&url, &options, true);
            build_cookie_line(&cookies)
        })
    }

    /// Every cookie in the store, sorted for output. Purges expired cookies
    /// store-wide first.
    pub fn all_cookies(&self) -> Pending<Vec<Cookie>> {
        self.run_task(None, move |inner| {
            let now = OffsetDateTime::now_utc();
            inner.purge_expired_everywhere(now);
            let mut all: Vec<Cookie> = inner.index.iter().map(|(_, c)| c.clone()).collect();
            index::sort_for_output(&mut all);
            all
        })
    }

    /// Deletes the cookies named `name` that would be sent for `url`
    /// (domain match plus path prefix match). Resolves to whether anything
    /// was deleted.
    pub fn delete_cookie(&self, url: &Url, name: &str) -> Pending<bool> {
        if !canon::is_cookieable(url) {
            return resolved(false);
        }
        let url = url.clone();
        let name = name.to_string();
        self.run_task(key_for_url(&url), move |inner| {
            let Some(host) = url.host_str() else {
                return false;
            };
            let key = canon::domain_key(host);
            let victims: Vec<i128> = inner
                .index
                .bucket(&key)
                .iter()
                .filter(|c| {
                    c.name() == name && c.matches_domain(host) && c.is_on_path(url.path())
                })
                .map(Cookie::creation_id)
                .collect();
            for id in &victims {
                inner.internal_delete(&key, *id, DeletionCause::Explicit, true);
            }
            !victims.is_empty()
        })
    }

    /// Deletes everything. Resolves to the number of cookies deleted.
    pub fn delete_all(&self) -> Pending<usize> {
        self.run_task(None, move |inner| {
            let all: Vec<(String, i128)> = inner
                .index
                .iter()
                .map(|(k, c)| (k.to_string(), c.creation_id()))
                .collect();
            for (key, id) in &all {
                inner.internal_delete(key, *id, DeletionCause::Explicit, true);
            }
            all.len()
        })
    }

    /// Deletes cookies created in `[begin, end)`; an absent `end` means
    /// unbounded.
    pub fn delete_all_created_between(
        &self,
        begin: OffsetDateTime,
        end: Option<OffsetDateTime>,
    ) -> Pending<usize> {
        self.run_task(None, move |inner| {
            let victims: Vec<(String, i128)> = inner
                .index
                .iter()
                .filter(|(_, c)| {
                    c.creation() >= begin && end.map_or(true, |e| c.creation() < e)
                })
                .map(|(k, c)| (k.to_string(), c.creation_id()))
                .collect();
            for (key, id) in &victims {
                inner.internal_delete(key, *id, DeletionCause::Explicit, true);
            }
            victims.len()
        })
    }

    /// Flushes the backing store, then invokes `callback`.
    pub fn flush(&self, callback: impl FnOnce() + Send + 'static) {
        match &self.shared.store {
            Some(store) => store.flush(Box::new(callback)),
            None => callback(),
        }
    }

    /// Asks the backing store to keep session cookies across shutdown.
    pub fn set_force_keep_session_state(&self) {
        if let Some(store) = &self.shared.store {
            store.set_force_keep_session_state();
        }
    }

    fn run_task<T, F>(&self, key: Option<String>, f: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Inner) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task: Task = Box::new(move |inner| {
            let _ = tx.send(f(inner));
        });

        let mut needs_global_load = false;
        let mut needs_key_load: Option<String> = None;
        let mut effects = Vec::new();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if !inner.loaded {
                if !inner.load_requested {
                    inner.load_requested = true;
                    needs_global_load = true;
                }
                match key {
                    Some(key) if !inner.keys_loaded.contains(&key) => {
                        if !inner.tasks_pending_for_key.contains_key(&key) {
                            needs_key_load = Some(key.clone());
                        }
                        inner
                            .tasks_pending_for_key
                            .entry(key)
                            .or_default()
                            .push_back(task);
                    }
                    Some(_) => {
                        task(&mut inner);
                        effects = inner.take_effects();
                    }
                    None => inner.tasks_pending.push_back(task),
                }
            } else if let Some(queue) =
                key.as_ref().and_then(|k| inner.tasks_pending_for_key.get_mut(k))
            {
                // The global load finished while this key's own load was
                // still in flight; stay behind the queued work.
                queue.push_back(task);
            } else {
                task(&mut inner);
                effects = inner.take_effects();
            }
        }

        // The key load goes out first so a backend with synchronous
        // callbacks primes the key before the full load drains the queues.
        if let Some(key) = needs_key_load {
            self.issue_key_load(key);
        }
        if needs_global_load {
            self.issue_global_load();
        }
        self.dispatch_effects(effects);

        Pending { rx }
    }

    fn issue_global_load(&self) {
        let Some(store) = &self.shared.store else {
            return;
        };
        let this = self.clone();
        store.load(Box::new(move |cookies| this.on_loaded(cookies)));
    }

    fn issue_key_load(&self, key: String) {
        let Some(store) = &self.shared.store else {
            return;
        };
        let this = self.clone();
        let callback_key = key.clone();
        store.load_for_key(
            &key,
            Box::new(move |cookies| this.on_key_loaded(callback_key, cookies)),
        );
    }

    /// Global load completion: merge, then drain the global FIFO in arrival
    /// order until it is empty.
    fn on_loaded(&self, cookies: Vec<Cookie>) {
        let effects = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.merge_loaded(cookies);
            inner.take_effects()
        };
        self.dispatch_effects(effects);

        loop {
            let task = {
                let mut inner = self.shared.inner.lock().unwrap();
                match inner.tasks_pending.pop_front() {
                    Some(task) => Some(task),
                    None => {
                        inner.loaded = true;
                        inner.seen_creation_times.clear();
                        inner.keys_loaded.clear();
                        None
                    }
                }
            };
            let Some(task) = task else {
                break;
            };
            let effects = {
                let mut inner = self.shared.inner.lock().unwrap();
                task(&mut inner);
                inner.take_effects()
            };
            self.dispatch_effects(effects);
        }

        if let Some(delegate) = &self.shared.delegate {
            delegate.on_loaded();
        }
    }

    /// Key load completion: merge, then drain this key's FIFO — looping so
    /// work enqueued mid-drain is picked up — and mark the key primed.
    fn on_key_loaded(&self, key: String, cookies: Vec<Cookie>) {
        let effects = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.merge_loaded(cookies);
            inner.take_effects()
        };
        self.dispatch_effects(effects);

        loop {
            let batch = {
                let mut inner = self.shared.inner.lock().unwrap();
                match inner.tasks_pending_for_key.get_mut(&key) {
                    None => {
                        inner.keys_loaded.insert(key.clone());
                        None
                    }
                    Some(queue) if queue.is_empty() => {
                        inner.tasks_pending_for_key.remove(&key);
                        inner.keys_loaded.insert(key.clone());
                        None
                    }
                    Some(queue) => Some(std::mem::take(queue)),
                }
            };
            let Some(batch) = batch else {
                break;
            };
            for task in batch {
                let effects = {
                    let mut inner = self.shared.inner.lock().unwrap();
                    task(&mut inner);
                    inner.take_effects()
                };
                self.dispatch_effects(effects);
            }
        }
    }

    fn dispatch_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Add(cookie) => {
                    if let Some(store) = &self.shared.store {
                        store.add(&cookie);
                    }
                }
                Effect::UpdateAccess(cookie) => {
                    if let Some(store) = &self.shared.store {
                        store.update_access_time(&cookie);
                    }
                }
                Effect::Delete(cookie) => {
                    if let Some(store) = &self.shared.store {
                        store.delete(&cookie);
                    }
                }
                Effect::Changed {
                    cookie,
                    removed,
                    cause,
                } => {
                    if let Some(delegate) = &self.shared.delegate {
                        delegate.on_changed(&cookie, removed, cause);
                    }
                }
            }
        }
    }
}

fn key_for_url(url: &Url) -> Option<String> {
    url.host_str().map(canon::domain_key)
}

fn build_cookie_line(cookies: &[Cookie]) -> Option<String> {
    if cookies.is_empty() {
        return None;
    }
    let line = cookies
        .iter()
        .map(|c| {
            if c.name().is_empty() {
                c.value().to_string()
            } else {
                format!("{}={}", c.name(), c.value())
            }
        })
        .collect::<Vec<_>>()
        .join("; ");
    Some(line)
}

impl Inner {
    fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// Monotonically unique creation timestamp; ties with the last one
    /// handed out are broken by a one-microsecond tick.
    fn next_creation_time(&mut self) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        let next = self.last_time_seen + Duration::microseconds(1);
        let t = if now > next { now } else { next };
        self.last_time_seen = t;
        t
    }

    fn internal_insert(&mut self, key: &str, cookie: Cookie, sync: bool) {
        if sync && self.has_store && (cookie.is_persistent() || self.persist_session_cookies) {
            self.effects.push(Effect::Add(cookie.clone()));
        }
        if self.has_delegate {
            self.effects.push(Effect::Changed {
                cookie: cookie.clone(),
                removed: false,
                cause: ChangeCause::Explicit,
            });
        }
        self.index.insert(key.to_string(), cookie);
    }

    /// The single owning-removal path: every deletion goes through here.
    fn internal_delete(&mut self, key: &str, id: i128, cause: DeletionCause, sync: bool) -> bool {
        let Some(cookie) = self.index.remove(key, id) else {
            return false;
        };
        if sync && self.has_store && (cookie.is_persistent() || self.persist_session_cookies) {
            self.effects.push(Effect::Delete(cookie.clone()));
        }
        if self.has_delegate {
            if let Some(cause) = cause.change_cause() {
                self.effects.push(Effect::Changed {
                    cookie,
                    removed: true,
                    cause,
                });
            }
        }
        true
    }

    /// Deletes the record equivalent to `candidate`, if any. Returns true
    /// when an http-only record blocked the overwrite (in which case nothing
    /// was deleted).
    fn delete_any_equivalent(
        &mut self,
        key: &str,
        candidate: &Cookie,
        skip_http_only: bool,
        already_expired: bool,
    ) -> bool {
        let equivalents: Vec<(i128, bool)> = self
            .index
            .bucket(key)
            .iter()
            .filter(|c| c.is_equivalent(candidate))
            .map(|c| (c.creation_id(), c.http_only()))
            .collect();

        assert!(
            equivalents.len() <= 1,
            "duplicate equivalent cookies found, cookie store is corrupted"
        );

        let mut skipped = false;
        for (id, http_only) in equivalents {
            if skip_http_only && http_only {
                log::debug!("not overwriting http-only cookie {:?}", candidate.name());
                skipped = true;
            } else {
                let cause = if already_expired {
                    DeletionCause::ExpiredOverwrite
                } else {
                    DeletionCause::Overwrite
                };
                self.internal_delete(key, id, cause, true);
            }
        }
        skipped
    }

    fn set_canonical(&mut self, cookie: Cookie, options: &CookieOptions) -> bool {
        let key = canon::domain_key(cookie.domain());
        let creation = cookie.creation();
        let already_expired = cookie.is_expired(creation);

        if self.delete_any_equivalent(&key, &cookie, options.exclude_http_only, already_expired) {
            return false;
        }

        // An expired candidate only served to delete its predecessor.
        if !already_expired || self.keep_expired_cookies {
            self.internal_insert(&key, cookie, true);
        }

        self.collect_garbage(creation, &key);
        true
    }

    fn collect_garbage(&mut self, now: OffsetDateTime, key: &str) {
        let safe_date = now - Duration::days(eviction::SAFE_FROM_GLOBAL_PURGE_DAYS);

        let plan =
            eviction::domain_purge_plan(self.index.bucket(key), now, safe_date, self.keep_expired_cookies);
        for (id, cause) in plan {
            self.internal_delete(key, id, cause, true);
        }

        let (plan, new_earliest) = eviction::global_purge_plan(
            &self.index,
            now,
            safe_date,
            self.earliest_access,
            self.keep_expired_cookies,
        );
        for item in plan {
            self.internal_delete(&item.key, item.id, item.cause, true);
        }
        if new_earliest.is_some() {
            self.earliest_access = new_earliest;
        }
    }

    fn find_cookies(
        &mut self,
        url: &Url,
        options: &CookieOptions,
        update_access: bool,
    ) -> Vec<Cookie> {
        let now = OffsetDateTime::now_utc();
        let Some(host) = url.host_str() else {
            return Vec::new();
        };
        let key = canon::domain_key(host);

        if !self.keep_expired_cookies {
            let expired: Vec<i128> = self
                .index
                .bucket(&key)
                .iter()
                .filter(|c| c.is_expired(now))
                .map(Cookie::creation_id)
                .collect();
            for id in expired {
                self.internal_delete(&key, id, DeletionCause::Expired, true);
            }
        }

        let mut out = Vec::new();
        let Some(bucket) = self.index.bucket_mut(&key) else {
            return out;
        };
        for cookie in bucket.iter_mut() {
            if !cookie.should_include(url, options) {
                continue;
            }
            if update_access && now - cookie.last_access() >= self.last_access_threshold {
                cookie.set_last_access(now);
                if self.has_store
                    && (cookie.is_persistent() || self.persist_session_cookies)
                {
                    self.effects.push(Effect::UpdateAccess(cookie.clone()));
                }
            }
            out.push(cookie.clone());
        }
        index::sort_for_output(&mut out);
        out
    }

    fn purge_expired_everywhere(&mut self, now: OffsetDateTime) {
        if self.keep_expired_cookies {
            return;
        }
        let expired: Vec<(String, i128)> = self
            .index
            .iter()
            .filter(|(_, c)| c.is_expired(now))
            .map(|(k, c)| (k.to_string(), c.creation_id()))
            .collect();
        for (key, id) in expired {
            self.internal_delete(&key, id, DeletionCause::Expired, true);
        }
    }

    /// Merges a batch of records from the backing store: creation-time
    /// collisions are dropped and logged, control-character records are
    /// deleted after merge, and each equivalence class is trimmed to its
    /// most recently created member (those deletions are synced but
    /// silent).
    fn merge_loaded(&mut self, cookies: Vec<Cookie>) {
        let mut flagged: Vec<(String, i128)> = Vec::new();
        for cookie in cookies {
            let id = cookie.creation_id();
            if !self.seen_creation_times.insert(id) {
                log::error!(
                    "found cookies with duplicate creation times in backing store: \
                     {{name='{}', domain='{}', path='{}'}}",
                    cookie.name(),
                    cookie.domain(),
                    cookie.path()
                );
                continue;
            }

            let key = canon::domain_key(cookie.domain());
            // A key load that completes after the full load re-delivers
            // records the dedup set no longer remembers.
            if self
                .index
                .bucket(&key)
                .iter()
                .any(|c| c.creation_id() == id)
            {
                continue;
            }
            let access = cookie.last_access();
            if self.earliest_access.map_or(true, |e| access < e) {
                self.earliest_access = Some(access);
            }
            let has_control_chars = parse::contains_control_chars(cookie.name())
                || parse::contains_control_chars(cookie.value());

            // Expired records are merged too; they get purged (and synced
            // out of the backing store) on the usual paths.
            self.internal_insert(&key, cookie, false);
            if has_control_chars {
                flagged.push((key, id));
            }
        }

        for (key, id) in flagged {
            self.internal_delete(&key, id, DeletionCause::ControlChar, true);
        }

        for key in self.index.keys() {
            let victims = dedup::duplicate_victims(self.index.bucket(&key));
            for id in victims {
                self.internal_delete(&key, id, DeletionCause::DuplicateInBackingStore, true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CookieDelegate;
    use crate::persistent::{InMemoryPersistentStore, StoreOp};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    async fn set_line(store: &CookieStore, u: &str, line: &str) -> bool {
        store
            .set_cookie_with_line(&url(u), line, CookieOptions::http())
            .await
            .unwrap()
    }

    async fn header_for(store: &CookieStore, u: &str) -> Option<String> {
        store
            .cookie_header_for_url(&url(u), CookieOptions::http())
            .await
            .unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(String, bool, ChangeCause)>>,
        loaded: AtomicBool,
    }

    impl CookieDelegate for Recorder {
        fn on_changed(&self, cookie: &Cookie, removed: bool, cause: ChangeCause) {
            self.events
                .lock()
                .unwrap()
                .push((cookie.name().to_string(), removed, cause));
        }

        fn on_loaded(&self) {
            self.loaded.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn set_and_get_simple() {
        let store = CookieStore::new(None, None);
        assert!(set_line(&store, "http://www.example.com/", "A=B").await);
        assert_eq!(
            header_for(&store, "http://www.example.com/").await,
            Some("A=B".to_string())
        );
        // Sibling subdomain shares the key but does not match a host cookie.
        assert_eq!(header_for(&store, "http://other.example.com/").await, None);
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let store = CookieStore::new(None, None);
        assert!(
            !store
                .set_cookie_with_line(&url("ftp://example.com/"), "A=B", CookieOptions::http())
                .await
                .unwrap()
        );
        assert!(store
            .cookies_for_url(&url("ftp://example.com/"), CookieOptions::http())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn equivalent_insert_overwrites() {
        let recorder = Arc::new(Recorder::default());
        let store = CookieStore::new(None, Some(recorder.clone()));

        assert!(set_line(&store, "http://www.example.com/", "A=B").await);
        assert!(set_line(&store, "http://www.example.com/", "A=C").await);

        let all = store.all_cookies().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value(), "C");

        let events = recorder.events.lock().unwrap();
        assert!(events.contains(&("A".to_string(), true, ChangeCause::Overwrite)));
    }

    #[tokio::test]
    async fn creation_times_stay_unique() {
        let store = CookieStore::new(None, None);
        for i in 0..50 {
            assert!(set_line(&store, "http://www.example.com/", &format!("c{i}=v")).await);
        }
        let all = store.all_cookies().await.unwrap();
        let mut ids: Vec<i128> = all.iter().map(Cookie::creation_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 50);

        assert_eq!(store.delete_all().await.unwrap(), 50);
        assert!(store.all_cookies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn http_only_cookie_resists_scripted_overwrite() {
        let store = CookieStore::new(None, None);
        assert!(set_line(&store, "http://www.example.com/", "A=B; HttpOnly").await);

        let blocked = store
            .set_cookie_with_line(&url("http://www.example.com/"), "A=C", CookieOptions::scripted())
            .await
            .unwrap();
        assert!(!blocked);
        assert_eq!(
            header_for(&store, "http://www.example.com/").await,
            Some("A=B".to_string())
        );

        // The HTTP context may overwrite it.
        assert!(set_line(&store, "http://www.example.com/", "A=C").await);
        assert_eq!(
            header_for(&store, "http://www.example.com/").await,
            Some("A=C".to_string())
        );
    }

    #[tokio::test]
    async fn expired_candidate_deletes_predecessor() {
        let store = CookieStore::new(None, None);
        assert!(set_line(&store, "http://www.example.com/", "A=B").await);
        assert!(set_line(&store, "http://www.example.com/", "A=gone; Max-Age=-1").await);
        assert_eq!(header_for(&store, "http://www.example.com/").await, None);
        assert!(store.all_cookies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn query_output_order() {
        let store = CookieStore::new(None, None);
        assert!(set_line(&store, "http://www.example.com/", "root=1; Path=/").await);
        assert!(set_line(&store, "http://www.example.com/foo/", "deep=2; Path=/foo").await);
        assert_eq!(
            header_for(&store, "http://www.example.com/foo/bar").await,
            Some("deep=2; root=1".to_string())
        );
        // `/foobar` is not on path `/foo`.
        assert_eq!(
            header_for(&store, "http://www.example.com/foobar").await,
            Some("root=1".to_string())
        );
    }

    #[tokio::test]
    async fn delete_cookie_uses_prefix_path_match() {
        let store = CookieStore::new(None, None);
        assert!(set_line(&store, "http://www.example.com/foo/", "A=B; Path=/foo").await);

        // `/bar` is not a prefix match for the cookie's `/foo`.
        assert!(
            !store
                .delete_cookie(&url("http://www.example.com/bar"), "A")
                .await
                .unwrap()
        );
        assert!(store
            .delete_cookie(&url("http://www.example.com/foo/baz"), "A")
            .await
            .unwrap());
        assert!(store.all_cookies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn response_headers_are_stored_in_order() {
        let store = CookieStore::new(None, None);
        let mut headers = HeaderMap::new();
        headers.append(
            http::header::SET_COOKIE,
            http::HeaderValue::from_static("A=1"),
        );
        headers.append(
            http::header::SET_COOKIE,
            http::HeaderValue::from_static("B=2; Path=/x"),
        );
        headers.append(
            http::header::SET_COOKIE,
            http::HeaderValue::from_static("bad name=3"),
        );

        let stored = store
            .store_response_cookies(&url("http://www.example.com/x/"), &headers)
            .await
            .unwrap();
        assert_eq!(stored, 2);
        // Equal path lengths, so header order (creation order) decides.
        assert_eq!(
            header_for(&store, "http://www.example.com/x/y").await,
            Some("A=1; B=2".to_string())
        );
    }

    #[tokio::test]
    async fn flush_invokes_callback() {
        let backing = InMemoryPersistentStore::new();
        let store = CookieStore::new(Some(backing), None);

        let (tx, rx) = std::sync::mpsc::channel();
        store.flush(move || {
            let _ = tx.send(());
        });
        rx.recv().unwrap();

        // Without a backing store the callback still runs.
        let (tx, rx) = std::sync::mpsc::channel();
        CookieStore::new(None, None).flush(move || {
            let _ = tx.send(());
        });
        rx.recv().unwrap();
    }

    #[tokio::test]
    async fn delete_all_created_between_honors_range() {
        let store = CookieStore::new(None, None);
        assert!(set_line(&store, "http://www.example.com/", "old=1").await);
        let all = store.all_cookies().await.unwrap();
        let boundary = all[0].creation() + Duration::microseconds(1);
        assert!(set_line(&store, "http://www.example.com/", "new=1").await);

        let deleted = store
            .delete_all_created_between(boundary, None)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(
            header_for(&store, "http://www.example.com/").await,
            Some("old=1".to_string())
        );
    }

    async fn run_priority_case(spec: &[(usize, CookiePriority)]) -> (usize, usize, usize) {
        let store = CookieStore::new(None, None);
        let u = url("http://www.gc-case.com/");
        let mut serial = 0usize;
        for (count, priority) in spec {
            for _ in 0..*count {
                let ok = store
                    .set_cookie_with_details(
                        &u,
                        &format!("a{serial}"),
                        "v",
                        "",
                        "",
                        Some(OffsetDateTime::now_utc() + Duration::days(30)),
                        false,
                        false,
                        *priority,
                    )
                    .await
                    .unwrap();
                assert!(ok);
                serial += 1;
            }
        }

        let mut counts = (0, 0, 0);
        for c in store.all_cookies().await.unwrap() {
            match c.priority() {
                CookiePriority::Low => counts.0 += 1,
                CookiePriority::Medium => counts.1 += 1,
                CookiePriority::High => counts.2 += 1,
            }
        }
        counts
    }

    #[tokio::test]
    async fn priority_eviction_single_bucket() {
        init_logging();
        assert_eq!(
            run_priority_case(&[(181, CookiePriority::Low)]).await,
            (150, 0, 0)
        );
        assert_eq!(
            run_priority_case(&[(181, CookiePriority::Medium)]).await,
            (0, 150, 0)
        );
        assert_eq!(
            run_priority_case(&[(181, CookiePriority::High)]).await,
            (0, 0, 150)
        );
    }

    #[tokio::test]
    async fn priority_eviction_mixed_buckets() {
        assert_eq!(
            run_priority_case(&[(10, CookiePriority::High), (171, CookiePriority::Medium)]).await,
            (0, 140, 10)
        );
        assert_eq!(
            run_priority_case(&[(141, CookiePriority::Medium), (40, CookiePriority::Low)]).await,
            (30, 120, 0)
        );
    }

    #[tokio::test]
    async fn eviction_takes_least_recently_accessed_first() {
        let store = CookieStore::new(None, None);
        assert!(set_line(&store, "http://www.lra.com/", "A=B; Priority=Low").await);
        for i in 0..180 {
            assert!(
                set_line(&store, "http://www.lra.com/", &format!("c{i}=v; Priority=Low")).await
            );
        }

        let all = store.all_cookies().await.unwrap();
        assert_eq!(all.len(), 150);
        assert!(!all.iter().any(|c| c.name() == "A"));
        // The newest cookies survive.
        assert!(all.iter().any(|c| c.name() == "c179"));
    }

    #[tokio::test]
    async fn task_ordering_survives_deferred_load() {
        let backing = InMemoryPersistentStore::with_deferred_load();
        let recorder = Arc::new(Recorder::default());
        let store = CookieStore::new(Some(backing.clone()), Some(recorder.clone()));

        let u = url("http://www.example.com/");
        let first = store.set_cookie_with_line(&u, "A=B", CookieOptions::http());
        let second = store.set_cookie_with_line(&u, "A=C", CookieOptions::http());
        let query = store.cookie_header_for_url(&u, CookieOptions::http());

        assert!(!recorder.loaded.load(Ordering::SeqCst));
        backing.complete_key_load("example.com");

        assert!(first.await.unwrap());
        assert!(second.await.unwrap());
        assert_eq!(query.await.unwrap(), Some("A=C".to_string()));

        // The global queue drains (and on_loaded fires) once the full load
        // completes.
        let all = store.all_cookies();
        backing.complete_load();
        assert_eq!(all.await.unwrap().len(), 1);
        assert!(recorder.loaded.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unprimed_keys_are_serviced_independently() {
        let backing = InMemoryPersistentStore::with_deferred_load();
        let store = CookieStore::new(Some(backing.clone()), None);

        let slow = store.set_cookie_with_line(
            &url("http://www.slow.com/"),
            "s=1",
            CookieOptions::http(),
        );
        let fast = store.set_cookie_with_line(
            &url("http://www.fast.com/"),
            "f=1",
            CookieOptions::http(),
        );

        // Completing the second key first services it without waiting for
        // the first.
        backing.complete_key_load("fast.com");
        assert!(fast.await.unwrap());

        backing.complete_key_load("slow.com");
        assert!(slow.await.unwrap());
    }

    #[tokio::test]
    async fn primed_key_runs_synchronously_before_global_load() {
        let backing = InMemoryPersistentStore::with_deferred_load();
        let store = CookieStore::new(Some(backing.clone()), None);

        let u = url("http://www.example.com/");
        let first = store.set_cookie_with_line(&u, "A=B", CookieOptions::http());
        backing.complete_key_load("example.com");
        assert!(first.await.unwrap());

        // The key is primed now; this resolves with the global load still
        // pending.
        let header = store.cookie_header_for_url(&u, CookieOptions::http());
        assert_eq!(header.await.unwrap(), Some("A=B".to_string()));
    }

    fn seeded_cookie(name: &str, value: &str, secs: i64) -> Cookie {
        let t = time::macros::datetime!(2025-01-01 00:00:00 UTC) + Duration::seconds(secs);
        Cookie::from_parts(
            "http://www.example.com".into(),
            name.into(),
            value.into(),
            "www.example.com".into(),
            "/".into(),
            t,
            Some(t + Duration::days(3650)),
            t,
            false,
            false,
            CookiePriority::Medium,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn load_deduplicates_equivalence_classes() {
        init_logging();
        let backing = InMemoryPersistentStore::new();
        backing.seed(vec![
            seeded_cookie("X", "v0", 0),
            seeded_cookie("X", "v3", 3),
            seeded_cookie("X", "v1", 1),
            seeded_cookie("X", "v2", 2),
        ]);
        let store = CookieStore::new(Some(backing.clone()), None);

        let all = store.all_cookies().await.unwrap();
        assert_eq!(all.len(), 1);
        // The most recently created member wins.
        assert_eq!(all[0].value(), "v3");
        assert_eq!(backing.delete_ops(), 3);
    }

    #[tokio::test]
    async fn load_drops_duplicate_creation_times() {
        init_logging();
        // One record delivered twice: once by the key-scoped load, once by
        // the global load re-delivering the full set.
        let backing = InMemoryPersistentStore::new();
        backing.seed(vec![seeded_cookie("X", "v", 0)]);
        let store = CookieStore::new(Some(backing.clone()), None);

        // Key load merges the record once; the global load re-delivers it
        // and the duplicate creation time is dropped instead of merged.
        assert_eq!(
            header_for(&store, "http://www.example.com/").await,
            Some("X=v".to_string())
        );
        let all = store.all_cookies().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn load_deletes_control_character_records() {
        let backing = InMemoryPersistentStore::new();
        backing.seed(vec![
            seeded_cookie("bad\u{1}name", "v", 0),
            seeded_cookie("good", "v", 1),
        ]);
        let store = CookieStore::new(Some(backing.clone()), None);

        let all = store.all_cookies().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name(), "good");
        assert_eq!(backing.delete_ops(), 1);
    }

    #[tokio::test]
    async fn persisted_cookies_round_trip() {
        let backing = InMemoryPersistentStore::new();
        let store = CookieStore::new(Some(backing.clone()), None);

        let expiry = OffsetDateTime::now_utc() + Duration::days(7);
        let ok = store
            .set_cookie_with_details(
                &url("https://www.example.com/"),
                "session",
                "abc123",
                "example.com",
                "/account",
                Some(expiry),
                true,
                true,
                CookiePriority::High,
            )
            .await
            .unwrap();
        assert!(ok);

        // A fresh store over the same backing data sees the same cookie.
        let second_backing = InMemoryPersistentStore::new();
        second_backing.seed(backing.records());
        let reloaded = CookieStore::new(Some(second_backing), None);
        let all = reloaded.all_cookies().await.unwrap();
        assert_eq!(all.len(), 1);
        let got = &all[0];
        assert_eq!(got.name(), "session");
        assert_eq!(got.value(), "abc123");
        assert_eq!(got.domain(), ".example.com");
        assert_eq!(got.path(), "/account");
        assert!(got.secure());
        assert!(got.http_only());
        assert_eq!(got.priority(), CookiePriority::High);
        assert_eq!(
            got.expiry().map(|e| e.unix_timestamp()),
            Some(expiry.unix_timestamp())
        );
    }

    #[tokio::test]
    async fn session_cookies_are_not_synced_by_default() {
        let backing = InMemoryPersistentStore::new();
        let store = CookieStore::new(Some(backing.clone()), None);

        assert!(set_line(&store, "http://www.example.com/", "s=1").await);
        assert!(set_line(&store, "http://www.example.com/", "p=1; Max-Age=3600").await);

        let adds: Vec<StoreOp> = backing
            .ops()
            .into_iter()
            .filter(|op| matches!(op, StoreOp::Add(_)))
            .collect();
        assert_eq!(adds.len(), 1);
    }

    #[tokio::test]
    async fn persist_session_cookies_syncs_everything() {
        let backing = InMemoryPersistentStore::new();
        let store = CookieStore::builder()
            .persistent(backing.clone())
            .persist_session_cookies(true)
            .build();

        assert!(set_line(&store, "http://www.example.com/", "s=1").await);
        assert_eq!(
            backing
                .ops()
                .iter()
                .filter(|op| matches!(op, StoreOp::Add(_)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn access_time_updates_are_throttled() {
        let backing = InMemoryPersistentStore::new();
        let store = CookieStore::new(Some(backing.clone()), None);

        assert!(set_line(&store, "http://www.example.com/", "p=1; Max-Age=3600").await);
        for _ in 0..3 {
            assert!(header_for(&store, "http://www.example.com/").await.is_some());
        }
        // All reads fall within the 60s window of the creation time.
        assert!(!backing
            .ops()
            .iter()
            .any(|op| matches!(op, StoreOp::UpdateAccess(_))));

        // With the throttle disabled every read syncs.
        let backing = InMemoryPersistentStore::new();
        let store = CookieStore::builder()
            .persistent(backing.clone())
            .last_access_threshold(Duration::ZERO)
            .build();
        assert!(set_line(&store, "http://www.example.com/", "p=1; Max-Age=3600").await);
        assert!(header_for(&store, "http://www.example.com/").await.is_some());
        assert!(backing
            .ops()
            .iter()
            .any(|op| matches!(op, StoreOp::UpdateAccess(_))));
    }

    #[tokio::test]
    async fn global_purge_drops_stale_records() {
        init_logging();
        let backing = InMemoryPersistentStore::new();
        let stale_start = OffsetDateTime::now_utc() - Duration::days(40);
        let mut seeds = Vec::new();
        for i in 0..3310i64 {
            let t = stale_start + Duration::seconds(i);
            seeds.push(
                Cookie::from_parts(
                    "http://seed.com".into(),
                    format!("c{i}"),
                    "v".into(),
                    format!("host{}.seed{}.com", i % 7, i % 473),
                    "/".into(),
                    t,
                    Some(t + Duration::days(3650)),
                    t,
                    false,
                    false,
                    CookiePriority::Medium,
                )
                .unwrap(),
            );
        }
        backing.seed(seeds);
        let store = CookieStore::new(Some(backing.clone()), None);

        // The first insert races the load; the second runs with the full
        // set merged and tips the store over the global limit.
        assert!(set_line(&store, "http://www.fresh.com/", "f=1; Max-Age=3600").await);
        assert!(set_line(&store, "http://www.fresh.com/", "g=1; Max-Age=3600").await);

        let all = store.all_cookies().await.unwrap();
        // 3312 - (3300 - 300) = 312 stale records evicted; the fresh
        // cookies survive.
        assert_eq!(all.len(), 3000);
        assert!(all.iter().any(|c| c.name() == "f"));
        assert!(all.iter().any(|c| c.name() == "g"));
    }
}
