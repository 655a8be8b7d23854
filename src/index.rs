//! In-memory cookie collection: a multi-valued map from domain key to owned
//! records. All deletion paths go through [`CookieIndex::remove`], keyed by
//! the record's creation identity.

use std::collections::HashMap;

use crate::cookie::Cookie;

#[derive(Debug, Default)]
pub(crate) struct CookieIndex {
    buckets: HashMap<String, Vec<Cookie>>,
    total: usize,
}

impl CookieIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, cookie: Cookie) {
        self.buckets.entry(key).or_default().push(cookie);
        self.total += 1;
    }

    /// Removes and returns the record identified by `id` under `key`.
    pub fn remove(&mut self, key: &str, id: i128) -> Option<Cookie> {
        let bucket = self.buckets.get_mut(key)?;
        let pos = bucket.iter().position(|c| c.creation_id() == id)?;
        let cookie = bucket.swap_remove(pos);
        self.total -= 1;
        if bucket.is_empty() {
            self.buckets.remove(key);
        }
        Some(cookie)
    }

    pub fn bucket(&self, key: &str) -> &[Cookie] {
        self.buckets.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn bucket_mut(&mut self, key: &str) -> Option<&mut Vec<Cookie>> {
        self.buckets.get_mut(key)
    }

    pub fn bucket_len(&self, key: &str) -> usize {
        self.buckets.get(key).map_or(0, Vec::len)
    }

    pub fn total_len(&self) -> usize {
        self.total
    }

    pub fn keys(&self) -> Vec<String> {
        self.buckets.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Cookie)> {
        self.buckets
            .iter()
            .flat_map(|(k, v)| v.iter().map(move |c| (k.as_str(), c)))
    }

    /// Returns the record equivalent to `candidate` under `key`, if any.
    pub fn find_equivalent(&self, key: &str, candidate: &Cookie) -> Option<&Cookie> {
        self.bucket(key).iter().find(|c| c.is_equivalent(candidate))
    }
}

/// Output order for query results: longest path first, ties broken by
/// earliest creation. Creation times are unique, so the order is total.
pub(crate) fn sort_for_output(cookies: &mut [Cookie]) {
    cookies.sort_by(|a, b| {
        b.path()
            .len()
            .cmp(&a.path().len())
            .then_with(|| a.creation().cmp(&b.creation()))
    });
}
