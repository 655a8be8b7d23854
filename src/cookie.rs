//! The canonical cookie record.
//!
//! A [`Cookie`] is the immutable-by-convention value stored by the engine:
//! everything is fixed at construction except the last-access timestamp,
//! which the store bumps (throttled) on reads. The creation timestamp is
//! unique across the whole store and doubles as the record's identity key.
//!
//! Construction goes through one of three paths:
//! - [`Cookie::from_set_cookie_line`]: a raw `Set-Cookie` line plus request
//!   URL, via the parser contract in [`crate::parse`].
//! - [`Cookie::from_details`]: explicit fields; every field is re-validated
//!   through the same rules the parser applies, so callers cannot smuggle
//!   separators past the structured API.
//! - [`Cookie::from_parts`]: rehydration from a backing store; only the
//!   structural invariants (non-empty domain and path) are enforced, since
//!   historically malformed persisted data is cleaned up on load instead.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use url::Url;

use crate::canon;
use crate::options::CookieOptions;
use crate::parse;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum CookiePriority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    /// Origin the cookie was set from (`scheme://host:port`).
    source: String,
    name: String,
    value: String,
    /// Leading `.` marks a domain cookie (host plus subdomains); no leading
    /// `.` marks a host cookie (exact host only).
    domain: String,
    /// Always non-empty, always starts with `/`.
    path: String,
    #[serde(with = "time::serde::rfc3339")]
    creation: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    expiry: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    last_access: OffsetDateTime,
    secure: bool,
    http_only: bool,
    priority: CookiePriority,
}

impl Cookie {
    /// Builds a cookie from a parsed `Set-Cookie` line.
    ///
    /// Fails when the line does not parse, when the line requests http-only
    /// but the caller context excludes http-only cookies, or when the domain
    /// attribute cannot be resolved against `url`.
    pub fn from_set_cookie_line(
        url: &Url,
        line: &str,
        creation: OffsetDateTime,
        options: &CookieOptions,
    ) -> Option<Cookie> {
        let parsed = parse::parse_set_cookie_line(line)?;
        if parsed.http_only && options.exclude_http_only {
            return None;
        }

        let domain = canon::effective_domain(url, parsed.domain.as_deref().unwrap_or(""))?;
        let path = match parsed.path {
            Some(p) => p,
            None => canon::default_path(url),
        };

        // Max-Age wins over Expires; Expires is skew-corrected against the
        // server clock when the caller provided one.
        let expiry = if let Some(seconds) = parsed.max_age {
            Some(creation + Duration::seconds(seconds))
        } else {
            parsed.expires.map(|expires| match options.server_time {
                Some(server) => creation + (expires - server),
                None => expires,
            })
        };

        Some(Cookie {
            source: url.origin().ascii_serialization(),
            name: parsed.name,
            value: parsed.value,
            domain,
            path,
            creation,
            expiry,
            last_access: creation,
            secure: parsed.secure,
            http_only: parsed.http_only,
            priority: parsed.priority.unwrap_or_default(),
        })
    }

    /// Builds a cookie from explicit fields.
    ///
    /// Every string is held to the same validation the line parser applies.
    /// A non-empty `path` must survive canonicalization literally; there is
    /// no silent substitution of the default path once a path was requested.
    #[allow(clippy::too_many_arguments)]
    pub fn from_details(
        url: &Url,
        name: &str,
        value: &str,
        domain: &str,
        path: &str,
        expiry: Option<OffsetDateTime>,
        secure: bool,
        http_only: bool,
        priority: CookiePriority,
        creation: OffsetDateTime,
    ) -> Option<Cookie> {
        if !parse::is_valid_token(name) || name.trim() != name {
            return None;
        }
        if !parse::is_valid_value(value) {
            return None;
        }
        if name.is_empty() && value.is_empty() {
            return None;
        }

        let resolved_domain = canon::effective_domain(url, domain)?;

        let resolved_path = if path.is_empty() {
            canon::default_path(url)
        } else {
            if !path.starts_with('/') || !parse::is_valid_value(path) {
                return None;
            }
            path.to_string()
        };

        Some(Cookie {
            source: url.origin().ascii_serialization(),
            name: name.to_string(),
            value: value.to_string(),
            domain: resolved_domain,
            path: resolved_path,
            creation,
            expiry,
            last_access: creation,
            secure,
            http_only,
            priority,
        })
    }

    /// Rehydrates a cookie from persisted fields. Only the structural
    /// invariants are checked; load-time cleanup deals with the rest.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        source: String,
        name: String,
        value: String,
        domain: String,
        path: String,
        creation: OffsetDateTime,
        expiry: Option<OffsetDateTime>,
        last_access: OffsetDateTime,
        secure: bool,
        http_only: bool,
        priority: CookiePriority,
    ) -> Option<Cookie> {
        if domain.is_empty() || path.is_empty() || !path.starts_with('/') {
            return None;
        }
        Some(Cookie {
            source,
            name,
            value,
            domain,
            path,
            creation,
            expiry,
            last_access,
            secure,
            http_only,
            priority,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn creation(&self) -> OffsetDateTime {
        self.creation
    }

    /// Stable identity key: nanoseconds of the unique creation timestamp.
    pub fn creation_id(&self) -> i128 {
        self.creation.unix_timestamp_nanos()
    }

    pub fn expiry(&self) -> Option<OffsetDateTime> {
        self.expiry
    }

    pub fn last_access(&self) -> OffsetDateTime {
        self.last_access
    }

    pub(crate) fn set_last_access(&mut self, at: OffsetDateTime) {
        self.last_access = at;
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn http_only(&self) -> bool {
        self.http_only
    }

    pub fn priority(&self) -> CookiePriority {
        self.priority
    }

    /// A persistent cookie carries an expiry; everything else is a session
    /// cookie and is not synced to a backing store by default.
    pub fn is_persistent(&self) -> bool {
        self.expiry.is_some()
    }

    pub fn is_host_cookie(&self) -> bool {
        !self.domain.starts_with('.')
    }

    pub fn is_domain_cookie(&self) -> bool {
        self.domain.starts_with('.')
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        matches!(self.expiry, Some(e) if e <= now)
    }

    /// Two cookies are equivalent when name, domain and path all match; at
    /// most one live record per equivalence class exists in the store.
    pub fn is_equivalent(&self, other: &Cookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }

    /// Path match per RFC 6265: the request path must start with the cookie
    /// path, and the match must end on a `/` boundary (so `/foo` matches
    /// `/foo/bar` but not `/foobar`).
    pub fn is_on_path(&self, request_path: &str) -> bool {
        if !request_path.starts_with(&self.path) {
            return false;
        }
        request_path.len() == self.path.len()
            || self.path.ends_with('/')
            || request_path.as_bytes()[self.path.len()] == b'/'
    }

    /// Domain match: exact host (covers legacy non-dot storage), the bare
    /// host of a domain cookie, or any dot-delimited subdomain of it.
    pub fn matches_domain(&self, host: &str) -> bool {
        if self.domain == host {
            return true;
        }
        if let Some(bare) = self.domain.strip_prefix('.') {
            return host == bare || host.ends_with(&self.domain);
        }
        false
    }

    /// Whether this cookie is sent for a request to `url` under `options`:
    /// the http-only filter, the secure-scheme filter, domain match and path
    /// match must all pass.
    pub fn should_include(&self, url: &Url, options: &CookieOptions) -> bool {
        if self.http_only && options.exclude_http_only {
            return false;
        }
        if self.secure && !canon::is_secure_scheme(url) {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        self.matches_domain(host) && self.is_on_path(url.path())
    }
}
