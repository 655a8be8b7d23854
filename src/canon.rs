//! Domain and path canonicalization.
//!
//! Pure helpers shared by the cookie factories and the store: deriving the
//! effective cookie domain from a request URL, the default path when a
//! `Set-Cookie` line carries none, and the domain key used to bucket cookies
//! for quota and load purposes.

use url::Url;

/// Schemes on which cookies may be set or read. `file` is deliberately not
/// on the list.
pub const COOKIEABLE_SCHEMES: [&str; 4] = ["http", "https", "ws", "wss"];

pub fn is_cookieable(url: &Url) -> bool {
    COOKIEABLE_SCHEMES.contains(&url.scheme())
}

pub fn is_secure_scheme(url: &Url) -> bool {
    matches!(url.scheme(), "https" | "wss")
}

/// Default cookie path for a request URL: everything up to, but not
/// including, the right-most `/` of the URL path; `/` when that leaves
/// nothing.
pub fn default_path(url: &Url) -> String {
    let path = url.path();
    if !path.starts_with('/') {
        return "/".to_string();
    }
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Resolves the domain a cookie will be stored under.
///
/// An empty `requested` yields a host cookie (exact host, no leading dot).
/// A non-empty `requested` yields a domain cookie (leading dot) when the
/// request host equals it or is a subdomain of it; anything else fails. IP
/// address hosts only ever get host cookies.
pub fn effective_domain(url: &Url, requested: &str) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();

    if requested.is_empty() {
        return Some(host);
    }

    let wanted = requested.trim_start_matches('.').to_ascii_lowercase();
    if wanted.is_empty() {
        return None;
    }

    let is_ip = matches!(
        url.host(),
        Some(url::Host::Ipv4(_)) | Some(url::Host::Ipv6(_))
    );
    if is_ip {
        // No domain cookies for IP addresses.
        return if host == wanted { Some(host) } else { None };
    }

    if host == wanted || host.ends_with(&format!(".{wanted}")) {
        Some(format!(".{wanted}"))
    } else {
        None
    }
}

/// Key under which a cookie domain is bucketed: the registrable domain,
/// approximated as the last two labels. We have no public-suffix registry
/// available; when the lookup would fail the original falls back to the
/// domain unchanged, which is what the short-label branch below does.
pub fn domain_key(domain: &str) -> String {
    let domain = domain.trim_start_matches('.');
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() <= 2 {
        return domain.to_string();
    }
    labels[labels.len() - 2..].join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_derivation() {
        let url = Url::parse("http://example.com/foo/bar").unwrap();
        assert_eq!(default_path(&url), "/foo");

        let url = Url::parse("http://example.com/foo").unwrap();
        assert_eq!(default_path(&url), "/");

        let url = Url::parse("http://example.com/").unwrap();
        assert_eq!(default_path(&url), "/");
    }

    #[test]
    fn effective_domain_host_cookie() {
        let url = Url::parse("http://WWW.Example.com/").unwrap();
        assert_eq!(effective_domain(&url, ""), Some("www.example.com".into()));
    }

    #[test]
    fn effective_domain_domain_cookie() {
        let url = Url::parse("http://www.example.com/").unwrap();
        assert_eq!(
            effective_domain(&url, "example.com"),
            Some(".example.com".into())
        );
        assert_eq!(
            effective_domain(&url, ".example.com"),
            Some(".example.com".into())
        );
        assert_eq!(effective_domain(&url, "other.com"), None);
    }

    #[test]
    fn effective_domain_rejects_unrelated_suffix() {
        let url = Url::parse("http://notexample.com/").unwrap();
        assert_eq!(effective_domain(&url, "example.com"), None);
    }

    #[test]
    fn effective_domain_ip_host() {
        let url = Url::parse("http://127.0.0.1/").unwrap();
        assert_eq!(effective_domain(&url, ""), Some("127.0.0.1".into()));
        assert_eq!(effective_domain(&url, "0.0.1"), None);
    }

    #[test]
    fn domain_key_buckets_subdomains_together() {
        assert_eq!(domain_key("www.example.com"), "example.com");
        assert_eq!(domain_key(".example.com"), "example.com");
        assert_eq!(domain_key("a.b.example.com"), "example.com");
        assert_eq!(domain_key("example.com"), "example.com");
        assert_eq!(domain_key("localhost"), "localhost");
    }

    #[test]
    fn cookieable_schemes() {
        assert!(is_cookieable(&Url::parse("http://x.com/").unwrap()));
        assert!(is_cookieable(&Url::parse("wss://x.com/").unwrap()));
        assert!(!is_cookieable(&Url::parse("file:///tmp/x").unwrap()));
        assert!(!is_cookieable(&Url::parse("ftp://x.com/").unwrap()));
    }
}
