//! `Set-Cookie` line parsing.
//!
//! This is the parser contract consumed by the cookie factories: a raw
//! attribute line in, a validated [`ParsedCookie`] out, or `None`. The store
//! core itself never touches raw header text; everything it receives has been
//! through here (or through the equivalent validation helpers, for the
//! structured set API).

use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::cookie::CookiePriority;

/// Separators from RFC 2616 that may not appear in a cookie name.
const TOKEN_SEPARATORS: &[char] = &[
    '(', ')', '<', '>', '@', ',', ';', ':', '\\', '"', '/', '[', ']', '?', '=',
    '{', '}', ' ', '\t',
];

pub fn contains_control_chars(s: &str) -> bool {
    s.bytes().any(|b| b < 0x20 || b == 0x7f)
}

/// A valid cookie name: no control characters, no separators, no surrounding
/// whitespace. The empty string is allowed (`Set-Cookie: =value` and the
/// Mozilla-style bare `value` form both produce an empty name).
pub fn is_valid_token(s: &str) -> bool {
    !contains_control_chars(s) && !s.contains(TOKEN_SEPARATORS)
}

/// A valid cookie value: no control characters, no `;`, no surrounding
/// whitespace.
pub fn is_valid_value(s: &str) -> bool {
    !contains_control_chars(s) && !s.contains(';') && s.trim() == s
}

/// The validated result of parsing one `Set-Cookie` line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub expires: Option<OffsetDateTime>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    pub priority: Option<CookiePriority>,
}

/// Parses a single `Set-Cookie` line. Returns `None` when the name/value
/// pair is malformed; unknown attributes are ignored, malformed known
/// attributes are dropped individually.
pub fn parse_set_cookie_line(line: &str) -> Option<ParsedCookie> {
    let mut parts = line.split(';');
    let pair = parts.next()?.trim();

    let (name, value) = match pair.split_once('=') {
        Some((n, v)) => (n.trim().to_string(), v.trim().to_string()),
        // Bare token: empty name, whole pair is the value.
        None => (String::new(), pair.to_string()),
    };

    if name.is_empty() && value.is_empty() {
        return None;
    }
    if !is_valid_token(&name) || !is_valid_value(&value) {
        return None;
    }

    let mut parsed = ParsedCookie {
        name,
        value,
        ..ParsedCookie::default()
    };

    for part in parts {
        let part = part.trim();
        if let Some((k, v)) = part.split_once('=') {
            let v = v.trim();
            match k.trim().to_ascii_lowercase().as_str() {
                "path" => {
                    // Only absolute paths are honored; anything else falls
                    // back to the default path at canonicalization time.
                    if v.starts_with('/') && is_valid_value(v) {
                        parsed.path = Some(v.to_string());
                    }
                }
                "domain" => {
                    if is_valid_value(v) {
                        parsed.domain = Some(v.to_string());
                    }
                }
                "expires" => parsed.expires = parse_http_date(v),
                "max-age" => parsed.max_age = v.parse::<i64>().ok(),
                "priority" => {
                    if v.eq_ignore_ascii_case("low") {
                        parsed.priority = Some(CookiePriority::Low);
                    } else if v.eq_ignore_ascii_case("medium") {
                        parsed.priority = Some(CookiePriority::Medium);
                    } else if v.eq_ignore_ascii_case("high") {
                        parsed.priority = Some(CookiePriority::High);
                    }
                }
                _ => {}
            }
        } else if part.eq_ignore_ascii_case("secure") {
            parsed.secure = true;
        } else if part.eq_ignore_ascii_case("httponly") {
            parsed.http_only = true;
        }
    }

    Some(parsed)
}

/// Parses the two date forms seen in the wild for `Expires`:
/// `Wed, 21 Oct 2015 07:28:00 GMT` and the legacy dashed variant
/// `Wed, 21-Oct-2015 07:28:00 GMT`.
pub fn parse_http_date(s: &str) -> Option<OffsetDateTime> {
    let rfc1123 = format_description!(
        "[weekday repr:short case_sensitive:false], [day] \
         [month repr:short case_sensitive:false] [year] \
         [hour]:[minute]:[second] GMT"
    );
    let dashed = format_description!(
        "[weekday repr:short case_sensitive:false], \
         [day]-[month repr:short case_sensitive:false]-[year] \
         [hour]:[minute]:[second] GMT"
    );

    let s = s.trim();
    PrimitiveDateTime::parse(s, &rfc1123)
        .or_else(|_| PrimitiveDateTime::parse(s, &dashed))
        .ok()
        .map(|dt| dt.assume_utc())
}
