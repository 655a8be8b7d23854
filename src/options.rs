use time::OffsetDateTime;

/// Options recognized by the set/query operations.
///
/// `exclude_http_only` reflects the caller context: requests originating from
/// script must not see (or overwrite) http-only cookies, while HTTP plumbing
/// gets everything. `server_time` is the server's clock as reported in the
/// response, used to compensate for skew when interpreting an `Expires`
/// attribute.
#[derive(Debug, Clone, Copy, Default)]
pub struct CookieOptions {
    pub exclude_http_only: bool,
    pub server_time: Option<OffsetDateTime>,
}

impl CookieOptions {
    /// Options for an HTTP caller: http-only cookies included.
    pub fn http() -> Self {
        Self::default()
    }

    /// Options for a script caller: http-only cookies are invisible.
    pub fn scripted() -> Self {
        Self {
            exclude_http_only: true,
            server_time: None,
        }
    }

    pub fn with_server_time(mut self, server_time: OffsetDateTime) -> Self {
        self.server_time = Some(server_time);
        self
    }
}
