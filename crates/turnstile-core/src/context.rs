use typed_builder::TypedBuilder;

/// Everything the admission pipeline needs to know about an inbound
/// request.
///
/// Built by the serving layer from the raw request; the core never
/// touches the transport itself.
#[derive(Debug, Clone, TypedBuilder)]
pub struct RequestContext {
    /// The visitor's IP address, already resolved through any
    /// forwarding headers by the serving layer.
    #[builder(setter(into))]
    pub visitor_ip: String,

    /// The raw User-Agent header, empty if absent.
    #[builder(default, setter(into))]
    pub user_agent: String,

    /// The request path, used for honeypot and behaviour checks.
    #[builder(default = String::from("/"), setter(into))]
    pub path: String,

    /// Lower-cased names of headers present on the request.
    #[builder(default)]
    pub headers_present: Vec<String>,

    /// The referer header, if any. Carried into access-log events.
    #[builder(default, setter(into))]
    pub referer: String,

    /// Rate-limit subject. Falls back to the visitor IP when the
    /// serving layer supplies nothing more specific (an API key, a
    /// session id).
    #[builder(default, setter(strip_option, into))]
    pub client_key: Option<String>,
}

impl RequestContext {
    /// The key the per-client rate-limit scope counts against.
    pub fn rate_key(&self) -> &str {
        self.client_key.as_deref().unwrap_or(&self.visitor_ip)
    }

    /// Returns `true` if the named header (lower-case) was present.
    pub fn has_header(&self, name: &str) -> bool {
        self.headers_present.iter().any(|h| h == name)
    }
}
