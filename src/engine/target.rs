use bon::Builder;
use std::collections::BTreeMap;
use std::time::Duration;

use super::dedup::CanonicalKey;

pub type HeadersMap = BTreeMap<String, String>;

/// Transport parameters carried by every target
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct RequestOptions {
    #[builder(default)]
    pub headers: HeadersMap,
    /// Upper bound for a buffered attempt; for streamed bodies it bounds
    /// the response head and each body read
    #[builder(default = Duration::from_secs(20))]
    pub timeout: Duration,
    #[builder(default = true)]
    pub verify_tls: bool,
    /// Body is consumed as a stream instead of being buffered
    #[builder(default)]
    pub stream: bool,
    /// HTTP basic auth (user, password)
    pub basic_auth: Option<(String, Option<String>)>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// One logical unit of work. Immutable once built; identity is the
/// canonical key, never the URL string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    key: CanonicalKey,
    url: String,
    query: Vec<(String, String)>,
    options: RequestOptions,
    order_hint: Option<u64>,
    slot: Option<String>,
}

impl Target {
    /// Target whose identity is its URL
    pub fn for_url(url: &str, options: RequestOptions) -> Result<Self, url::ParseError> {
        let key = CanonicalKey::for_url(url)?;
        Ok(Self::new(key, url, options))
    }

    /// Target with an explicit identity (e.g. a paginated search request)
    pub fn new(key: CanonicalKey, url: impl Into<String>, options: RequestOptions) -> Self {
        Self {
            key,
            url: url.into(),
            query: Vec::new(),
            options,
            order_hint: None,
            slot: None,
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_order_hint(mut self, hint: u64) -> Self {
        self.order_hint = Some(hint);
        self
    }

    /// Output slot this target feeds, e.g. its staging filename
    pub fn with_slot(mut self, slot: impl Into<String>) -> Self {
        self.slot = Some(slot.into());
        self
    }

    pub fn key(&self) -> &CanonicalKey {
        &self.key
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn order_hint(&self) -> Option<u64> {
        self.order_hint
    }

    pub fn slot(&self) -> Option<&str> {
        self.slot.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_option_defaults() {
        let options = RequestOptions::default();
        assert_eq!(options.timeout, Duration::from_secs(20));
        assert!(options.verify_tls);
        assert!(!options.stream);
        assert!(options.headers.is_empty());
        assert!(options.basic_auth.is_none());
    }

    #[test]
    fn test_builder_overrides() {
        let options = RequestOptions::builder()
            .headers([("User-Agent".to_string(), "bulkfetch".to_string())].into())
            .verify_tls(false)
            .stream(true)
            .timeout(Duration::from_secs(5))
            .build();

        assert_eq!(options.headers.len(), 1);
        assert!(!options.verify_tls);
        assert!(options.stream);
        assert_eq!(options.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_url_target_identity() {
        let a = Target::for_url("https://Example.com/a.jpg", RequestOptions::default()).unwrap();
        let b = Target::for_url("https://example.com/a.jpg", RequestOptions::default())
            .unwrap()
            .with_slot("a.jpg")
            .with_order_hint(7);

        assert_eq!(a.key(), b.key());
        assert_eq!(b.slot(), Some("a.jpg"));
        assert_eq!(b.order_hint(), Some(7));
        assert!(Target::for_url("::", RequestOptions::default()).is_err());
    }
}
