//! Client configuration: retry/backoff policy and REST gateway settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff policy for HTTP requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff (default: 500ms)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for a single backoff delay (default: 10s)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// HTTP statuses treated as transient
    #[serde(default = "default_retry_statuses")]
    pub retry_statuses: Vec<u16>,

    /// Also retry non-idempotent (write) requests
    #[serde(default)]
    pub retry_non_idempotent: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_retry_statuses() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            retry_statuses: default_retry_statuses(),
            retry_non_idempotent: false,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based):
    /// `base_delay_ms * 2^(attempt - 1)`, capped at `max_delay_ms`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << (attempt - 1).min(20));
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Whether a request may be retried at all
    pub fn allows_retry(&self, idempotent: bool) -> bool {
        self.max_retries > 0 && (idempotent || self.retry_non_idempotent)
    }

    /// Whether a response status is transient under this policy
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }

    /// Whether a response with `status` should be retried
    pub fn should_retry(&self, status: u16, idempotent: bool) -> bool {
        self.allows_retry(idempotent) && self.is_retryable_status(status)
    }
}

/// Settings for the DocDB REST gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestClientConfig {
    /// Gateway host, e.g. `api.example.org`
    pub host: String,
    pub database: String,
    pub collection: String,
    /// API version path segment (default: `v1`)
    #[serde(default = "default_version")]
    pub version: String,
    /// URL scheme (default: `https`)
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Per-request timeout in seconds (default: 30)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// AWS region used to sign write requests
    #[serde(default)]
    pub region: Option<String>,
}

fn default_version() -> String {
    "v1".to_string()
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl RestClientConfig {
    pub fn new(
        host: impl Into<String>,
        database: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into().trim_matches('/').to_string(),
            database: database.into(),
            collection: collection.into(),
            version: default_version(),
            scheme: default_scheme(),
            timeout_secs: default_timeout_secs(),
            retry: RetryPolicy::default(),
            region: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Build a config from a full base URL such as `http://127.0.0.1:8080`
    pub fn from_base_url(
        base_url: &str,
        database: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        let (scheme, host) = match base_url.split_once("://") {
            Some((scheme, rest)) => (scheme.to_string(), rest),
            None => (default_scheme(), base_url),
        };
        Self::new(host, database, collection).with_scheme(scheme)
    }

    /// URL of the collection endpoint
    pub fn base_url(&self) -> String {
        format!(
            "{}://{}/{}/{}/{}",
            self.scheme,
            self.host.trim_matches('/'),
            self.version,
            self.database,
            self.collection
        )
    }

    pub fn count_url(&self) -> String {
        format!("{}/count_documents", self.base_url())
    }

    pub fn aggregate_url(&self) -> String {
        format!("{}/aggregate", self.base_url())
    }

    pub fn update_one_url(&self) -> String {
        format!("{}/update_one", self.base_url())
    }

    pub fn bulk_write_url(&self) -> String {
        format!("{}/bulk_write", self.base_url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.retry_statuses, vec![429, 500, 502, 503, 504]);
        assert!(!policy.retry_non_idempotent);
        assert!(policy.allows_retry(true));
        assert!(!policy.allows_retry(false));
        assert!(!RetryPolicy::none().allows_retry(true));
    }

    #[test]
    fn test_delay_for_attempt_is_bounded() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_retry_policy_deserialize_partial() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_retries": 5}"#).unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay_ms, 500);
        assert!(policy.is_retryable_status(503));
        assert!(!policy.is_retryable_status(404));
        assert!(policy.should_retry(503, true));
        assert!(!policy.should_retry(503, false));
        assert!(!policy.should_retry(404, true));
    }

    #[test]
    fn test_rest_urls() {
        let config = RestClientConfig::new("acmecorp.com/", "db", "coll");
        assert_eq!(config.host, "acmecorp.com");
        assert_eq!(config.base_url(), "https://acmecorp.com/v1/db/coll");
        assert_eq!(
            config.update_one_url(),
            "https://acmecorp.com/v1/db/coll/update_one"
        );
        assert_eq!(
            config.bulk_write_url(),
            "https://acmecorp.com/v1/db/coll/bulk_write"
        );
        assert_eq!(
            config.count_url(),
            "https://acmecorp.com/v1/db/coll/count_documents"
        );
    }

    #[test]
    fn test_from_base_url() {
        let config = RestClientConfig::from_base_url("http://127.0.0.1:8080", "db", "coll");
        assert_eq!(config.base_url(), "http://127.0.0.1:8080/v1/db/coll");
    }
}
