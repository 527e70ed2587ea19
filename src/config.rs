//! Configuration for the sync client.
//!
//! # Example
//!
//! ```
//! use recordsync::{SyncConfig, RequestPolicy};
//!
//! // Minimal config (in-memory cache, resilient default policy)
//! let config = SyncConfig::default();
//! assert_eq!(config.request_policy, RequestPolicy::CacheAndNetwork);
//!
//! // Full config
//! let config = SyncConfig {
//!     base_url: "https://records.example.com".into(),
//!     db_path: Some("cache.db".into()),
//!     cache_ttl_secs: Some(7 * 24 * 3600),
//!     ..Default::default()
//! };
//! assert!(config.cache_ttl().is_some());
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::policy::RequestPolicy;

/// Configuration for the sync client.
///
/// All fields have sensible defaults. At minimum, you should configure
/// `base_url` and `db_path` for production use (the default cache is
/// in-memory and lost on restart).
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Remote server URL (e.g., "https://records.example.com")
    #[serde(default)]
    pub base_url: String,

    /// Default request policy for all operations
    #[serde(default = "default_request_policy")]
    pub request_policy: RequestPolicy,

    /// Cache TTL in seconds; `None` disables maintenance cleanup
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: Option<u64>,

    /// SQLite file path; `None` means in-memory
    #[serde(default)]
    pub db_path: Option<String>,

    /// Timeout for full-list fetches in seconds
    #[serde(default = "default_list_timeout_secs")]
    pub list_timeout_secs: u64,

    /// Page size used when paginating full-list fetches
    #[serde(default = "default_list_page_size")]
    pub list_page_size: u32,

    /// Maximum relation expansion depth
    #[serde(default = "default_max_expand_depth")]
    pub max_expand_depth: usize,

    /// Fail CRUD calls for collections with no cached schema instead of
    /// skipping validation
    #[serde(default)]
    pub strict_validation: bool,

    /// Path prefixes never stored in the response cache
    #[serde(default = "default_response_blocklist")]
    pub response_blocklist: Vec<String>,

    /// Preferred language sent with remote requests
    #[serde(default = "default_lang")]
    pub lang: String,
}

fn default_request_policy() -> RequestPolicy {
    RequestPolicy::CacheAndNetwork
}
fn default_cache_ttl_secs() -> Option<u64> {
    Some(7 * 24 * 3600) // 7 days
}
fn default_list_timeout_secs() -> u64 {
    30
}
fn default_list_page_size() -> u32 {
    500
}
fn default_max_expand_depth() -> usize {
    6
}
fn default_response_blocklist() -> Vec<String> {
    [
        "/api/admins",
        "/api/batch",
        "/api/health",
        "/api/realtime",
        "/api/collections",
        "/api/settings",
        "/api/logs",
        "/api/backups",
        "/api/files",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_lang() -> String {
    "en-US".into()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            request_policy: default_request_policy(),
            cache_ttl_secs: default_cache_ttl_secs(),
            db_path: None,
            list_timeout_secs: default_list_timeout_secs(),
            list_page_size: default_list_page_size(),
            max_expand_depth: default_max_expand_depth(),
            strict_validation: false,
            response_blocklist: default_response_blocklist(),
            lang: default_lang(),
        }
    }
}

impl SyncConfig {
    /// The cache TTL as a [`Duration`], when cleanup is enabled.
    #[must_use]
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_secs.map(Duration::from_secs)
    }

    /// The full-list fetch timeout.
    #[must_use]
    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.request_policy, RequestPolicy::CacheAndNetwork);
        assert_eq!(config.cache_ttl_secs, Some(7 * 24 * 3600));
        assert_eq!(config.list_page_size, 500);
        assert_eq!(config.max_expand_depth, 6);
        assert!(config.db_path.is_none());
        assert!(!config.strict_validation);
        assert!(config.response_blocklist.iter().any(|p| p == "/api/realtime"));
    }

    #[test]
    fn deserializes_partial_config() {
        let config: SyncConfig = serde_json::from_str(
            r#"{"base_url": "https://x.test", "cache_ttl_secs": 60}"#,
        )
        .unwrap();
        assert_eq!(config.base_url, "https://x.test");
        assert_eq!(config.cache_ttl(), Some(Duration::from_secs(60)));
        assert_eq!(config.list_timeout(), Duration::from_secs(30));
    }
}
