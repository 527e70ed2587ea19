// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Idempotent-response cache.
//!
//! Remote GET responses are stored under a canonical fingerprint of the
//! request so arbitrary routes keep answering while offline. Only GET
//! requests produce a key; multipart uploads and a configurable blocklist of
//! administrative path prefixes are never cached.

use serde_json::Value;

use super::RecordStore;
use crate::error::SyncError;
use crate::metrics;
use crate::record::now_iso;

/// Build the canonical cache key for a request, or `None` when the request
/// must not be cached.
#[must_use]
pub fn request_key(
    method: &str,
    path: &str,
    query: &[(String, String)],
    body: Option<&Value>,
    has_files: bool,
    blocklist: &[String],
) -> Option<String> {
    if !method.eq_ignore_ascii_case("GET") || has_files {
        return None;
    }
    if blocklist.iter().any(|prefix| path.starts_with(prefix)) {
        return None;
    }

    let mut sorted: Vec<(&str, &str)> = query
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    sorted.sort_unstable();
    let query_obj = Value::Object(
        sorted
            .into_iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect(),
    );

    Some(format!(
        "GET::{path}::{}::{}",
        canonical_json(&query_obj),
        canonical_json(body.unwrap_or(&Value::Null))
    ))
}

/// Serialize with object keys sorted at every level, so logically equal
/// requests fingerprint identically.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

impl RecordStore {
    /// Look up a cached response body.
    pub async fn get_response(&self, key: &str) -> Result<Option<Value>, SyncError> {
        let text: Option<String> = sqlx::query_scalar(
            "SELECT response_data FROM cached_responses WHERE request_key = ?",
        )
        .bind(key)
        .fetch_optional(self.pool())
        .await?;

        metrics::record_response_cache(text.is_some());
        Ok(text.and_then(|t| serde_json::from_str(&t).ok()))
    }

    /// Store (or refresh) a response body under its request key.
    pub async fn put_response(&self, key: &str, body: &Value) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT INTO cached_responses (request_key, response_data, cached_at) \
             VALUES (?, ?, ?) \
             ON CONFLICT(request_key) DO UPDATE SET \
                response_data = excluded.response_data, \
                cached_at = excluded.cached_at",
        )
        .bind(key)
        .bind(body.to_string())
        .bind(now_iso())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Maintenance: delete responses cached before `cutoff` (strict `<`).
    pub(crate) async fn cleanup_responses(&self, cutoff: &str) -> Result<u64, SyncError> {
        let result = sqlx::query("DELETE FROM cached_responses WHERE cached_at < ?")
            .bind(cutoff)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;
    use serde_json::json;

    fn blocklist() -> Vec<String> {
        crate::SyncConfig::default().response_blocklist
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn only_get_produces_a_key() {
        let bl = blocklist();
        assert!(request_key("GET", "/api/custom", &[], None, false, &bl).is_some());
        assert!(request_key("get", "/api/custom", &[], None, false, &bl).is_some());
        assert!(request_key("POST", "/api/custom", &[], None, false, &bl).is_none());
        assert!(request_key("DELETE", "/api/custom", &[], None, false, &bl).is_none());
    }

    #[test]
    fn multipart_and_blocklisted_paths_bypass() {
        let bl = blocklist();
        assert!(request_key("GET", "/api/custom", &[], None, true, &bl).is_none());
        assert!(request_key("GET", "/api/realtime", &[], None, false, &bl).is_none());
        assert!(request_key("GET", "/api/settings/anything", &[], None, false, &bl).is_none());
        assert!(request_key("GET", "/api/files/t/r/f.png", &[], None, false, &bl).is_none());
    }

    #[test]
    fn key_is_order_insensitive_for_query_params() {
        let bl = blocklist();
        let a = request_key(
            "GET",
            "/api/custom",
            &pairs(&[("page", "1"), ("filter", "x")]),
            None,
            false,
            &bl,
        );
        let b = request_key(
            "GET",
            "/api/custom",
            &pairs(&[("filter", "x"), ("page", "1")]),
            None,
            false,
            &bl,
        );
        assert_eq!(a, b);

        let c = request_key(
            "GET",
            "/api/custom",
            &pairs(&[("page", "2"), ("filter", "x")]),
            None,
            false,
            &bl,
        );
        assert_ne!(a, c);
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let a = canonical_json(&json!({"b": {"y": 1, "x": 2}, "a": [1, 2]}));
        let b = canonical_json(&json!({"a": [1, 2], "b": {"x": 2, "y": 1}}));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn response_round_trip_and_refresh() {
        let store = test_store().await;
        let key = request_key("GET", "/api/custom", &[], None, false, &blocklist()).unwrap();

        assert!(store.get_response(&key).await.unwrap().is_none());

        store.put_response(&key, &json!({"n": 1})).await.unwrap();
        assert_eq!(store.get_response(&key).await.unwrap(), Some(json!({"n": 1})));

        store.put_response(&key, &json!({"n": 2})).await.unwrap();
        assert_eq!(store.get_response(&key).await.unwrap(), Some(json!({"n": 2})));
    }

    #[tokio::test]
    async fn cleanup_uses_strict_cutoff() {
        let store = test_store().await;
        store.put_response("k1", &json!(1)).await.unwrap();
        // Rewrite cached_at to a known instant.
        sqlx::query("UPDATE cached_responses SET cached_at = '2024-01-01T00:00:00.000Z'")
            .execute(store.pool())
            .await
            .unwrap();

        assert_eq!(
            store.cleanup_responses("2024-01-01T00:00:00.000Z").await.unwrap(),
            0
        );
        assert_eq!(
            store.cleanup_responses("2024-01-01T00:00:00.001Z").await.unwrap(),
            1
        );
    }
}
