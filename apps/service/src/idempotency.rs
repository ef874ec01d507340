//! Process-local idempotency cache for mutating requests.
//!
//! Keyed by `(identity, method, path, idempotency-key)` so one caller's
//! cached response can never be replayed to another. Entries expire after
//! the configured TTL and are purged lazily on access; 5xx responses are
//! never stored.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone)]
struct Entry {
    response: CachedResponse,
    stored_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct IdempotencyCache {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl IdempotencyCache {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            ttl: Duration::seconds(ttl_seconds.max(1) as i64),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cache_key(identity: &str, method: &str, path: &str, idempotency_key: &str) -> String {
        format!("{identity}\n{method}\n{path}\n{idempotency_key}")
    }

    pub async fn get(&self, key: &str, now: DateTime<Utc>) -> Option<CachedResponse> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if now - entry.stored_at < self.ttl => Some(entry.response.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a response. Server errors must not be memoized.
    pub async fn put(&self, key: String, response: CachedResponse, now: DateTime<Utc>) {
        if response.status >= 500 {
            return;
        }
        let mut entries = self.entries.lock().await;
        let horizon = now - self.ttl;
        entries.retain(|_, entry| entry.stored_at > horizon);
        entries.insert(
            key,
            Entry {
                response,
                stored_at: now,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: &str) -> CachedResponse {
        CachedResponse {
            status,
            body: body.as_bytes().to_vec(),
            content_type: Some("application/json".to_string()),
        }
    }

    #[tokio::test]
    async fn replays_within_ttl_with_identical_body() {
        let cache = IdempotencyCache::new(300);
        let now = Utc::now();
        let key = IdempotencyCache::cache_key("id1", "POST", "/api/v1/content-items", "k1");
        cache.put(key.clone(), response(201, r#"{"id":1}"#), now).await;

        let hit = cache.get(&key, now + Duration::seconds(10)).await.expect("hit");
        assert_eq!(hit.status, 201);
        assert_eq!(hit.body, br#"{"id":1}"#);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = IdempotencyCache::new(60);
        let now = Utc::now();
        let key = IdempotencyCache::cache_key("id1", "POST", "/p", "k1");
        cache.put(key.clone(), response(200, "{}"), now).await;
        assert!(cache.get(&key, now + Duration::seconds(61)).await.is_none());
    }

    #[tokio::test]
    async fn server_errors_are_not_cached() {
        let cache = IdempotencyCache::new(300);
        let now = Utc::now();
        let key = IdempotencyCache::cache_key("id1", "POST", "/p", "k1");
        cache.put(key.clone(), response(500, "boom"), now).await;
        assert!(cache.get(&key, now).await.is_none());
    }

    #[tokio::test]
    async fn different_identities_never_share_entries() {
        let cache = IdempotencyCache::new(300);
        let now = Utc::now();
        let key_a = IdempotencyCache::cache_key("caller-a", "POST", "/p", "k1");
        let key_b = IdempotencyCache::cache_key("caller-b", "POST", "/p", "k1");
        cache.put(key_a, response(201, "{}"), now).await;
        assert!(cache.get(&key_b, now).await.is_none());
    }
}
