use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// A cached response: enough to replay it byte-for-byte, minus
/// content-length which the HTTP layer recomputes.
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Entry {
    fingerprint: [u8; 32],
    response: StoredResponse,
    created_at: Instant,
}

#[derive(Debug)]
pub enum Lookup {
    Miss,
    Replay(StoredResponse),
    /// Same key, different payload fingerprint, within TTL.
    Conflict,
}

/// Process-global response cache keyed by `(method, path, idempotency key)`,
/// bounded by entry count and TTL. Expired entries are dropped and the size
/// cap enforced oldest-first on every access.
#[derive(Clone)]
pub struct IdempotencyCache {
    entries: Arc<Mutex<HashMap<(String, String, String), Entry>>>,
    max_entries: usize,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            max_entries,
            ttl,
        }
    }

    pub async fn lookup(
        &self,
        method: &str,
        path: &str,
        key: &str,
        fingerprint: [u8; 32],
    ) -> Lookup {
        let mut entries = self.entries.lock().await;
        Self::evict(&mut entries, self.ttl, self.max_entries);
        let cache_key = (method.to_string(), path.to_string(), key.to_string());
        match entries.get(&cache_key) {
            Some(entry) if entry.fingerprint == fingerprint => {
                Lookup::Replay(entry.response.clone())
            }
            Some(_) => Lookup::Conflict,
            None => Lookup::Miss,
        }
    }

    pub async fn store(
        &self,
        method: &str,
        path: &str,
        key: &str,
        fingerprint: [u8; 32],
        response: StoredResponse,
    ) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            (method.to_string(), path.to_string(), key.to_string()),
            Entry {
                fingerprint,
                response,
                created_at: Instant::now(),
            },
        );
        Self::evict(&mut entries, self.ttl, self.max_entries);
    }

    fn evict(
        entries: &mut HashMap<(String, String, String), Entry>,
        ttl: Duration,
        max_entries: usize,
    ) {
        let now = Instant::now();
        entries.retain(|_, e| now.duration_since(e.created_at) < ttl);
        while entries.len() > max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(body: &str) -> StoredResponse {
        StoredResponse {
            status: 200,
            headers: vec![("content-type".to_string(), b"application/json".to_vec())],
            body: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn replay_requires_matching_fingerprint() {
        let cache = IdempotencyCache::new(10, Duration::from_secs(300));
        cache
            .store("POST", "/x", "k1", [1; 32], stored("{\"ok\":true}"))
            .await;

        match cache.lookup("POST", "/x", "k1", [1; 32]).await {
            Lookup::Replay(r) => assert_eq!(r.body, b"{\"ok\":true}"),
            other => panic!("expected replay, got {other:?}"),
        }
        assert!(matches!(
            cache.lookup("POST", "/x", "k1", [2; 32]).await,
            Lookup::Conflict
        ));
        assert!(matches!(
            cache.lookup("POST", "/y", "k1", [1; 32]).await,
            Lookup::Miss
        ));
    }

    #[tokio::test]
    async fn expired_entries_miss() {
        let cache = IdempotencyCache::new(10, Duration::from_millis(10));
        cache.store("POST", "/x", "k1", [1; 32], stored("{}")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            cache.lookup("POST", "/x", "k1", [1; 32]).await,
            Lookup::Miss
        ));
    }

    #[tokio::test]
    async fn size_cap_evicts_oldest_first() {
        let cache = IdempotencyCache::new(2, Duration::from_secs(300));
        cache.store("POST", "/a", "k", [1; 32], stored("a")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.store("POST", "/b", "k", [1; 32], stored("b")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.store("POST", "/c", "k", [1; 32], stored("c")).await;

        assert!(matches!(
            cache.lookup("POST", "/a", "k", [1; 32]).await,
            Lookup::Miss
        ));
        assert!(matches!(
            cache.lookup("POST", "/c", "k", [1; 32]).await,
            Lookup::Replay(_)
        ));
    }
}
