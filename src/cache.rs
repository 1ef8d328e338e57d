use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Error;
use crate::fingerprint::Fingerprint;
use crate::storage::Storage;

/// Anything that can answer a request/response-shaped call. Implemented by
/// [`crate::connection::ConnectionCore`] and by [`Cache`] itself, so a
/// [`Cache`] can wrap either the core directly or another `Cache` — the
/// two-level persistent/volatile arrangement spec.md §4.2 describes.
#[async_trait]
pub trait Sendable: Send + Sync {
    async fn send(&self, request: Value) -> Result<Value, Error>;
}

#[async_trait]
impl Sendable for Arc<dyn Sendable> {
    async fn send(&self, request: Value) -> Result<Value, Error> {
        (**self).send(request).await
    }
}

/// Wraps `{upstream, storage}`: a cache hit short-circuits the upstream
/// call entirely; a miss forwards to `upstream` and records the reply
/// before returning it. Grounded on `original_source/deriv_api/cache.py`.
pub struct Cache {
    upstream: Arc<dyn Sendable>,
    storage: Arc<dyn Storage>,
}

impl Cache {
    pub fn new(upstream: Arc<dyn Sendable>, storage: Arc<dyn Storage>) -> Self {
        Cache { upstream, storage }
    }

    /// Whether a cached response already exists for `request`.
    pub fn has(&self, request: &Value) -> bool {
        self.storage.has(&Fingerprint::of(request))
    }

    /// The cached response for `request`, if any, without touching the
    /// upstream.
    pub fn get(&self, request: &Value) -> Option<Value> {
        self.storage.get(&Fingerprint::of(request))
    }
}

#[async_trait]
impl Sendable for Cache {
    #[tracing::instrument(skip(self, request), fields(msg_type = request.get("msg_type").and_then(Value::as_str)))]
    async fn send(&self, request: Value) -> Result<Value, Error> {
        let key = Fingerprint::of(&request);
        if let Some(cached) = self.storage.get(&key) {
            tracing::trace!("cache hit");
            return Ok(cached);
        }
        let response = self.upstream.send(request).await?;
        self.storage.set(key, response.clone());
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingUpstream {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Sendable for CountingUpstream {
        async fn send(&self, request: Value) -> Result<Value, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"msg_type": "tick", "echo_req": request, "quote": 1}))
        }
    }

    #[tokio::test]
    async fn second_identical_request_hits_cache() {
        let counting = Arc::new(CountingUpstream { calls: AtomicUsize::new(0) });
        let upstream: Arc<dyn Sendable> = counting.clone();
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let cache = Cache::new(upstream, storage);

        let req = json!({"ticks": "R_50", "req_id": 1});
        let req_again = json!({"ticks": "R_50", "req_id": 2});

        cache.send(req).await.unwrap();
        cache.send(req_again).await.unwrap();

        // both requests fingerprint identically (req_id is transient), so
        // the upstream should only have been hit once.
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn miss_records_response_in_storage() {
        let upstream: Arc<dyn Sendable> = Arc::new(CountingUpstream { calls: AtomicUsize::new(0) });
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let cache = Cache::new(upstream, storage.clone());

        let req = json!({"ticks": "R_50"});
        cache.send(req.clone()).await.unwrap();

        assert!(storage.has(&Fingerprint::of(&req)));
    }

    #[tokio::test]
    async fn two_level_cache_writes_through_both_layers_on_a_miss() {
        let counting = Arc::new(CountingUpstream { calls: AtomicUsize::new(0) });
        let upstream: Arc<dyn Sendable> = counting.clone();
        let persistent_storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let persistent: Arc<dyn Sendable> = Arc::new(Cache::new(upstream, persistent_storage.clone()));
        let volatile_storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let volatile = Cache::new(persistent, volatile_storage.clone());

        let req = json!({"ticks": "R_50"});
        volatile.send(req.clone()).await.unwrap();

        let key = Fingerprint::of(&req);
        assert!(volatile_storage.has(&key), "a miss must record into the volatile layer");
        assert!(persistent_storage.has(&key), "a miss must also write through to the persistent layer");
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);

        // A second identical request should now be served from the volatile
        // layer without the persistent layer or the upstream seeing it again.
        volatile.send(json!({"ticks": "R_50", "req_id": 7})).await.unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn two_level_cache_falls_through_to_the_persistent_layer_on_a_volatile_miss() {
        let counting = Arc::new(CountingUpstream { calls: AtomicUsize::new(0) });
        let upstream: Arc<dyn Sendable> = counting.clone();
        let persistent_storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let persistent = Cache::new(upstream, persistent_storage.clone());

        let req = json!({"ticks": "R_50"});
        // Prime the persistent layer directly, bypassing the volatile layer.
        persistent.send(req.clone()).await.unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);

        let persistent: Arc<dyn Sendable> = Arc::new(persistent);
        let volatile_storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let volatile = Cache::new(persistent, volatile_storage);

        // The volatile layer is empty, but the persistent layer already has
        // this fingerprint, so the upstream must not be hit a second time.
        volatile.send(req).await.unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }
}
