//! Freshness-guarded cache over stub and proto queries.
//!
//! The default strategy probes the store's cheap last-updated query before
//! serving a cached entry and evicts on any mismatch, so writes (including
//! soft deletes, which bump `updated_at`) invalidate promptly. The aside
//! strategy trusts the TTL alone, trading staleness for zero probe queries
//! under load tests. Both strategies bound entry lifetime by the TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use crate::capture::IncomingRequest;
use crate::stub::types::{Proto, Stub};

use super::{
    IncomingQueryOption, LastUpdatedRecord, ResetQueryOption, StatusStore, StoreError, StubStore,
};

const PROTO_KEY: &str = "protos";
const STUB_PREFIX: &str = "stub_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheStrategy {
    /// Freshness-checked: validate against the store's last-updated record.
    #[default]
    Default,
    /// TTL-only, no freshness probe.
    Aside,
}

impl CacheStrategy {
    pub fn parse(s: &str) -> Self {
        match s {
            "aside" => CacheStrategy::Aside,
            _ => CacheStrategy::Default,
        }
    }
}

struct Entry<T> {
    last: Option<LastUpdatedRecord>,
    stored_at: Instant,
    items: Vec<T>,
}

/// TTL cache for one record kind. Entries are immutable snapshots; a lookup
/// clones the stored items.
struct TypedCache<T> {
    entries: RwLock<HashMap<String, Entry<T>>>,
    ttl: Duration,
}

impl<T: Clone> TypedCache<T> {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns the cached items when present, unexpired and still matching
    /// the store's latest record; otherwise evicts and reports a miss.
    /// Passing no latest record skips the freshness check (TTL only).
    fn get(
        &self,
        key: &str,
        latest: Option<&Option<LastUpdatedRecord>>,
    ) -> Option<Vec<T>> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;

        let expired = entry.stored_at.elapsed() > self.ttl;
        let fresh = latest.map(|l| matches_latest(&entry.last, l)).unwrap_or(true);
        if !expired && fresh {
            return Some(entry.items.clone());
        }

        drop(entries);
        info!("remove invalid cache entry {key}");
        self.entries.write().remove(key);
        None
    }

    fn set(&self, key: &str, last: Option<LastUpdatedRecord>, items: Vec<T>) {
        self.entries.write().insert(
            key.to_string(),
            Entry {
                last,
                stored_at: Instant::now(),
                items,
            },
        );
    }

    fn purge_expired(&self) {
        self.entries
            .write()
            .retain(|_, entry| entry.stored_at.elapsed() <= self.ttl);
    }
}

/// Cache wrapping a stub store. Writes pass through to the source store;
/// `get_all` and `get_protos` are served from cache when fresh.
pub struct StubCache {
    source: Arc<dyn StubStore>,
    status: Arc<dyn StatusStore>,
    strategy: CacheStrategy,
    stubs: TypedCache<Stub>,
    protos: TypedCache<Proto>,
}

impl StubCache {
    pub fn new(
        source: Arc<dyn StubStore>,
        status: Arc<dyn StatusStore>,
        strategy: CacheStrategy,
        ttl: Duration,
    ) -> Self {
        Self {
            source,
            status,
            strategy,
            stubs: TypedCache::new(ttl),
            protos: TypedCache::new(ttl),
        }
    }

    /// Spawns the periodic cleanup of expired entries.
    pub fn spawn_janitor(cache: Arc<Self>, period: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                cache.stubs.purge_expired();
                cache.protos.purge_expired();
            }
        });
    }
}

/// The entry is valid iff the store's latest record is the one the entry was
/// built against: same id and no newer write.
fn matches_latest(
    cached: &Option<LastUpdatedRecord>,
    store: &Option<LastUpdatedRecord>,
) -> bool {
    match (cached, store) {
        (Some(cached), Some(store)) => {
            cached.id == store.id && store.updated_at <= cached.updated_at
        }
        _ => false,
    }
}

#[async_trait]
impl StubStore for StubCache {
    async fn create(&self, stubs: Vec<Stub>) -> Result<Vec<Stub>, StoreError> {
        self.source.create(stubs).await
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.source.delete(id).await
    }

    async fn get_all(&self, namespace: &str) -> Result<Vec<Stub>, StoreError> {
        // Namespace can be empty, prefix the key for safety
        let key = format!("{STUB_PREFIX}{namespace}");

        let last = match self.strategy {
            CacheStrategy::Default => {
                let last = self.status.last_updated_stub(namespace).await?;
                if let Some(items) = self.stubs.get(&key, Some(&last)) {
                    return Ok(items);
                }

                last
            }
            CacheStrategy::Aside => {
                if let Some(items) = self.stubs.get(&key, None) {
                    return Ok(items);
                }

                None
            }
        };

        info!("reloading stubs from store for namespace '{namespace}'");
        let stubs = self.source.get_all(namespace).await?;
        self.stubs.set(&key, last, stubs.clone());
        Ok(stubs)
    }

    async fn create_proto(&self, protos: Vec<Proto>) -> Result<Vec<Proto>, StoreError> {
        self.source.create_proto(protos).await
    }

    async fn get_protos(&self) -> Result<Vec<Proto>, StoreError> {
        let last = match self.strategy {
            CacheStrategy::Default => {
                let last = self.status.last_updated_proto().await?;
                if let Some(items) = self.protos.get(PROTO_KEY, Some(&last)) {
                    return Ok(items);
                }

                last
            }
            CacheStrategy::Aside => {
                if let Some(items) = self.protos.get(PROTO_KEY, None) {
                    return Ok(items);
                }

                None
            }
        };

        info!("reloading protos from store");
        let protos = self.source.get_protos().await?;
        self.protos.set(PROTO_KEY, last, protos.clone());
        Ok(protos)
    }

    async fn create_incoming_request(
        &self,
        request: IncomingRequest,
    ) -> Result<IncomingRequest, StoreError> {
        self.source.create_incoming_request(request).await
    }

    async fn get_incoming_requests(
        &self,
        option: &IncomingQueryOption,
    ) -> Result<Vec<IncomingRequest>, StoreError> {
        self.source.get_incoming_requests(option).await
    }

    async fn reset(&self, option: &ResetQueryOption) -> Result<(), StoreError> {
        self.source.reset(option).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::StubMemoryStore;
    use crate::stub::operator::contains;
    use crate::stub::types::TAG_RECORDED_STUB;

    fn stub(namespace: &str) -> Stub {
        Stub::new()
            .for_method("GET", vec![contains("x")])
            .with_namespace(namespace)
    }

    fn cached(strategy: CacheStrategy, ttl: Duration) -> (Arc<StubMemoryStore>, StubCache) {
        let store = Arc::new(StubMemoryStore::new());
        let cache = StubCache::new(store.clone(), store.clone(), strategy, ttl);
        (store, cache)
    }

    #[tokio::test]
    async fn test_default_strategy_sees_new_writes() {
        let (store, cache) = cached(CacheStrategy::Default, Duration::from_secs(3600));

        store.create(vec![stub("ns")]).await.unwrap();
        assert_eq!(cache.get_all("ns").await.unwrap().len(), 1);

        // A write behind the cache's back changes the freshness answer
        store.create(vec![stub("ns")]).await.unwrap();
        assert_eq!(cache.get_all("ns").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_default_strategy_sees_soft_delete() {
        let (store, cache) = cached(CacheStrategy::Default, Duration::from_secs(3600));

        let created = store.create(vec![stub("ns")]).await.unwrap();
        assert_eq!(cache.get_all("ns").await.unwrap().len(), 1);

        store.delete(created[0].id).await.unwrap();
        assert!(cache.get_all("ns").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recorded_stub_does_not_invalidate() {
        let (store, cache) = cached(CacheStrategy::Default, Duration::from_secs(3600));

        store.create(vec![stub("")]).await.unwrap();
        assert_eq!(cache.get_all("").await.unwrap().len(), 1);

        // Recorded stubs are excluded from the probe; the cached (stale)
        // answer keeps being served
        store
            .create(vec![stub("").with_tag(TAG_RECORDED_STUB)])
            .await
            .unwrap();
        assert_eq!(cache.get_all("").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_aside_strategy_serves_stale_until_ttl() {
        let (store, cache) = cached(CacheStrategy::Aside, Duration::from_millis(40));

        store.create(vec![stub("ns")]).await.unwrap();
        assert_eq!(cache.get_all("ns").await.unwrap().len(), 1);

        store.create(vec![stub("ns")]).await.unwrap();
        // Still inside the TTL: stale answer
        assert_eq!(cache.get_all("ns").await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get_all("ns").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_proto_cache_freshness() {
        let (store, cache) = cached(CacheStrategy::Default, Duration::from_secs(3600));

        store
            .create_proto(vec![Proto {
                name: "p1".to_string(),
                ..Default::default()
            }])
            .await
            .unwrap();
        assert_eq!(cache.get_protos().await.unwrap().len(), 1);

        store
            .create_proto(vec![Proto {
                name: "p2".to_string(),
                ..Default::default()
            }])
            .await
            .unwrap();
        assert_eq!(cache.get_protos().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, cache) = cached(CacheStrategy::Aside, Duration::from_millis(10));
        store.create(vec![stub("ns")]).await.unwrap();
        cache.get_all("ns").await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.stubs.purge_expired();
        assert!(cache.stubs.entries.read().is_empty());
    }
}
