//! Query cache invalidated by key prefix using moka
//!
//! Cached query results are keyed by hierarchical [`QueryKey`]s. A change
//! event invalidates every entry whose key starts with the consumer's key,
//! so `["chats"]` drops `["chats", "alice"]` and `["chats", "alice", "42"]`.

use moka::future::Cache;
use roost_realtime::{ChangeKind, ChannelKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Hierarchical cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct QueryKey(pub Vec<String>);

impl QueryKey {
    /// Key from segments
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Segments
    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether `prefix` covers this key
    #[inline]
    #[must_use]
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// What a change event invalidates
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationTarget {
    /// Prefix of the cache entries to drop
    pub query_key: QueryKey,
    /// Channel the event arrived on
    pub channel_key: ChannelKey,
    /// Table that changed
    pub table: String,
    /// Kind of change
    pub event_type: ChangeKind,
}

/// Sink for invalidations (client-side query cache)
pub trait CacheInvalidator: Send + Sync {
    /// Drop cached entries covered by `target`
    fn invalidate(&self, target: &InvalidationTarget);
}

/// Cached query results
#[derive(Clone)]
pub struct QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    inner: Cache<QueryKey, V>,
}

impl<V> QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create cache with max capacity
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .support_invalidation_closures()
                .build(),
        }
    }

    /// Create cache with time-based expiration
    #[must_use]
    pub fn with_ttl(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .support_invalidation_closures()
                .build(),
        }
    }

    /// Store a query result
    #[inline]
    pub async fn insert(&self, key: QueryKey, value: V) {
        self.inner.insert(key, value).await;
    }

    /// Cached result, if still valid
    #[inline]
    pub async fn get(&self, key: &QueryKey) -> Option<V> {
        self.inner.get(key).await
    }

    /// Cached result or run the query
    pub async fn get_or_fetch<F, Fut>(&self, key: QueryKey, fetch: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        if let Some(cached) = self.get(&key).await {
            return cached;
        }
        let value = fetch().await;
        self.insert(key, value.clone()).await;
        value
    }

    /// Cached result or run a fallible query; errors are not cached
    ///
    /// # Errors
    /// Whatever `fetch` returns
    pub async fn try_get_or_fetch<E, F, Fut>(&self, key: QueryKey, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(cached) = self.get(&key).await {
            return Ok(cached);
        }
        let value = fetch().await?;
        self.insert(key, value.clone()).await;
        Ok(value)
    }

    /// Drop every entry whose key starts with `prefix`
    pub fn invalidate_prefix(&self, prefix: &QueryKey) {
        let prefix = prefix.clone();
        if let Err(err) = self
            .inner
            .invalidate_entries_if(move |key, _| key.starts_with(&prefix))
        {
            tracing::warn!("Prefix invalidation unavailable, clearing cache: {}", err);
            self.inner.invalidate_all();
        }
    }

    /// Drop all entries
    #[inline]
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    /// Approximate entry count
    #[inline]
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

impl<V> Default for QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Cache with default capacity (10,000 entries)
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl<V> fmt::Debug for QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("entry_count", &self.inner.entry_count())
            .finish()
    }
}

impl<V> CacheInvalidator for QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn invalidate(&self, target: &InvalidationTarget) {
        tracing::debug!(
            "Invalidating {} after {} on {}",
            target.query_key,
            target.event_type,
            target.table
        );
        self.invalidate_prefix(&target.query_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_realtime::SubscriptionSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn key(segments: &[&str]) -> QueryKey {
        QueryKey::new(segments.iter().copied())
    }

    #[test]
    fn prefix_matching() {
        let chats = key(&["chats"]);
        assert!(key(&["chats", "alice"]).starts_with(&chats));
        assert!(chats.starts_with(&chats));
        assert!(!key(&["messages"]).starts_with(&chats));
        assert!(!chats.starts_with(&key(&["chats", "alice"])));
        assert_eq!(key(&["chats", "alice"]).to_string(), "[chats, alice]");
    }

    #[tokio::test]
    async fn insert_and_get() {
        let cache: QueryCache<u32> = QueryCache::new(100);
        cache.insert(key(&["chats"]), 3).await;
        assert_eq!(cache.get(&key(&["chats"])).await, Some(3));
        assert_eq!(cache.get(&key(&["missing"])).await, None);
    }

    #[tokio::test]
    async fn prefix_invalidation_drops_descendants_only() {
        let cache: QueryCache<u32> = QueryCache::default();
        cache.insert(key(&["chats", "alice"]), 1).await;
        cache.insert(key(&["chats", "alice", "42"]), 2).await;
        cache.insert(key(&["notifications", "alice"]), 3).await;

        cache.invalidate_prefix(&key(&["chats"]));

        assert_eq!(cache.get(&key(&["chats", "alice"])).await, None);
        assert_eq!(cache.get(&key(&["chats", "alice", "42"])).await, None);
        assert_eq!(cache.get(&key(&["notifications", "alice"])).await, Some(3));
    }

    #[tokio::test]
    async fn invalidator_uses_target_key() {
        let cache: QueryCache<&'static str> = QueryCache::new(100);
        cache.insert(key(&["messages", "42"]), "cached").await;

        let target = InvalidationTarget {
            query_key: key(&["messages"]),
            channel_key: SubscriptionSpec::new("messages").channel_key(),
            table: "messages".into(),
            event_type: ChangeKind::Insert,
        };
        cache.invalidate(&target);

        assert_eq!(cache.get(&key(&["messages", "42"])).await, None);
    }

    #[tokio::test]
    async fn get_or_fetch_caches() {
        let cache: QueryCache<String> = QueryCache::new(100);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let value = cache
                .get_or_fetch(key(&["profile"]), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    "fetched".to_string()
                })
                .await;
            assert_eq!(value, "fetched");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache: QueryCache<u32> = QueryCache::new(100);
        let result: Result<u32, &str> = cache
            .try_get_or_fetch(key(&["flaky"]), || async { Err("offline") })
            .await;
        assert_eq!(result, Err("offline"));
        assert_eq!(cache.get(&key(&["flaky"])).await, None);

        let result: Result<u32, &str> = cache
            .try_get_or_fetch(key(&["flaky"]), || async { Ok(7) })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(cache.get(&key(&["flaky"])).await, Some(7));
    }
}
