//! Short-TTL memoization for polled reads
//!
//! Absorbs bursts of manual refreshes: a status fetched less than `ttl` ago is
//! served from memory instead of hitting the proxy again. Only successful
//! responses are stored.

use moka::future::Cache;
use std::time::Duration;

#[derive(Clone)]
pub struct RequestCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    entries: Cache<String, V>,
    ttl: Duration,
}

impl<V> std::fmt::Debug for RequestCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl<V> RequestCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder().max_capacity(64).time_to_live(ttl).build(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).await
    }

    pub async fn insert(&self, key: impl Into<String>, value: V) {
        self.entries.insert(key.into(), value).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.entries.invalidate(key).await;
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }
}
