use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Backend(#[from] redis::RedisError),
}

/// Shared cache backend at the raw string level. Values are serialized
/// `CacheEntry` JSON; keeping the trait untyped keeps it object-safe.
///
/// `set_if_absent` is the atomic check-and-set the coordination protocol
/// depends on: it must install the value only when no entry exists for the
/// key, as a single operation against the backend.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Returns true when this call installed the value.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Redis-backed cache shared by all API and worker processes.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
struct StoredValue {
    payload: String,
    ttl: Duration,
}

struct PerEntryExpiry;

impl moka::Expiry<String, StoredValue> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process cache with the same contract, for tests and single-node runs.
pub struct MemoryCache {
    inner: moka::future::Cache<String, StoredValue>,
}

impl MemoryCache {
    pub fn new() -> Self {
        let inner = moka::future::Cache::builder()
            .max_capacity(10_000)
            .expire_after(PerEntryExpiry)
            .build();
        Self { inner }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.inner.get(key).await.map(|v| v.payload))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let stored = StoredValue {
            payload: value.to_string(),
            ttl,
        };
        let entry = self
            .inner
            .entry(key.to_string())
            .or_insert_with(async move { stored })
            .await;
        Ok(entry.is_fresh())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.inner
            .insert(
                key.to_string(),
                StoredValue {
                    payload: value.to_string(),
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.inner.invalidate(key).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_installs_only_once() {
        let cache = MemoryCache::new();
        assert!(cache
            .set_if_absent("k", "first", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!cache
            .set_if_absent("k", "second", Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn delete_removes_the_entry() {
        let cache = MemoryCache::new();
        cache
            .set("k", "value", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.get("k").await.unwrap().is_some());
        cache.delete("k").await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_entries_revert_to_absent() {
        let cache = MemoryCache::new();
        assert!(cache
            .set_if_absent("k", "sentinel", Duration::from_millis(50))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(cache.get("k").await.unwrap().is_none());
        // A new claim succeeds once the old entry has lapsed.
        assert!(cache
            .set_if_absent("k", "sentinel", Duration::from_millis(50))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn set_overwrites_and_renews_ttl() {
        let cache = MemoryCache::new();
        cache
            .set("k", "old", Duration::from_millis(50))
            .await
            .unwrap();
        cache.set("k", "new", Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("new"));
    }
}
