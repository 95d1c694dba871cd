use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};

use crate::cache::{Cache, CacheError};
use crate::model::{CacheEntry, LocationKey, Observation, QueueMessage};
use crate::queue::{QueueError, WorkQueue};
use crate::store::{ObservationStore, StoreError};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The cache backend itself failed. Deliberately distinct from a miss:
    /// treating an outage as a miss would flood the queue and the upstream
    /// source.
    #[error("cache backend failure: {0}")]
    Cache(#[from] CacheError),
    #[error("fill request could not be enqueued: {0}")]
    Queue(#[from] QueueError),
    #[error("store lookup failed: {0}")]
    Store(#[from] StoreError),
    #[error("cache entry corrupt: {0}")]
    CorruptEntry(#[from] serde_json::Error),
}

/// Outcome of one read. Pending is a normal, retryable result, not an
/// error: the caller should ask again shortly.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Ready(Observation),
    Pending,
}

/// Tuning knobs for the read path.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub freshness_ttl: Duration,
    pub pending_ttl: Duration,
    pub fill_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            freshness_ttl: Duration::from_secs(600),
            pending_ttl: Duration::from_secs(30),
            fill_wait: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl From<&crate::config::Config> for CoordinatorSettings {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            freshness_ttl: config.freshness_ttl,
            pending_ttl: config.pending_ttl,
            fill_wait: config.fill_wait,
            poll_interval: config.poll_interval,
        }
    }
}

/// Request-facing half of the fill protocol: cache-aside reads with
/// coalescing of concurrent misses.
///
/// On a miss, the coordinator installs the Pending sentinel with an atomic
/// set-if-absent and publishes at most one fill request; every concurrent
/// caller that loses that race simply waits on the same sentinel. The
/// sentinel's short TTL is the self-healing path when a worker dies before
/// completing a fill.
pub struct CacheCoordinator {
    cache: Arc<dyn Cache>,
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn ObservationStore>,
    settings: CoordinatorSettings,
}

impl CacheCoordinator {
    pub fn new(
        cache: Arc<dyn Cache>,
        queue: Arc<dyn WorkQueue>,
        store: Arc<dyn ObservationStore>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            cache,
            queue,
            store,
            settings,
        }
    }

    pub async fn get_weather(&self, key: &LocationKey) -> Result<FetchOutcome, CoordinatorError> {
        let cache_key = key.cache_key();
        match self.lookup(&cache_key).await? {
            Some(CacheEntry::Resolved { observation, .. }) => {
                tracing::debug!("Cache hit for {}", cache_key);
                return Ok(FetchOutcome::Ready(observation));
            }
            Some(CacheEntry::Pending) => {
                tracing::debug!("Fill already in flight for {}", cache_key);
            }
            None => {
                self.claim_and_enqueue(key, &cache_key).await?;
            }
        }

        self.wait_for_fill(key, &cache_key).await
    }

    async fn lookup(&self, cache_key: &str) -> Result<Option<CacheEntry>, CoordinatorError> {
        match self.cache.get(cache_key).await? {
            Some(raw) => Ok(Some(CacheEntry::from_json(&raw)?)),
            None => Ok(None),
        }
    }

    /// Install the in-flight sentinel and publish a fill request. The
    /// set-if-absent is the only writer election: losing it means another
    /// caller already owns this miss episode, so nothing is enqueued.
    async fn claim_and_enqueue(
        &self,
        key: &LocationKey,
        cache_key: &str,
    ) -> Result<(), CoordinatorError> {
        let sentinel = CacheEntry::Pending.to_json()?;
        let claimed = self
            .cache
            .set_if_absent(cache_key, &sentinel, self.settings.pending_ttl)
            .await?;

        if claimed {
            tracing::debug!("Cache miss for {}; enqueueing fill", cache_key);
            self.queue.publish(&QueueMessage::from(key)).await?;
        } else {
            tracing::debug!("Lost sentinel race for {}; fill already requested", cache_key);
        }
        Ok(())
    }

    /// Bounded wait for an in-flight fill. A completed fill is observed
    /// either as a Resolved entry written by another coordinator, or as the
    /// sentinel disappearing after the worker's invalidation, in which case
    /// the store's latest row is promoted into the cache.
    async fn wait_for_fill(
        &self,
        key: &LocationKey,
        cache_key: &str,
    ) -> Result<FetchOutcome, CoordinatorError> {
        let deadline = Instant::now() + self.settings.fill_wait;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(self.settings.poll_interval.min(deadline - now)).await;

            match self.lookup(cache_key).await? {
                Some(CacheEntry::Resolved { observation, .. }) => {
                    return Ok(FetchOutcome::Ready(observation));
                }
                Some(CacheEntry::Pending) => {}
                None => {
                    if let Some(outcome) = self.promote_latest(key, cache_key).await? {
                        return Ok(outcome);
                    }
                }
            }
        }

        // Out of patience; serve whatever the store already holds, or tell
        // the caller to come back.
        match self.promote_latest(key, cache_key).await? {
            Some(outcome) => Ok(outcome),
            None => {
                tracing::debug!("Fill still pending for {} at deadline", cache_key);
                Ok(FetchOutcome::Pending)
            }
        }
    }

    /// Read-through populate: promote the store's newest row for this key
    /// into a Resolved cache entry.
    async fn promote_latest(
        &self,
        key: &LocationKey,
        cache_key: &str,
    ) -> Result<Option<FetchOutcome>, CoordinatorError> {
        let Some(row) = self.store.most_recent(key).await? else {
            return Ok(None);
        };

        let entry = CacheEntry::Resolved {
            observation: row.observation.clone(),
            inserted_at: row.inserted_at,
        };
        self.cache
            .set(cache_key, &entry.to_json()?, self.settings.freshness_ttl)
            .await?;

        Ok(Some(FetchOutcome::Ready(row.observation)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::queue::MemoryQueue;
    use crate::store::MemoryObservationStore;
    use async_trait::async_trait;
    use chrono::Utc;

    fn observation(city: &str) -> Observation {
        Observation {
            city: city.to_string(),
            state: String::new(),
            country: "FR".to_string(),
            main: "Clear".to_string(),
            description: "clear sky".to_string(),
            temp: 20.0,
            feels_like: 19.5,
            temp_min: 18.0,
            temp_max: 22.0,
            pressure: 1013.0,
            humidity: 55.0,
            visibility: Some(10000),
            wind_speed: 2.0,
            wind_deg: 90.0,
            clouds_all: 0.0,
            coord_lat: 48.85,
            coord_lon: 2.35,
        }
    }

    struct Fixture {
        cache: Arc<MemoryCache>,
        queue: Arc<MemoryQueue>,
        store: Arc<MemoryObservationStore>,
        coordinator: CacheCoordinator,
    }

    fn fixture(settings: CoordinatorSettings) -> Fixture {
        let cache = Arc::new(MemoryCache::new());
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30), 5));
        let store = Arc::new(MemoryObservationStore::new());
        let coordinator = CacheCoordinator::new(
            cache.clone(),
            queue.clone(),
            store.clone(),
            settings,
        );
        Fixture {
            cache,
            queue,
            store,
            coordinator,
        }
    }

    fn no_wait() -> CoordinatorSettings {
        CoordinatorSettings {
            fill_wait: Duration::ZERO,
            poll_interval: Duration::from_millis(10),
            ..CoordinatorSettings::default()
        }
    }

    #[tokio::test]
    async fn cache_hit_touches_nothing_else() {
        let fx = fixture(no_wait());
        let key = LocationKey::new("Paris", "", "FR").unwrap();

        let entry = CacheEntry::Resolved {
            observation: observation("Paris"),
            inserted_at: Utc::now(),
        };
        fx.cache
            .set(&key.cache_key(), &entry.to_json().unwrap(), Duration::from_secs(600))
            .await
            .unwrap();

        let outcome = fx.coordinator.get_weather(&key).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Ready(observation("Paris")));
        assert_eq!(fx.queue.ready_len().await, 0);
        assert_eq!(fx.store.row_count().await, 0);
    }

    #[tokio::test]
    async fn cold_miss_claims_sentinel_and_enqueues_once() {
        let fx = fixture(no_wait());
        let key = LocationKey::new("Paris", "", "FR").unwrap();

        let outcome = fx.coordinator.get_weather(&key).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Pending);
        assert_eq!(fx.queue.ready_len().await, 1);

        let raw = fx.cache.get(&key.cache_key()).await.unwrap().unwrap();
        assert_eq!(CacheEntry::from_json(&raw).unwrap(), CacheEntry::Pending);

        // Second read while the sentinel is live must not enqueue again.
        let outcome = fx.coordinator.get_weather(&key).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Pending);
        assert_eq!(fx.queue.ready_len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_cold_misses_publish_exactly_one_message() {
        let fx = fixture(no_wait());
        let coordinator = Arc::new(fx.coordinator);
        let key = LocationKey::new("Tokyo", "", "JP").unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                coordinator.get_weather(&key).await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), FetchOutcome::Pending);
        }

        assert_eq!(fx.queue.ready_len().await, 1);
    }

    #[tokio::test]
    async fn expired_sentinel_allows_a_fresh_enqueue() {
        let settings = CoordinatorSettings {
            pending_ttl: Duration::from_millis(50),
            ..no_wait()
        };
        let fx = fixture(settings);
        let key = LocationKey::new("Paris", "", "FR").unwrap();

        fx.coordinator.get_weather(&key).await.unwrap();
        assert_eq!(fx.queue.ready_len().await, 1);

        // Worker never completes; sentinel lapses on its own.
        tokio::time::sleep(Duration::from_millis(120)).await;

        fx.coordinator.get_weather(&key).await.unwrap();
        assert_eq!(fx.queue.ready_len().await, 2);
    }

    #[tokio::test]
    async fn wait_observes_invalidation_and_promotes_store_row() {
        let settings = CoordinatorSettings {
            fill_wait: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            ..CoordinatorSettings::default()
        };
        let fx = fixture(settings);
        let key = LocationKey::new("Paris", "", "FR").unwrap();

        // Simulated worker: persist a row, then invalidate the sentinel.
        let store = fx.store.clone();
        let cache = fx.cache.clone();
        let worker_key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.insert(&observation("Paris")).await.unwrap();
            cache.delete(&worker_key.cache_key()).await.unwrap();
        });

        let outcome = fx.coordinator.get_weather(&key).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Ready(observation("Paris")));

        // The read promoted the row back into the cache.
        let raw = fx.cache.get(&key.cache_key()).await.unwrap().unwrap();
        assert!(matches!(
            CacheEntry::from_json(&raw).unwrap(),
            CacheEntry::Resolved { .. }
        ));
    }

    #[tokio::test]
    async fn deadline_falls_back_to_latest_store_row() {
        let fx = fixture(no_wait());
        let key = LocationKey::new("Paris", "", "FR").unwrap();

        // An older episode already persisted a row; the sentinel from this
        // miss is still unfilled at the deadline.
        fx.store.insert(&observation("Paris")).await.unwrap();

        let outcome = fx.coordinator.get_weather(&key).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Ready(observation("Paris")));
        assert_eq!(fx.queue.ready_len().await, 1);
    }

    struct BrokenCache;

    #[async_trait]
    impl Cache for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Backend(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))))
        }

        async fn set_if_absent(
            &self,
            _key: &str,
            _value: &str,
            _ttl: Duration,
        ) -> Result<bool, CacheError> {
            Err(CacheError::Backend(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))))
        }

        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Backend(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))))
        }

        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Backend(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))))
        }
    }

    #[tokio::test]
    async fn cache_outage_is_not_a_miss() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30), 5));
        let coordinator = CacheCoordinator::new(
            Arc::new(BrokenCache),
            queue.clone(),
            Arc::new(MemoryObservationStore::new()),
            no_wait(),
        );
        let key = LocationKey::new("Paris", "", "FR").unwrap();

        let err = coordinator.get_weather(&key).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Cache(_)));
        // An outage must not flood the queue.
        assert_eq!(queue.ready_len().await, 0);
    }
}
