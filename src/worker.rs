use std::sync::Arc;
use std::time::Duration;

use crate::cache::Cache;
use crate::model::QueueMessage;
use crate::queue::{Delivery, QueueError, WorkQueue};
use crate::source::{Geocoder, ObservationSource};
use crate::store::ObservationStore;

/// Terminal state of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Observation stored, cache invalidated, message acknowledged.
    Completed,
    /// Malformed or unresolvable; acknowledged without effect. Retrying a
    /// message that can never be processed only wastes cycles.
    Discarded,
    /// Transient failure; left unacknowledged so the queue redelivers it.
    Retrying,
}

/// Background half of the fill protocol: drains the work queue, resolves a
/// location, fetches a reading, persists it and invalidates the cache key.
///
/// Effects are idempotent-in-effect under at-least-once delivery: a
/// redelivered message adds another store row (the newest wins) and repeats
/// a harmless delete.
pub struct FillWorker {
    queue: Arc<dyn WorkQueue>,
    geocoder: Arc<dyn Geocoder>,
    source: Arc<dyn ObservationSource>,
    store: Arc<dyn ObservationStore>,
    cache: Arc<dyn Cache>,
    receive_wait: Duration,
}

impl FillWorker {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        geocoder: Arc<dyn Geocoder>,
        source: Arc<dyn ObservationSource>,
        store: Arc<dyn ObservationStore>,
        cache: Arc<dyn Cache>,
        receive_wait: Duration,
    ) -> Self {
        Self {
            queue,
            geocoder,
            source,
            store,
            cache,
            receive_wait,
        }
    }

    /// Drains the queue until the process is stopped. A failure on one
    /// message never takes the loop down.
    pub async fn run(&self) {
        tracing::info!("Fill worker polling for messages");
        loop {
            match self.poll_once().await {
                Ok(0) => tracing::debug!("No messages to process"),
                Ok(n) => tracing::debug!("Processed {} message(s)", n),
                Err(e) => {
                    tracing::error!("Queue receive failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// One bounded-wait receive and processing pass. Returns the number of
    /// deliveries handled.
    pub async fn poll_once(&self) -> Result<usize, QueueError> {
        let deliveries = self.queue.receive(self.receive_wait).await?;
        let count = deliveries.len();
        for delivery in deliveries {
            self.handle_delivery(delivery).await;
        }
        Ok(count)
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        match self.process_message(&delivery.message).await {
            MessageOutcome::Completed | MessageOutcome::Discarded => {
                if let Err(e) = self.queue.acknowledge(&delivery.handle).await {
                    // Redelivery will repeat the idempotent work.
                    tracing::error!("Failed to acknowledge message: {}", e);
                }
            }
            MessageOutcome::Retrying => {
                tracing::debug!("Leaving message for redelivery");
            }
        }
    }

    /// Per-message state machine: Discarded, Retrying or Completed.
    pub async fn process_message(&self, message: &QueueMessage) -> MessageOutcome {
        let Ok(key) = message.location_key() else {
            tracing::error!("Invalid message, discarding: city is required");
            return MessageOutcome::Discarded;
        };
        let cache_key = key.cache_key();

        let candidates = match self
            .geocoder
            .resolve(&message.city, &message.state, &message.country)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::error!("Geocoding failed for {}: {}", cache_key, e);
                return MessageOutcome::Retrying;
            }
        };
        let Some(coord) = candidates.first().copied() else {
            // No new information will arrive on a retry.
            tracing::error!("Location not found, discarding message for {}", cache_key);
            return MessageOutcome::Discarded;
        };

        let reading = match self.source.fetch_current(coord.lat, coord.lon).await {
            Ok(reading) => reading,
            Err(e) => {
                tracing::error!("Weather fetch failed for {}: {}", cache_key, e);
                return MessageOutcome::Retrying;
            }
        };
        tracing::debug!(
            "Fetched reading from station '{}' for {}",
            reading.station,
            cache_key
        );

        let observation = reading.into_observation(&key);
        if let Err(e) = self.store.insert(&observation).await {
            tracing::error!("Failed to persist observation for {}: {}", cache_key, e);
            return MessageOutcome::Retrying;
        }

        // Invalidate only after the durable write succeeded; the next
        // reader repopulates from the store's latest row.
        if let Err(e) = self.cache.delete(&cache_key).await {
            tracing::error!("Cache invalidation failed for {}: {}", cache_key, e);
            return MessageOutcome::Retrying;
        }

        tracing::debug!("Stored observation and invalidated cache for {}", cache_key);
        MessageOutcome::Completed
    }
}
