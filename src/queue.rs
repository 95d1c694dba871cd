use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::model::QueueMessage;

const RECLAIM_BATCH: usize = 16;
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue backend unavailable: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("queue payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Wire envelope around a [`QueueMessage`]. The id survives redelivery and
/// keys the per-message delivery counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub body: QueueMessage,
}

/// Opaque receipt for acknowledging one delivery.
#[derive(Debug, Clone)]
pub struct DeliveryHandle(String);

#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
    pub handle: DeliveryHandle,
}

/// At-least-once work queue decoupling request time from fetch time.
///
/// No ordering guarantee. A delivery not acknowledged within the visibility
/// window reappears to a later `receive`; a message delivered more than the
/// configured maximum is moved to a dead-letter holding area instead.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Long-poll receive: blocks up to `max_wait` for at least one message,
    /// returning an empty batch on timeout.
    async fn receive(&self, max_wait: Duration) -> Result<Vec<Delivery>, QueueError>;

    async fn acknowledge(&self, handle: &DeliveryHandle) -> Result<(), QueueError>;
}

/// Redis-backed queue: a ready sorted set, a processing sorted set scored by
/// redelivery deadline, a delivery-count hash and a dead-letter list.
pub struct RedisQueue {
    conn: ConnectionManager,
    ready_key: String,
    processing_key: String,
    deliveries_key: String,
    dead_key: String,
    visibility: Duration,
    max_deliveries: u32,
}

impl RedisQueue {
    pub async fn connect(
        url: &str,
        name: &str,
        visibility: Duration,
        max_deliveries: u32,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            ready_key: format!("{name}:ready"),
            processing_key: format!("{name}:processing"),
            deliveries_key: format!("{name}:deliveries"),
            dead_key: format!("{name}:dead"),
            visibility,
            max_deliveries,
        })
    }

    /// Move messages whose visibility window lapsed back to the ready set.
    async fn reclaim_expired(&self, conn: &mut ConnectionManager) -> Result<(), QueueError> {
        let now = Utc::now().timestamp_millis();
        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.processing_key)
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(RECLAIM_BATCH)
            .query_async(conn)
            .await?;

        for member in expired {
            redis::cmd("ZREM")
                .arg(&self.processing_key)
                .arg(&member)
                .query_async::<_, ()>(conn)
                .await?;
            redis::cmd("ZADD")
                .arg(&self.ready_key)
                .arg(now)
                .arg(&member)
                .query_async::<_, ()>(conn)
                .await?;
        }
        Ok(())
    }

    async fn claim_one(
        &self,
        conn: &mut ConnectionManager,
    ) -> Result<Option<Delivery>, QueueError> {
        loop {
            let popped: Vec<String> = redis::cmd("ZPOPMIN")
                .arg(&self.ready_key)
                .arg(1)
                .query_async(conn)
                .await?;
            let Some(member) = popped.into_iter().next() else {
                return Ok(None);
            };

            let envelope: Envelope = match serde_json::from_str(&member) {
                Ok(envelope) => envelope,
                Err(e) => {
                    // Undecodable payloads can never be processed; retrying
                    // them only wastes cycles.
                    tracing::warn!("Dropping undecodable queue payload: {}", e);
                    continue;
                }
            };

            let count: i64 = redis::cmd("HINCRBY")
                .arg(&self.deliveries_key)
                .arg(envelope.id.to_string())
                .arg(1)
                .query_async(conn)
                .await?;
            if count > i64::from(self.max_deliveries) {
                tracing::warn!(
                    "Message {} exceeded {} deliveries; dead-lettering",
                    envelope.id,
                    self.max_deliveries
                );
                redis::cmd("LPUSH")
                    .arg(&self.dead_key)
                    .arg(&member)
                    .query_async::<_, ()>(conn)
                    .await?;
                redis::cmd("HDEL")
                    .arg(&self.deliveries_key)
                    .arg(envelope.id.to_string())
                    .query_async::<_, ()>(conn)
                    .await?;
                continue;
            }

            let deadline = Utc::now().timestamp_millis() + self.visibility.as_millis() as i64;
            redis::cmd("ZADD")
                .arg(&self.processing_key)
                .arg(deadline)
                .arg(&member)
                .query_async::<_, ()>(conn)
                .await?;

            return Ok(Some(Delivery {
                message: envelope.body,
                handle: DeliveryHandle(member),
            }));
        }
    }
}

#[async_trait]
impl WorkQueue for RedisQueue {
    async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let envelope = Envelope {
            id: Uuid::new_v4(),
            body: message.clone(),
        };
        let payload = serde_json::to_string(&envelope)?;
        let mut conn = self.conn.clone();
        redis::cmd("ZADD")
            .arg(&self.ready_key)
            .arg(Utc::now().timestamp_millis())
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn receive(&self, max_wait: Duration) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let deadline = Instant::now() + max_wait;
        loop {
            self.reclaim_expired(&mut conn).await?;
            if let Some(delivery) = self.claim_one(&mut conn).await? {
                return Ok(vec![delivery]);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(RECEIVE_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn acknowledge(&self, handle: &DeliveryHandle) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZREM")
            .arg(&self.processing_key)
            .arg(&handle.0)
            .query_async::<_, ()>(&mut conn)
            .await?;
        if let Ok(envelope) = serde_json::from_str::<Envelope>(&handle.0) {
            redis::cmd("HDEL")
                .arg(&self.deliveries_key)
                .arg(envelope.id.to_string())
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct MemoryQueueState {
    ready: VecDeque<Envelope>,
    processing: HashMap<Uuid, (Envelope, Instant)>,
    deliveries: HashMap<Uuid, u32>,
    dead: Vec<Envelope>,
}

/// In-process queue with the same delivery semantics, for tests and
/// single-node runs.
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
    visibility: Duration,
    max_deliveries: u32,
}

impl MemoryQueue {
    pub fn new(visibility: Duration, max_deliveries: u32) -> Self {
        Self {
            state: Mutex::new(MemoryQueueState::default()),
            visibility,
            max_deliveries,
        }
    }

    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.processing.len()
    }

    pub async fn dead_len(&self) -> usize {
        self.state.lock().await.dead.len()
    }

    /// Test hook: lapse every in-flight visibility window immediately.
    pub async fn expire_in_flight(&self) {
        let mut state = self.state.lock().await;
        let expired: Vec<Uuid> = state.processing.keys().copied().collect();
        for id in expired {
            if let Some((envelope, _)) = state.processing.remove(&id) {
                state.ready.push_back(envelope);
            }
        }
    }

    fn try_claim(&self, state: &mut MemoryQueueState) -> Option<Delivery> {
        let now = Instant::now();
        let lapsed: Vec<Uuid> = state
            .processing
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in lapsed {
            if let Some((envelope, _)) = state.processing.remove(&id) {
                state.ready.push_back(envelope);
            }
        }

        while let Some(envelope) = state.ready.pop_front() {
            let count = state.deliveries.entry(envelope.id).or_insert(0);
            *count += 1;
            if *count > self.max_deliveries {
                state.deliveries.remove(&envelope.id);
                state.dead.push(envelope);
                continue;
            }
            let handle = DeliveryHandle(envelope.id.to_string());
            let message = envelope.body.clone();
            state
                .processing
                .insert(envelope.id, (envelope, now + self.visibility));
            return Some(Delivery { message, handle });
        }
        None
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.ready.push_back(Envelope {
            id: Uuid::new_v4(),
            body: message.clone(),
        });
        Ok(())
    }

    async fn receive(&self, max_wait: Duration) -> Result<Vec<Delivery>, QueueError> {
        let deadline = Instant::now() + max_wait;
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(delivery) = self.try_claim(&mut state) {
                    return Ok(vec![delivery]);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(Duration::from_millis(10).min(deadline - now)).await;
        }
    }

    async fn acknowledge(&self, handle: &DeliveryHandle) -> Result<(), QueueError> {
        if let Ok(id) = handle.0.parse::<Uuid>() {
            let mut state = self.state.lock().await;
            state.processing.remove(&id);
            state.deliveries.remove(&id);
        }
        Ok(())
    }
}
