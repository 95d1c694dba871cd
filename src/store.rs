use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::model::{LocationKey, Observation};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database operation failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// One persisted observation row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredObservation {
    pub id: i64,
    pub inserted_at: DateTime<Utc>,
    #[sqlx(flatten)]
    pub observation: Observation,
}

/// Durable append-only record of observations. Rows are never updated;
/// "current" is the most recently inserted row for a key.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    async fn insert(&self, observation: &Observation) -> Result<(), StoreError>;

    /// Newest row matching the key. Empty state/country act as wildcards,
    /// so "Paris::FR" also matches rows stored with a state filled in.
    async fn most_recent(&self, key: &LocationKey)
        -> Result<Option<StoredObservation>, StoreError>;
}

pub struct SqliteObservationStore {
    pool: SqlitePool,
}

impl SqliteObservationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS observations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT '',
                country TEXT NOT NULL DEFAULT '',
                main TEXT NOT NULL,
                description TEXT NOT NULL,
                temp REAL NOT NULL,
                feels_like REAL NOT NULL,
                temp_min REAL NOT NULL,
                temp_max REAL NOT NULL,
                pressure REAL NOT NULL,
                humidity REAL NOT NULL,
                visibility INTEGER,
                wind_speed REAL NOT NULL,
                wind_deg REAL NOT NULL,
                clouds_all REAL NOT NULL,
                coord_lat REAL NOT NULL,
                coord_lon REAL NOT NULL,
                inserted_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_observations_location ON observations(city, state, country)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ObservationStore for SqliteObservationStore {
    async fn insert(&self, observation: &Observation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO observations (
                city, state, country, main, description, temp, feels_like,
                temp_min, temp_max, pressure, humidity, visibility,
                wind_speed, wind_deg, clouds_all, coord_lat, coord_lon,
                inserted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(&observation.city)
        .bind(&observation.state)
        .bind(&observation.country)
        .bind(&observation.main)
        .bind(&observation.description)
        .bind(observation.temp)
        .bind(observation.feels_like)
        .bind(observation.temp_min)
        .bind(observation.temp_max)
        .bind(observation.pressure)
        .bind(observation.humidity)
        .bind(observation.visibility)
        .bind(observation.wind_speed)
        .bind(observation.wind_deg)
        .bind(observation.clouds_all)
        .bind(observation.coord_lat)
        .bind(observation.coord_lon)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn most_recent(
        &self,
        key: &LocationKey,
    ) -> Result<Option<StoredObservation>, StoreError> {
        let row = sqlx::query_as::<_, StoredObservation>(
            r#"
            SELECT * FROM observations
            WHERE city = $1
              AND ($2 = '' OR state = $2)
              AND ($3 = '' OR country = $3)
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(&key.city)
        .bind(&key.state)
        .bind(&key.country)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryObservationStore {
    rows: RwLock<Vec<StoredObservation>>,
}

impl MemoryObservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn row_count(&self) -> usize {
        self.rows.read().await.len()
    }
}

#[async_trait]
impl ObservationStore for MemoryObservationStore {
    async fn insert(&self, observation: &Observation) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let id = rows.len() as i64 + 1;
        rows.push(StoredObservation {
            id,
            inserted_at: Utc::now(),
            observation: observation.clone(),
        });
        Ok(())
    }

    async fn most_recent(
        &self,
        key: &LocationKey,
    ) -> Result<Option<StoredObservation>, StoreError> {
        let rows = self.rows.read().await;
        let newest = rows
            .iter()
            .filter(|row| {
                row.observation.city == key.city
                    && (key.state.is_empty() || row.observation.state == key.state)
                    && (key.country.is_empty() || row.observation.country == key.country)
            })
            .max_by_key(|row| row.id)
            .cloned();
        Ok(newest)
    }
}
