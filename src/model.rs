use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InvalidLocation {
    #[error("city must not be empty")]
    MissingCity,
}

/// Location identity as submitted by callers.
///
/// `state` and `country` are empty strings when not supplied, never absent,
/// so two callers naming the same logical location always collide on the
/// same cache entry. Comparison is case-sensitive as given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocationKey {
    pub city: String,
    pub state: String,
    pub country: String,
}

impl LocationKey {
    pub fn new(
        city: impl Into<String>,
        state: impl Into<String>,
        country: impl Into<String>,
    ) -> Result<Self, InvalidLocation> {
        let city = city.into();
        if city.trim().is_empty() {
            return Err(InvalidLocation::MissingCity);
        }
        Ok(Self {
            city,
            state: state.into(),
            country: country.into(),
        })
    }

    /// Stable string form used as the cache key.
    pub fn cache_key(&self) -> String {
        format!("{}:{}:{}", self.city, self.state, self.country)
    }
}

impl std::fmt::Display for LocationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.cache_key())
    }
}

/// One weather reading for a location. Immutable once produced; every new
/// reading for a key becomes a new store row, and "current" means the most
/// recently inserted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Observation {
    pub city: String,
    pub state: String,
    pub country: String,
    pub main: String,
    pub description: String,
    pub temp: f64,
    pub feels_like: f64,
    pub temp_min: f64,
    pub temp_max: f64,
    pub pressure: f64,
    pub humidity: f64,
    pub visibility: Option<i64>,
    pub wind_speed: f64,
    pub wind_deg: f64,
    pub clouds_all: f64,
    pub coord_lat: f64,
    pub coord_lon: f64,
}

/// Fill request carried through the work queue, exactly as submitted at
/// miss time. Delivery is at-least-once, so processing must tolerate
/// duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub city: String,
    pub state: String,
    pub country: String,
}

impl From<&LocationKey> for QueueMessage {
    fn from(key: &LocationKey) -> Self {
        Self {
            city: key.city.clone(),
            state: key.state.clone(),
            country: key.country.clone(),
        }
    }
}

impl QueueMessage {
    /// Re-validate the message on the consuming side; a message without a
    /// city can never be processed.
    pub fn location_key(&self) -> Result<LocationKey, InvalidLocation> {
        LocationKey::new(self.city.clone(), self.state.clone(), self.country.clone())
    }
}

/// Value stored at a location's cache key. Absence of any entry is the
/// third state (never fetched, expired, or invalidated).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CacheEntry {
    /// In-flight sentinel: a fill has been enqueued. Carries no data and is
    /// written with its own short TTL so a lost worker cannot wedge the key.
    Pending,
    /// Cached observation with the store row's insertion time.
    Resolved {
        observation: Observation,
        inserted_at: DateTime<Utc>,
    },
}

impl CacheEntry {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}
