use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{LocationKey, Observation};

pub mod mock;
pub mod openweather;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("JSON parsing failed: {0}")]
    JsonParsing(#[from] serde_json::Error),
    #[error("Rate limited, retry after: {0}s")]
    RateLimited(u64),
    #[error("API error: {0}")]
    ApiError(String),
    #[error("Invalid coordinates")]
    InvalidCoordinates,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

/// Resolves a location name to candidate coordinates. An empty result means
/// the provider does not know the location; transport failures are errors.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn resolve(
        &self,
        city: &str,
        state: &str,
        country: &str,
    ) -> Result<Vec<Coordinates>, SourceError>;
}

/// Fetches a current reading for a coordinate pair.
#[async_trait]
pub trait ObservationSource: Send + Sync {
    async fn fetch_current(&self, lat: f64, lon: f64) -> Result<CurrentReading, SourceError>;
}

/// Raw upstream reading, before it is stamped with the location identity
/// the caller asked about.
#[derive(Debug, Clone)]
pub struct CurrentReading {
    /// Station name reported by the provider; may differ from the queried
    /// city and is kept for logging only.
    pub station: String,
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
    pub coord: Coordinates,
}

impl CurrentReading {
    /// Stamp the reading with the identity the fill was requested for, so
    /// store lookups by that key always find it.
    pub fn into_observation(self, key: &LocationKey) -> Observation {
        Observation {
            city: key.city.clone(),
            state: key.state.clone(),
            country: key.country.clone(),
            main: self.main,
            description: self.description,
            temp: self.temp,
            feels_like: self.feels_like,
            temp_min: self.temp_min,
            temp_max: self.temp_max,
            pressure: self.pressure,
            humidity: self.humidity,
            visibility: self.visibility,
            wind_speed: self.wind_speed,
            wind_deg: self.wind_deg,
            clouds_all: self.clouds_all,
            coord_lat: self.coord.lat,
            coord_lon: self.coord.lon,
        }
    }
}
