use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::coordinator::{CacheCoordinator, FetchOutcome};
use crate::model::{LocationKey, Observation};

// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<CacheCoordinator>,
}

#[derive(Debug, Deserialize)]
pub struct FetchWeatherQuery {
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FetchWeatherResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub weather: Option<Observation>,
}

impl FetchWeatherResponse {
    fn ready(observation: Observation) -> Self {
        Self {
            success: true,
            error: None,
            weather: Some(observation),
        }
    }

    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            weather: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

// Route handlers
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn fetch_weather(
    State(state): State<AppState>,
    Query(params): Query<FetchWeatherQuery>,
) -> Result<Json<FetchWeatherResponse>, StatusCode> {
    let city = params.city.unwrap_or_default();
    let key = match LocationKey::new(
        city,
        params.state.unwrap_or_default(),
        params.country.unwrap_or_default(),
    ) {
        Ok(key) => key,
        Err(_) => return Ok(Json(FetchWeatherResponse::failure("City is required."))),
    };

    tracing::debug!("Weather requested for {}", key);

    match state.coordinator.get_weather(&key).await {
        Ok(FetchOutcome::Ready(observation)) => {
            Ok(Json(FetchWeatherResponse::ready(observation)))
        }
        Ok(FetchOutcome::Pending) => Ok(Json(FetchWeatherResponse::failure(
            "Data is being fetched. Please try again shortly.",
        ))),
        Err(e) => {
            tracing::error!("Weather lookup failed for {}: {}", key, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/fetch_weather", get(fetch_weather))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_response_carries_the_retry_hint() {
        let response =
            FetchWeatherResponse::failure("Data is being fetched. Please try again shortly.");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("try again"));
        assert!(json.get("temp").is_none());
    }

    #[test]
    fn ready_response_flattens_the_observation() {
        let observation = Observation {
            city: "Paris".to_string(),
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
        };
        let json = serde_json::to_value(FetchWeatherResponse::ready(observation)).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["city"], "Paris");
        assert_eq!(json["temp"], 20.0);
        assert!(json.get("error").is_none());
    }
}
