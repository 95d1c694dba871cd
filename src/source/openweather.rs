use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::sleep;

use super::{Coordinates, CurrentReading, Geocoder, ObservationSource, SourceError};
use crate::config::Config;

pub struct OpenWeatherClient {
    client: Client,
    config: Config,
}

impl OpenWeatherClient {
    pub fn new(config: Config) -> Result<Self, SourceError> {
        let client = Client::builder()
            .user_agent("WeatherCacheServer/1.0")
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self { client, config })
    }

    /// Query string for the geocoding endpoint: comma-joined non-empty
    /// parts. A state without a country implies a US state.
    fn geocode_query(city: &str, state: &str, country: &str) -> String {
        let country = if !state.is_empty() && country.is_empty() {
            "US"
        } else {
            country
        };

        [city, state, country]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(",")
    }

    async fn make_request_with_retry(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<Value, SourceError> {
        let mut retry_count = 0;
        let max_retries = 3;
        let mut delay = Duration::from_millis(1000);

        loop {
            let response = self.client.get(url).query(params).send().await?;

            match response.status() {
                reqwest::StatusCode::OK => {
                    let json: Value = response.json().await?;
                    return Ok(json);
                }
                reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    if retry_count >= max_retries {
                        return Err(SourceError::RateLimited(delay.as_secs()));
                    }

                    tracing::warn!(
                        "Rate limited by OpenWeather API, retrying in {}ms",
                        delay.as_millis()
                    );

                    sleep(delay).await;
                    delay = delay.mul_f32(2.0 + fastrand::f32() * 0.5); // Exponential backoff with jitter
                    retry_count += 1;
                }
                status => {
                    let error_text = response.text().await.unwrap_or_default();
                    return Err(SourceError::ApiError(format!(
                        "HTTP {}: {}",
                        status, error_text
                    )));
                }
            }
        }
    }

    fn is_valid_coordinates(lat: f64, lon: f64) -> bool {
        (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
    }
}

#[async_trait]
impl Geocoder for OpenWeatherClient {
    async fn resolve(
        &self,
        city: &str,
        state: &str,
        country: &str,
    ) -> Result<Vec<Coordinates>, SourceError> {
        let url = format!(
            "{}{}",
            self.config.openweather_base_url, self.config.openweather_geocode_path
        );
        let query = Self::geocode_query(city, state, country);

        let response = self
            .make_request_with_retry(
                &url,
                &[
                    ("q", query.as_str()),
                    ("limit", "1"),
                    ("appid", &self.config.openweather_api_key),
                ],
            )
            .await?;

        let entries: Vec<GeocodeEntry> = serde_json::from_value(response)?;
        tracing::debug!("Geocoded '{}' to {} candidate(s)", query, entries.len());

        Ok(entries
            .into_iter()
            .map(|entry| Coordinates {
                lat: entry.lat,
                lon: entry.lon,
            })
            .collect())
    }
}

#[async_trait]
impl ObservationSource for OpenWeatherClient {
    async fn fetch_current(&self, lat: f64, lon: f64) -> Result<CurrentReading, SourceError> {
        if !Self::is_valid_coordinates(lat, lon) {
            return Err(SourceError::InvalidCoordinates);
        }

        let url = format!(
            "{}{}",
            self.config.openweather_base_url, self.config.openweather_weather_path
        );

        let response = self
            .make_request_with_retry(
                &url,
                &[
                    ("lat", &lat.to_string()),
                    ("lon", &lon.to_string()),
                    ("units", "metric"),
                    ("appid", &self.config.openweather_api_key),
                ],
            )
            .await?;

        let current: CurrentWeatherResponse = serde_json::from_value(response)?;
        CurrentReading::try_from(current)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GeocodeEntry {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct CurrentWeatherResponse {
    name: String,
    weather: Vec<WeatherCondition>,
    main: MainReadings,
    visibility: Option<i64>,
    wind: Wind,
    clouds: Clouds,
    coord: Coord,
}

#[derive(Debug, Clone, Deserialize)]
struct WeatherCondition {
    main: String,
    description: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MainReadings {
    temp: f64,
    feels_like: f64,
    temp_min: f64,
    temp_max: f64,
    pressure: f64,
    humidity: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct Wind {
    speed: f64,
    deg: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct Clouds {
    all: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct Coord {
    lat: f64,
    lon: f64,
}

impl TryFrom<CurrentWeatherResponse> for CurrentReading {
    type Error = SourceError;

    fn try_from(response: CurrentWeatherResponse) -> Result<Self, Self::Error> {
        let condition = response
            .weather
            .first()
            .ok_or_else(|| SourceError::ApiError("missing weather conditions".to_string()))?;

        Ok(CurrentReading {
            station: response.name,
            main: condition.main.clone(),
            description: condition.description.clone(),
            temp: response.main.temp,
            feels_like: response.main.feels_like,
            temp_min: response.main.temp_min,
            temp_max: response.main.temp_max,
            pressure: response.main.pressure,
            humidity: response.main.humidity,
            visibility: response.visibility,
            wind_speed: response.wind.speed,
            wind_deg: response.wind.deg,
            clouds_all: response.clouds.all,
            coord: Coordinates {
                lat: response.coord.lat,
                lon: response.coord.lon,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geocode_query_joins_non_empty_parts() {
        assert_eq!(OpenWeatherClient::geocode_query("Paris", "", "FR"), "Paris,FR");
        assert_eq!(OpenWeatherClient::geocode_query("Tokyo", "", ""), "Tokyo");
        assert_eq!(
            OpenWeatherClient::geocode_query("Austin", "TX", "US"),
            "Austin,TX,US"
        );
    }

    #[test]
    fn geocode_query_defaults_country_for_bare_states() {
        assert_eq!(
            OpenWeatherClient::geocode_query("Austin", "TX", ""),
            "Austin,TX,US"
        );
    }

    #[test]
    fn current_weather_payload_parses_into_reading() {
        let payload = serde_json::json!({
            "coord": {"lon": 2.35, "lat": 48.85},
            "weather": [{"id": 803, "main": "Clouds", "description": "broken clouds", "icon": "04d"}],
            "main": {
                "temp": 14.2, "feels_like": 13.6, "temp_min": 12.0, "temp_max": 16.1,
                "pressure": 1012, "humidity": 78
            },
            "visibility": 10000,
            "wind": {"speed": 4.1, "deg": 220},
            "clouds": {"all": 75},
            "name": "Paris"
        });

        let response: CurrentWeatherResponse = serde_json::from_value(payload).unwrap();
        let reading = CurrentReading::try_from(response).unwrap();

        assert_eq!(reading.station, "Paris");
        assert_eq!(reading.main, "Clouds");
        assert_eq!(reading.temp, 14.2);
        assert_eq!(reading.pressure, 1012.0);
        assert_eq!(reading.visibility, Some(10000));
        assert_eq!(reading.coord.lat, 48.85);
    }

    #[test]
    fn empty_weather_array_is_an_api_error() {
        let payload = serde_json::json!({
            "coord": {"lon": 0.0, "lat": 0.0},
            "weather": [],
            "main": {
                "temp": 0.0, "feels_like": 0.0, "temp_min": 0.0, "temp_max": 0.0,
                "pressure": 1000, "humidity": 50
            },
            "wind": {"speed": 0.0, "deg": 0},
            "clouds": {"all": 0},
            "name": "Null Island"
        });

        let response: CurrentWeatherResponse = serde_json::from_value(payload).unwrap();
        assert!(matches!(
            CurrentReading::try_from(response),
            Err(SourceError::ApiError(_))
        ));
    }
}
