use async_trait::async_trait;

use super::{Coordinates, CurrentReading, Geocoder, ObservationSource, SourceError};

/// Fixed-table geocoder for tests and offline runs. Unknown cities resolve
/// to an empty list, mirroring the real geocoding endpoint.
pub struct MockGeocoder;

const KNOWN_LOCATIONS: &[(&str, f64, f64)] = &[
    ("Paris", 48.85, 2.35),
    ("Tokyo", 35.68, 139.69),
    ("Bangkok", 13.7563, 100.5018),
    ("Austin", 30.2672, -97.7431),
    ("Berlin", 52.52, 13.405),
];

#[async_trait]
impl Geocoder for MockGeocoder {
    async fn resolve(
        &self,
        city: &str,
        _state: &str,
        _country: &str,
    ) -> Result<Vec<Coordinates>, SourceError> {
        let city_lower = city.to_lowercase();
        Ok(KNOWN_LOCATIONS
            .iter()
            .filter(|(name, _, _)| name.to_lowercase() == city_lower)
            .map(|&(_, lat, lon)| Coordinates { lat, lon })
            .collect())
    }
}

/// Deterministic reading source: conditions derived from the coordinates so
/// repeated fetches for a location are stable and assertable.
pub struct MockObservationSource;

#[async_trait]
impl ObservationSource for MockObservationSource {
    async fn fetch_current(&self, lat: f64, lon: f64) -> Result<CurrentReading, SourceError> {
        let temp = 25.0 - lat.abs() * 0.3;
        Ok(CurrentReading {
            station: format!("Station {:.2},{:.2}", lat, lon),
            main: "Clear".to_string(),
            description: "clear sky".to_string(),
            temp,
            feels_like: temp - 0.5,
            temp_min: temp - 2.0,
            temp_max: temp + 2.0,
            pressure: 1013.0,
            humidity: 60.0,
            visibility: Some(10000),
            wind_speed: 3.2,
            wind_deg: 180.0,
            clouds_all: 5.0,
            coord: Coordinates { lat, lon },
        })
    }
}
