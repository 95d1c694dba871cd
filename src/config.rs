use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub openweather_api_key: String,
    pub openweather_base_url: String,
    pub openweather_geocode_path: String,
    pub openweather_weather_path: String,
    pub redis_url: String,
    pub database_url: String,
    pub queue_name: String,
    pub bind_addr: String,
    /// How long a Resolved cache entry stays servable.
    pub freshness_ttl: Duration,
    /// How long the in-flight sentinel may live without a fill completing.
    pub pending_ttl: Duration,
    /// Upper bound on how long a request waits for an in-flight fill.
    pub fill_wait: Duration,
    /// Cache re-check interval while waiting for a fill.
    pub poll_interval: Duration,
    /// Long-poll bound for one queue receive.
    pub receive_wait: Duration,
    /// Redelivery window for unacknowledged messages.
    pub visibility_timeout: Duration,
    /// Deliveries allowed before a message is dead-lettered.
    pub max_deliveries: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Config {
            openweather_api_key: env::var("OPENWEATHER_API_KEY")
                .map_err(|_| anyhow::anyhow!("OPENWEATHER_API_KEY not set"))?,
            openweather_base_url: env::var("OPENWEATHER_BASE_URL")
                .unwrap_or_else(|_| "https://api.openweathermap.org".to_string()),
            openweather_geocode_path: env::var("OPENWEATHER_GEOCODE_PATH")
                .unwrap_or_else(|_| "/geo/1.0/direct".to_string()),
            openweather_weather_path: env::var("OPENWEATHER_WEATHER_PATH")
                .unwrap_or_else(|_| "/data/2.5/weather".to_string()),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./weather_cache.db?mode=rwc".to_string()),
            queue_name: env::var("QUEUE_NAME").unwrap_or_else(|_| "weather-fill".to_string()),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:5000".to_string()),
            freshness_ttl: secs_var("CACHE_FRESHNESS_TTL_SECS", 600),
            pending_ttl: secs_var("CACHE_PENDING_TTL_SECS", 30),
            fill_wait: millis_var("FILL_WAIT_MS", 2000),
            poll_interval: millis_var("FILL_POLL_INTERVAL_MS", 100),
            receive_wait: secs_var("QUEUE_RECEIVE_WAIT_SECS", 10),
            visibility_timeout: secs_var("QUEUE_VISIBILITY_SECS", 60),
            max_deliveries: env::var("QUEUE_MAX_DELIVERIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        })
    }
}

fn secs_var(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        env::var(name)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default),
    )
}

fn millis_var(name: &str, default: u64) -> Duration {
    Duration::from_millis(
        env::var(name)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default),
    )
}
