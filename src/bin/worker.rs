use std::sync::Arc;

use sqlx::SqlitePool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use weather_cache_server::cache::RedisCache;
use weather_cache_server::queue::RedisQueue;
use weather_cache_server::source::openweather::OpenWeatherClient;
use weather_cache_server::store::SqliteObservationStore;
use weather_cache_server::{Config, FillWorker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weather_cache_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize the observation store
    let pool = SqlitePool::connect(&config.database_url).await?;
    let store = Arc::new(SqliteObservationStore::new(pool));
    store.init_tables().await?;

    // Initialize the shared cache and the fill queue
    let cache = Arc::new(RedisCache::connect(&config.redis_url).await?);
    let queue = Arc::new(
        RedisQueue::connect(
            &config.redis_url,
            &config.queue_name,
            config.visibility_timeout,
            config.max_deliveries,
        )
        .await?,
    );

    // One client serves both the geocoding and the weather endpoints
    let client = Arc::new(OpenWeatherClient::new(config.clone())?);

    let worker = FillWorker::new(
        queue,
        client.clone(),
        client,
        store,
        cache,
        config.receive_wait,
    );

    tracing::info!("Worker starting; polling queue '{}'", config.queue_name);

    tokio::select! {
        _ = worker.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
