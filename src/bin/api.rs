use std::sync::Arc;

use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use weather_cache_server::cache::RedisCache;
use weather_cache_server::coordinator::{CacheCoordinator, CoordinatorSettings};
use weather_cache_server::queue::RedisQueue;
use weather_cache_server::routes::{create_router, AppState};
use weather_cache_server::store::SqliteObservationStore;
use weather_cache_server::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weather_cache_server=debug,tower_http=debug".into()),
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

    let coordinator = Arc::new(CacheCoordinator::new(
        cache,
        queue,
        store,
        CoordinatorSettings::from(&config),
    ));

    let state = AppState { coordinator };
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("API server listening on http://{}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
