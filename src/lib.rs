pub mod auth;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod feed;
pub mod http;
mod middleware;
pub mod models;
pub mod state;
pub mod ws;

use axum::{Router, middleware as axum_middleware};
use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use middleware::{cors_layer, create_global_rate_limiter, rate_limit_middleware};
use std::{net::SocketAddr, sync::Arc};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::{
    config::Config,
    db::{InMemoryStore, RatingStore, RedisStore},
    engine::RatingEngine,
    errors::AppError,
    state::AppState,
};

pub async fn build_store(config: &Config) -> Result<Arc<dyn RatingStore>, AppError> {
    match &config.redis_url {
        Some(redis_url) => {
            let manager = RedisConnectionManager::new(redis_url.as_str())?;
            let redis_pool = Pool::builder()
                .connection_timeout(config.store_timeout)
                .build(manager)
                .await?;

            tracing::info!("Using Redis rating store under '{}'", config.namespace);
            Ok(Arc::new(RedisStore::new(
                redis_pool,
                config.namespace.clone(),
                config.max_tx_attempts,
            )))
        }
        None => {
            tracing::warn!("REDIS_URL not set; ratings are kept in memory and lost on restart");
            Ok(Arc::new(InMemoryStore::new(config.max_tx_attempts)))
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    let global_rate_limiter = create_global_rate_limiter();
    let allowed_origins = state.config.allowed_origins.clone();
    let max_concurrent_requests = state.config.max_concurrent_requests;

    Router::new()
        .merge(http::create_http_routes(state.clone()))
        .merge(ws::create_ws_routes(state))
        .layer(axum_middleware::from_fn(move |req, next| {
            rate_limit_middleware(global_rate_limiter.clone(), req, next)
        }))
        .layer(cors_layer(&allowed_origins))
        .layer(GlobalConcurrencyLimitLayer::new(max_concurrent_requests))
        .layer(TraceLayer::new_for_http())
        .fallback(|| async { "404 Not Found" })
}

pub async fn start_server() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    let store = build_store(&config).await?;
    let port = config.port;

    let state = AppState {
        engine: Arc::new(RatingEngine::new(store)),
        config: Arc::new(config),
    };

    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .map_err(|e| AppError::EnvError(format!("Failed to bind port {port}: {e}")))?;

    tracing::info!("Rating service listening on http://0.0.0.0:{port}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| {
        tracing::error!("Server error: {}", e);
        AppError::InternalError
    })
}
