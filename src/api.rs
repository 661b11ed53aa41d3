use crate::aggregator::{AggregateCache, CacheHealth};
use crate::config::Config;
use crate::error::CacheError;
use crate::models::{Info, Tx};
use axum::{
    extract::State,
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use eyre::{eyre, Result};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// HTTP face of a [`CacheError`].
pub struct ApiError(CacheError);

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            CacheError::Uninitialized => (StatusCode::SERVICE_UNAVAILABLE, self.0.to_string()),
            CacheError::Degraded(e) => {
                warn!("Serving 503, statistics degraded: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "statistics are temporarily unavailable".to_string(),
                )
            }
            CacheError::NotFound(_) => (StatusCode::NOT_FOUND, self.0.to_string()),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

type Cache = State<Arc<AggregateCache>>;

pub fn router(cache: Arc<AggregateCache>) -> Router {
    Router::new()
        .route("/", get(|| async { "Donation tracker API running" }))
        .route("/api/total", get(get_total))
        .route("/api/count", get(get_count))
        .route("/api/largest", get(get_largest))
        .route("/api/recent", get(get_recent))
        .route("/api/info", get(get_info))
        .route("/api/health", get(get_health))
        .with_state(cache)
}

/// CORS policy from config. `"*"` in the origins opens the API to any
/// origin without credentials; an explicit list allows credentials.
pub fn cors_layer(cfg: &Config) -> Result<CorsLayer> {
    let methods = cfg
        .allowed_methods
        .iter()
        .map(|m| {
            Method::from_bytes(m.trim().to_uppercase().as_bytes())
                .map_err(|_| eyre!("invalid HTTP method in allowed_methods: {:?}", m))
        })
        .collect::<Result<Vec<_>>>()?;

    let layer = CorsLayer::new().allow_methods(methods);

    if cfg.allowed_origins.iter().any(|o| o.trim() == "*") {
        return Ok(layer.allow_origin(Any));
    }

    let origins = cfg
        .allowed_origins
        .iter()
        .map(|o| {
            HeaderValue::from_str(o.trim())
                .map_err(|_| eyre!("invalid origin in allowed_origins: {:?}", o))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(layer.allow_origin(origins).allow_credentials(true))
}

pub async fn serve(cfg: Config, cache: Arc<AggregateCache>, shutdown: CancellationToken) -> Result<()> {
    let app = router(cache).layer(cors_layer(&cfg)?);

    let listener = tokio::net::TcpListener::bind((cfg.bind_host.as_str(), cfg.port)).await?;
    info!("API listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

async fn get_total(State(cache): Cache) -> Result<Json<Decimal>, ApiError> {
    Ok(Json(cache.get_total()?))
}

async fn get_count(State(cache): Cache) -> Result<Json<i64>, ApiError> {
    Ok(Json(cache.get_count()?))
}

async fn get_largest(State(cache): Cache) -> Result<Json<Tx>, ApiError> {
    Ok(Json(cache.get_largest()?))
}

async fn get_recent(State(cache): Cache) -> Result<Json<Tx>, ApiError> {
    Ok(Json(cache.get_most_recent()?))
}

async fn get_info(State(cache): Cache) -> Result<Json<Info>, ApiError> {
    Ok(Json(cache.get_info()?))
}

async fn get_health(State(cache): Cache) -> Json<serde_json::Value> {
    let state: CacheHealth = cache.health();
    Json(json!({ "state": state }))
}
