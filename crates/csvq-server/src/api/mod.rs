use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;

use crate::config::CorsConfig;
use crate::error::{AppError, AppResult};
use crate::features::{self, FeatureState};
use crate::middleware;

/// Build the application router: `/health` plus the feature routes under `/api/v1`.
pub fn create_router(state: FeatureState, cors: &CorsConfig) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health))
        .with_state(state.clone());

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", features::router(state))
        .layer(middleware::tracing_layer())
        .layer(middleware::cors_layer(cors))
}

async fn health(State(state): State<FeatureState>) -> AppResult<Response> {
    state.store.health_check().await.map_err(|e| {
        tracing::error!("Database health check failed: {:?}", e);
        AppError::Unavailable("database is not reachable".to_string())
    })?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "database": "connected"
        })),
    )
        .into_response())
}
