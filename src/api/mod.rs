//! API module
//!
//! HTTP API endpoints and middleware.

pub mod middleware;
pub mod routes;

use axum::{extract::State, http::StatusCode, middleware as axum_middleware, Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

pub use routes::AppState;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // Axum layers run last-added first:
    // context -> logging -> actor -> handler
    let actor_routes = routes::actor_routes().layer(axum_middleware::from_fn(
        middleware::actor_middleware,
    ));

    let api_router = actor_routes
        .merge(routes::onboarding_routes())
        .layer(axum_middleware::from_fn(middleware::logging_middleware))
        .layer(axum_middleware::from_fn(middleware::context_middleware));

    Router::new()
        // Health check (no actor)
        .route("/health", axum::routing::get(health_check))
        .nest("/api/v1", api_router)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let backend = state.storage.backend_name();
    match state.storage.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "backend": backend })),
        ),
        Err(e) => {
            tracing::error!(backend, error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "backend": backend })),
            )
        }
    }
}
