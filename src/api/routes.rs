//! Router assembly for the diagnostic HTTP surface, grounded in the
//! teacher's `api::routes::create_router` (minus the OpenAPI/Swagger
//! scaffolding, which this crate does not depend on).

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::manager::Manager;

use super::handlers;
use super::middleware::request_id_middleware;

pub fn create_router(manager: Manager) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/ports", get(handlers::list_ports))
        .route("/api/v1/data-points", get(handlers::list_data_points))
        .route("/api/v1/data-points/:name", get(handlers::query_data_point))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(manager)
}
