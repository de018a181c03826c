use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

// API Routes - every SQL path goes through the safety gate
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            // Validation only
            .route("/validate", post(handlers::api::validate_sql))
            // Query endpoints
            .route("/query", post(handlers::api::execute_query))
            .route("/nl-query", post(handlers::api::nl_query))
            // Schema and audit
            .route("/databases", get(handlers::api::list_databases))
            .route("/audit", get(handlers::api::recent_audit))
            // System status
            .route("/status", get(handlers::api::system_status)),
    )
}
