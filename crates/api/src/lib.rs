pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use tower::ServiceBuilder;

use middleware::{cors_layer, track_metrics, trace_layer};
pub use routes::AppState;

/// 组装完整的HTTP应用
pub fn create_app(state: AppState) -> Router {
    let metrics = Arc::clone(&state.metrics);
    routes::create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(cors_layer())
            .layer(axum::middleware::from_fn_with_state(metrics, track_metrics)),
    )
}
