use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use echarts_export_core::{CleanupScheduler, MetricsCollector, TaskManager};

use crate::handlers::{
    charts::{generate_chart, get_chart_status},
    health::liveness,
    system::{
        cleanup_status, manual_cleanup, performance, prometheus_metrics, queue_status,
        system_health,
    },
};

/// 请求体上限：10MB
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TaskManager>,
    pub cleanup_scheduler: Arc<CleanupScheduler>,
    pub metrics: Arc<MetricsCollector>,
}

pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/api/charts/generate", post(generate_chart))
        .route("/api/charts/status/{id}", get(get_chart_status))
        .route("/api/system/queue-status", get(queue_status))
        .route("/api/system/health", get(system_health))
        .route("/api/system/metrics", get(prometheus_metrics))
        .route("/api/system/performance", get(performance))
        .route("/api/system/cleanup-status", get(cleanup_status))
        .route("/api/system/cleanup/manual", post(manual_cleanup))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}
