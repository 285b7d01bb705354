use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use echarts_export_core::{CleanupOutcome, DeleteFailure, PROMETHEUS_CONTENT_TYPE};
use echarts_export_domain::QueueStatus;

use crate::{
    error::ApiResult,
    response::{success, ApiResponse},
    routes::AppState,
};

/// 等待队列超过该深度则判定服务降级
const DEGRADED_PENDING_THRESHOLD: usize = 1000;

/// 堆内存超过该值（MB）判定降级；读数缺失时跳过该项检查
const DEGRADED_MEMORY_THRESHOLD_MB: f64 = 1024.0;

/// GET /api/system/queue-status
pub async fn queue_status(State(state): State<AppState>) -> ApiResult<ApiResponse<QueueStatus>> {
    Ok(success(state.manager.queue_status()))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub status: String,
    pub pending_tasks: usize,
    pub processing_tasks: usize,
    pub uptime_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage_mb: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// GET /api/system/health
///
/// 队列积压超限或内存越线时降级为503。
pub async fn system_health(State(state): State<AppState>) -> impl IntoResponse {
    let queue = state.manager.queue_status();
    let snapshot = state.metrics.snapshot();

    let memory_over = snapshot
        .system
        .memory_usage_mb
        .map(|mb| mb > DEGRADED_MEMORY_THRESHOLD_MB)
        .unwrap_or(false);
    let degraded = queue.pending_tasks > DEGRADED_PENDING_THRESHOLD || memory_over;

    let health = SystemHealth {
        status: if degraded { "degraded" } else { "healthy" }.to_string(),
        pending_tasks: queue.pending_tasks,
        processing_tasks: queue.processing_tasks,
        uptime_seconds: snapshot.system.uptime_seconds,
        memory_usage_mb: snapshot.system.memory_usage_mb,
        timestamp: Utc::now(),
    };

    if degraded {
        ApiResponse::with_status(StatusCode::SERVICE_UNAVAILABLE, "degraded", health)
    } else {
        success(health)
    }
}

/// GET /api/system/metrics
///
/// Prometheus 文本协议，不走统一JSON封装。
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.metrics.render_prometheus(),
    )
}

/// GET /api/system/performance
pub async fn performance(
    State(state): State<AppState>,
) -> ApiResult<ApiResponse<echarts_export_core::MetricsSnapshot>> {
    Ok(success(state.metrics.snapshot()))
}

/// GET /api/system/cleanup-status
pub async fn cleanup_status(
    State(state): State<AppState>,
) -> ApiResult<ApiResponse<echarts_export_core::CleanupSchedulerStatus>> {
    Ok(success(state.cleanup_scheduler.status()))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualCleanupResult {
    pub cleaned_tasks: usize,
    pub deleted_files: usize,
    pub errors: Vec<DeleteFailure>,
    pub timestamp: DateTime<Utc>,
}

impl From<CleanupOutcome> for ManualCleanupResult {
    fn from(outcome: CleanupOutcome) -> Self {
        Self {
            cleaned_tasks: outcome.cleaned_tasks,
            deleted_files: outcome.deleted_files,
            errors: outcome.errors,
            timestamp: Utc::now(),
        }
    }
}

/// POST /api/system/cleanup/manual
///
/// 删除失败只体现在 errors 数组里，整体仍然返回200。
pub async fn manual_cleanup(
    State(state): State<AppState>,
) -> ApiResult<ApiResponse<ManualCleanupResult>> {
    let outcome = state.cleanup_scheduler.trigger_manual().await?;
    Ok(success(ManualCleanupResult::from(outcome)))
}
