use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use echarts_export_domain::{ChartConfig, RenderTask};

use crate::{
    error::{ApiError, ApiResult},
    response::{success, ApiResponse},
    routes::AppState,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedTask {
    pub task_id: String,
    pub status: &'static str,
    pub status_url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusView {
    pub task_id: String,
    pub status: &'static str,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
}

impl From<RenderTask> for TaskStatusView {
    fn from(task: RenderTask) -> Self {
        Self {
            task_id: task.id.to_string(),
            status: task.state.as_str(),
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            image_url: task.image_url,
            file_name: task.file_name,
            error: task.error,
            retry_count: task.retry_count,
        }
    }
}

/// POST /api/charts/generate
///
/// 校验后入队，立刻返回任务id；渲染与上传在后台进行。
pub async fn generate_chart(
    State(state): State<AppState>,
    Json(config): Json<ChartConfig>,
) -> ApiResult<ApiResponse<GeneratedTask>> {
    let task = state.manager.create_task(config)?;
    Ok(success(GeneratedTask {
        task_id: task.id.to_string(),
        status: "pending",
        status_url: format!("/api/charts/status/{}", task.id),
        created_at: task.created_at,
    }))
}

/// GET /api/charts/status/{id}
pub async fn get_chart_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ApiResponse<TaskStatusView>> {
    let task_id = Uuid::parse_str(&id).map_err(|_| ApiError::NotFound(id.clone()))?;
    let task = state
        .manager
        .get_task(task_id)
        .ok_or(ApiError::NotFound(id))?;
    Ok(success(TaskStatusView::from(task)))
}
