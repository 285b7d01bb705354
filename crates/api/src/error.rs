use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use echarts_export_errors::ExportError;

use crate::response::{ApiResponse, ErrorBody};

/// 对外错误分类
#[derive(Debug)]
pub enum ApiError {
    /// 请求形状或配置越界，逐条列出违规项
    Validation(Vec<String>),
    /// 未知任务id
    NotFound(String),
    /// 渲染或上传在重试耗尽后失败
    Processing(String),
    /// 队列或调度器内部异常
    System(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<ExportError> for ApiError {
    fn from(err: ExportError) -> Self {
        match err {
            ExportError::InvalidTaskConfig(msg) => {
                ApiError::Validation(msg.split("; ").map(String::from).collect())
            }
            ExportError::TaskNotFound { id } => ApiError::NotFound(id),
            ExportError::InvalidChartOption | ExportError::UnsupportedImageType(_) => {
                ApiError::Validation(vec![err.to_string()])
            }
            ExportError::Render(_)
            | ExportError::ObjectStore(_)
            | ExportError::Timeout(_)
            | ExportError::Cleanup(_) => ApiError::Processing(err.to_string()),
            other => ApiError::System(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Validation(violations) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    kind: "VALIDATION_ERROR".to_string(),
                    message: format!("invalid task config: {}", violations.join("; ")),
                    details: Some(violations),
                },
            ),
            ApiError::NotFound(id) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    kind: "NOT_FOUND_ERROR".to_string(),
                    message: format!("task not found: {id}"),
                    details: None,
                },
            ),
            ApiError::Processing(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    kind: "PROCESSING_ERROR".to_string(),
                    message,
                    details: None,
                },
            ),
            ApiError::System(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    kind: "SYSTEM_ERROR".to_string(),
                    message,
                    details: None,
                },
            ),
        };

        let msg = body.message.clone();
        ApiResponse::failure(status, msg, body).into_response()
    }
}
