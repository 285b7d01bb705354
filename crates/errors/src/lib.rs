use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("invalid task config: {0}")]
    InvalidTaskConfig(String),
    #[error("task not found: {id}")]
    TaskNotFound { id: String },
    #[error("duplicate task: {id}")]
    DuplicateTask { id: String },
    #[error("invalid chart option")]
    InvalidChartOption,
    #[error("unsupported image type: {0}")]
    UnsupportedImageType(String),
    #[error("渲染失败: {0}")]
    Render(String),
    #[error("对象存储错误: {0}")]
    ObjectStore(String),
    #[error("清理失败: {0}")]
    Cleanup(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type ExportResult<T> = Result<T, ExportError>;

impl ExportError {
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn duplicate_task<S: Into<String>>(id: S) -> Self {
        Self::DuplicateTask { id: id.into() }
    }
    pub fn invalid_task_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTaskConfig(msg.into())
    }
    pub fn object_store<S: Into<String>>(msg: S) -> Self {
        Self::ObjectStore(msg.into())
    }
    pub fn render<S: Into<String>>(msg: S) -> Self {
        Self::Render(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    /// 瞬时性错误允许适配层按退避策略重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExportError::ObjectStore(_) | ExportError::Timeout(_))
    }
    /// 校验类错误直接反馈给调用方，不进入队列
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ExportError::InvalidTaskConfig(_)
                | ExportError::InvalidChartOption
                | ExportError::UnsupportedImageType(_)
        )
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(err: serde_json::Error) -> Self {
        ExportError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for ExportError {
    fn from(err: anyhow::Error) -> Self {
        ExportError::Internal(err.to_string())
    }
}
