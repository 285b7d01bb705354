use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 图表渲染请求配置，创建后不可变
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChartConfig {
    /// 输出格式：png/jpeg/jpg/svg/pdf
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub chart_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    /// ECharts option 对象，必须包含 series 或 dataset
    #[serde(default)]
    pub option: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oss_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskState {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "processing")]
    Processing,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Processing => "processing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }
}

/// 渲染任务记录
///
/// 任务在进程内的完整生命周期由队列独占持有，外部只能拿到快照。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderTask {
    pub id: Uuid,
    pub config: ChartConfig,
    pub state: TaskState,
    pub image_url: Option<String>,
    pub file_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl RenderTask {
    pub fn new(config: ChartConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            state: TaskState::Pending,
            image_url: None,
            file_name: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            retry_count: 0,
        }
    }

    /// 进入处理中状态；started_at 只在首次进入时写入
    pub fn mark_started(&mut self) {
        self.state = TaskState::Processing;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn mark_completed(&mut self, image_url: String, file_name: Option<String>) {
        self.state = TaskState::Completed;
        self.image_url = Some(image_url);
        self.file_name = file_name;
        self.completed_at = Some(Utc::now());
        self.error = None;
    }

    pub fn mark_failed(&mut self, reason: &str) {
        self.state = TaskState::Failed;
        self.error = Some(reason.to_string());
        self.completed_at = Some(Utc::now());
    }

    /// 重试：回到 pending，清空错误，计数加一
    pub fn mark_retrying(&mut self) {
        self.retry_count += 1;
        self.state = TaskState::Pending;
        self.error = None;
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, TaskState::Completed | TaskState::Failed)
    }

    pub fn processing_duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some((completed - started).num_milliseconds()),
            _ => None,
        }
    }
}

/// 队列状态快照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub pending_tasks: usize,
    pub processing_tasks: usize,
    pub completed_tasks: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    /// 最近至多1000个任务的平均处理耗时（毫秒）
    pub average_processing_time: f64,
    pub max_concurrent: usize,
}
