use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use echarts_export_config::QueueConfig;
use echarts_export_domain::{ChartConfig, QueueEvent, QueueEventListener, QueueStatus, RenderTask, TaskState};
use echarts_export_errors::{ExportError, ExportResult};

use crate::metrics::MetricsCollector;
use crate::oss::OssAdapter;
use crate::queue::TaskQueue;
use crate::renderer::ChartRenderer;

/// 队列仪表刷新周期
const GAUGE_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// 对象删除的批大小与批间隔
const DELETE_BATCH_SIZE: usize = 10;
const DELETE_BATCH_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub retention_days: i64,
    pub cleanup_interval: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            retention_days: 7,
            cleanup_interval: Duration::from_secs(24 * 3600),
        }
    }
}

/// 一次清理的聚合结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOutcome {
    pub cleaned_tasks: usize,
    pub deleted_files: usize,
    pub errors: Vec<DeleteFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFailure {
    pub file_name: String,
    pub error: String,
}

/// 任务编排器
///
/// 把校验、调度、渲染、上传和指标粘在一起：队列负责状态机，
/// 编排器在 taskStarted 事件上驱动渲染与上传，并把结果送回队列。
pub struct TaskManager {
    queue: Arc<TaskQueue>,
    renderer: Arc<dyn ChartRenderer>,
    oss: Option<Arc<OssAdapter>>,
    metrics: Arc<MetricsCollector>,
    options: ManagerOptions,
    shutdowns: Mutex<Vec<oneshot::Sender<()>>>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TaskManager {
    pub fn new(
        queue_config: QueueConfig,
        renderer: Arc<dyn ChartRenderer>,
        oss: Option<Arc<OssAdapter>>,
        metrics: Arc<MetricsCollector>,
        options: ManagerOptions,
    ) -> Arc<Self> {
        let queue = Arc::new(TaskQueue::new(queue_config));
        let manager = Arc::new(Self {
            queue: Arc::clone(&queue),
            renderer,
            oss,
            metrics,
            options,
            shutdowns: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        });
        queue.subscribe(Arc::new(EventBridge {
            manager: Arc::downgrade(&manager),
        }));
        manager
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn oss(&self) -> Option<&Arc<OssAdapter>> {
        self.oss.as_ref()
    }

    /// 校验并提交渲染任务，返回入队时的任务快照
    pub fn create_task(&self, config: ChartConfig) -> ExportResult<RenderTask> {
        if let Err(violations) = validate_task_config(&config) {
            return Err(ExportError::invalid_task_config(violations.join("; ")));
        }

        let task = RenderTask::new(config);
        self.queue.enqueue(task.clone())?;
        self.metrics.record_task_created();
        info!(task_id = %task.id, "render task created");
        Ok(task)
    }

    pub fn get_task(&self, id: Uuid) -> Option<RenderTask> {
        self.queue.get_task(id)
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.get_status()
    }

    pub fn pause(&self) {
        self.queue.pause();
    }

    pub fn resume(&self) {
        self.queue.resume();
    }

    /// taskStarted 之后的处理路径：渲染 → 上传或内联dataURL → 回写队列
    async fn process_task(&self, task: RenderTask) {
        let task_id = task.id;
        match self.render_and_store(&task).await {
            Ok((image_url, file_name)) => {
                if let Err(e) = self.queue.complete_task(task_id, image_url, file_name) {
                    // 超时巡检可能已经回收了槽位，晚到的结果直接丢弃
                    warn!(task_id = %task_id, error = %e, "late completion discarded");
                }
            }
            Err(e) => {
                let reason = e.to_string();
                if let Err(fail_err) = self.queue.fail_task(task_id, &reason) {
                    debug!(task_id = %task_id, error = %fail_err, "late failure discarded");
                }
            }
        }
    }

    async fn render_and_store(&self, task: &RenderTask) -> ExportResult<(String, Option<String>)> {
        let rendered = self.renderer.render(&task.config, task.id).await?;

        match &self.oss {
            Some(oss) => {
                let upload_started = std::time::Instant::now();
                match oss
                    .upload_chart(
                        task.id,
                        &rendered.buffer,
                        &rendered.content_type,
                        &rendered.extension,
                        task.config.oss_path.as_deref(),
                    )
                    .await
                {
                    Ok(uploaded) => {
                        self.metrics.record_upload(
                            rendered.buffer.len(),
                            upload_started.elapsed().as_millis() as f64,
                        );
                        Ok((uploaded.url, Some(uploaded.file_name)))
                    }
                    Err(e) => {
                        self.metrics.record_upload_failure();
                        Err(e)
                    }
                }
            }
            None => {
                // 未配置对象存储时退化为内联dataURL，保持状态响应的形状不变
                let encoded = general_purpose::STANDARD.encode(&rendered.buffer);
                Ok((
                    format!("data:{};base64,{encoded}", rendered.content_type),
                    None,
                ))
            }
        }
    }

    /// 保留期清理入口
    ///
    /// 先扫队列归档，再删除这批记录对应的存储对象；单个删除失败
    /// 只进入聚合结果，不阻止内存记录的淘汰。
    pub async fn cleanup_expired_tasks(&self) -> ExportResult<CleanupOutcome> {
        let before = self.queue.get_status();
        debug!(
            completed = before.completed_tasks,
            retention_days = self.options.retention_days,
            "starting retention sweep"
        );

        let removed = self.queue.cleanup_expired_tasks(self.options.retention_days);
        let mut outcome = CleanupOutcome {
            cleaned_tasks: removed.len(),
            deleted_files: 0,
            errors: Vec::new(),
        };

        if self.oss.is_some() {
            let file_names: Vec<String> = removed
                .iter()
                .filter(|t| t.state == TaskState::Completed)
                .filter_map(|t| t.file_name.clone())
                .collect();
            if !file_names.is_empty() {
                let (deleted, errors) = self.delete_oss_files_with_error_handling(file_names).await;
                outcome.deleted_files = deleted;
                outcome.errors = errors;
            }
        }

        if outcome.cleaned_tasks > 0 {
            info!(
                cleaned = outcome.cleaned_tasks,
                deleted = outcome.deleted_files,
                errors = outcome.errors.len(),
                "retention sweep finished"
            );
        }
        Ok(outcome)
    }

    /// 分批并发删除存储对象：批大小10，批间停顿100ms限流
    pub async fn delete_oss_files_with_error_handling(
        &self,
        file_names: Vec<String>,
    ) -> (usize, Vec<DeleteFailure>) {
        let Some(oss) = &self.oss else {
            return (0, Vec::new());
        };

        let mut deleted = 0usize;
        let mut errors = Vec::new();
        let total_batches = file_names.len().div_ceil(DELETE_BATCH_SIZE);

        for (batch_index, batch) in file_names.chunks(DELETE_BATCH_SIZE).enumerate() {
            let results = join_all(batch.iter().map(|name| {
                let oss = Arc::clone(oss);
                async move {
                    let result = oss.delete_file(name).await;
                    (name.clone(), result)
                }
            }))
            .await;

            for (name, result) in results {
                match result {
                    Ok(()) => {
                        deleted += 1;
                        self.metrics.record_delete();
                    }
                    Err(e) => {
                        self.metrics.record_delete_failure();
                        errors.push(DeleteFailure {
                            file_name: name,
                            error: e.to_string(),
                        });
                    }
                }
            }

            if batch_index + 1 < total_batches {
                sleep(DELETE_BATCH_PAUSE).await;
            }
        }

        (deleted, errors)
    }

    /// 启动后台循环：队列超时巡检、10秒仪表刷新、周期性保留清理
    pub fn start(self: &Arc<Self>) {
        self.queue.start();

        {
            let (tx, mut rx) = oneshot::channel();
            let manager = Arc::clone(self);
            let handle = tokio::spawn(async move {
                let mut tick = interval(GAUGE_REFRESH_INTERVAL);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            let status = manager.queue.get_status();
                            manager
                                .metrics
                                .update_queue_gauges(status.pending_tasks, status.processing_tasks);
                        }
                        _ = &mut rx => break,
                    }
                }
            });
            self.shutdowns.lock().unwrap().push(tx);
            self.handles.lock().unwrap().push(handle);
        }

        {
            let (tx, mut rx) = oneshot::channel();
            let manager = Arc::clone(self);
            let cleanup_interval = self.options.cleanup_interval;
            let handle = tokio::spawn(async move {
                let mut tick = interval(cleanup_interval);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(e) = manager.cleanup_expired_tasks().await {
                                // 定时回调里的异常只记录，周期保持武装
                                error!("scheduled retention sweep failed: {e}");
                            }
                        }
                        _ = &mut rx => break,
                    }
                }
            });
            self.shutdowns.lock().unwrap().push(tx);
            self.handles.lock().unwrap().push(handle);
        }

        info!(
            retention_days = self.options.retention_days,
            cleanup_interval_secs = self.options.cleanup_interval.as_secs(),
            "task manager started"
        );
    }

    /// 停止仪表刷新与保留清理，拆掉队列
    pub async fn destroy(&self) {
        let senders: Vec<_> = self.shutdowns.lock().unwrap().drain(..).collect();
        for tx in senders {
            let _ = tx.send(());
        }
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("background loop join error: {e}");
            }
        }
        self.queue.shutdown().await;
        info!("task manager destroyed");
    }
}

/// 提交校验：收集所有违规项
pub fn validate_task_config(config: &ChartConfig) -> Result<(), Vec<String>> {
    let mut violations = Vec::new();

    if !config.option.is_object() {
        violations.push("option must be a structured object".to_string());
    }
    if let Some(width) = config.width {
        if !(1.0..=4000.0).contains(&width) {
            violations.push("width must be between 1 and 4000".to_string());
        }
    }
    if let Some(height) = config.height {
        if !(1.0..=4000.0).contains(&height) {
            violations.push("height must be between 1 and 4000".to_string());
        }
    }
    if let Some(chart_type) = config.chart_type.as_deref() {
        if !matches!(chart_type, "png" | "jpeg" | "jpg" | "svg" | "pdf") {
            violations.push("type must be one of png, jpeg, jpg, svg, pdf".to_string());
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// 把队列事件绑定到编排器：指标更新 + 渲染任务派发
struct EventBridge {
    manager: Weak<TaskManager>,
}

impl QueueEventListener for EventBridge {
    fn on_event(&self, event: &QueueEvent) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };

        match event {
            QueueEvent::Enqueued { task } => {
                debug!(task_id = %task.id, "task accepted into queue");
            }
            QueueEvent::Started { task } => {
                let task = task.clone();
                tokio::spawn(async move {
                    manager.process_task(task).await;
                });
            }
            QueueEvent::Completed { task } => {
                let duration = task.processing_duration_ms().unwrap_or(0) as f64;
                manager.metrics.record_task_completed(duration);
            }
            QueueEvent::Failed { task } => {
                manager.metrics.record_task_failed();
                warn!(task_id = %task.id, error = ?task.error, "task reached terminal failure");
            }
            QueueEvent::Retry { .. } => {
                manager.metrics.record_task_retried();
            }
            QueueEvent::Timeout { .. } => {
                manager.metrics.record_task_timeout();
            }
            QueueEvent::CleanedUp { tasks } => {
                debug!(count = tasks.len(), "tasks evicted by retention sweep");
            }
            QueueEvent::Paused | QueueEvent::Resumed => {
                info!(event = event.name(), "queue state changed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oss::{ObjectStore, UploadedObject};
    use crate::renderer::SvgChartRenderer;
    use async_trait::async_trait;
    use echarts_export_config::OssConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn svg_config() -> ChartConfig {
        ChartConfig {
            chart_type: Some("svg".to_string()),
            width: Some(600.0),
            height: Some(400.0),
            option: json!({"series": [{"type": "bar", "data": [1, 2, 3]}]}),
            ..Default::default()
        }
    }

    fn queue_config(max_concurrent: usize, retry_attempts: u32) -> QueueConfig {
        QueueConfig {
            max_concurrent,
            task_timeout: Duration::from_secs(300),
            retry_attempts,
        }
    }

    /// 等待任务进入终态
    async fn wait_for_finished(manager: &Arc<TaskManager>, id: Uuid) -> RenderTask {
        for _ in 0..500 {
            if let Some(task) = manager.get_task(id) {
                if task.is_finished() {
                    return task;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached a terminal state");
    }

    /// 始终失败的渲染器
    struct FailingRenderer;

    #[async_trait]
    impl ChartRenderer for FailingRenderer {
        async fn render(&self, _config: &ChartConfig, _task_id: Uuid) -> ExportResult<crate::renderer::RenderedChart> {
            Err(ExportError::render("canvas exploded"))
        }
    }

    /// 记录调用并可配置删除失败的存根存储
    struct CountingStore {
        uploads: AtomicU32,
        deletes: AtomicU32,
        fail_deletes: bool,
    }

    impl CountingStore {
        fn new(fail_deletes: bool) -> Arc<Self> {
            Arc::new(Self {
                uploads: AtomicU32::new(0),
                deletes: AtomicU32::new(0),
                fail_deletes,
            })
        }
    }

    #[async_trait]
    impl ObjectStore for CountingStore {
        async fn upload(
            &self,
            _buffer: &[u8],
            path: &str,
            _content_type: &str,
        ) -> ExportResult<UploadedObject> {
            self.uploads.fetch_add(1, Ordering::Relaxed);
            Ok(UploadedObject {
                url: format!("https://internal/{path}"),
                stored_path: path.to_string(),
            })
        }

        async fn delete(&self, _path: &str) -> ExportResult<()> {
            self.deletes.fetch_add(1, Ordering::Relaxed);
            if self.fail_deletes {
                Err(ExportError::object_store("access denied"))
            } else {
                Ok(())
            }
        }

        async fn test_connection(&self) -> ExportResult<bool> {
            Ok(true)
        }
    }

    fn oss_config() -> OssConfig {
        OssConfig {
            access_key_id: "id".to_string(),
            access_key_secret: "secret".to_string(),
            bucket: "charts".to_string(),
            region: "oss-cn-hangzhou".to_string(),
            custom_domain: None,
            path_prefix: Some("exports/".to_string()),
            max_retries: 1,
            retry_delay: Duration::from_millis(1),
        }
    }

    fn manager_without_oss(retry_attempts: u32) -> Arc<TaskManager> {
        TaskManager::new(
            queue_config(2, retry_attempts),
            Arc::new(SvgChartRenderer),
            None,
            Arc::new(MetricsCollector::new()),
            ManagerOptions {
                retention_days: 0,
                cleanup_interval: Duration::from_secs(3600),
            },
        )
    }

    fn manager_with_oss(store: Arc<CountingStore>) -> Arc<TaskManager> {
        let adapter = Arc::new(OssAdapter::new(store, oss_config()));
        TaskManager::new(
            queue_config(2, 0),
            Arc::new(SvgChartRenderer),
            Some(adapter),
            Arc::new(MetricsCollector::new()),
            ManagerOptions {
                retention_days: 0,
                cleanup_interval: Duration::from_secs(3600),
            },
        )
    }

    #[test]
    fn test_validate_task_config_collects_all_violations() {
        let config = ChartConfig {
            chart_type: Some("invalid".to_string()),
            width: Some(-1.0),
            option: json!("not an object"),
            ..Default::default()
        };
        let violations = validate_task_config(&config).unwrap_err();
        assert_eq!(violations.len(), 3);
        assert!(violations.iter().any(|v| v.contains("type")));
        assert!(violations.iter().any(|v| v.contains("width")));
        assert!(violations.iter().any(|v| v.contains("option")));
    }

    #[test]
    fn test_validate_task_config_accepts_minimal() {
        let config = ChartConfig {
            option: json!({"series": []}),
            ..Default::default()
        };
        assert!(validate_task_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_create_task_rejects_invalid_config() {
        let manager = manager_without_oss(0);
        let err = manager
            .create_task(ChartConfig {
                chart_type: Some("bmp".to_string()),
                option: json!({"series": []}),
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.to_string().starts_with("invalid task config"));
        // 校验失败不触达队列
        assert_eq!(manager.queue_status().pending_tasks, 0);
        assert_eq!(manager.metrics().snapshot().tasks.created, 0);
    }

    #[tokio::test]
    async fn test_happy_path_falls_back_to_data_url() {
        let manager = manager_without_oss(0);
        let task = manager.create_task(svg_config()).unwrap();
        assert_eq!(task.state, TaskState::Pending);

        let finished = wait_for_finished(&manager, task.id).await;
        assert_eq!(finished.state, TaskState::Completed);
        assert!(finished
            .image_url
            .as_deref()
            .unwrap()
            .starts_with("data:image/svg+xml;base64,"));
        assert!(finished.file_name.is_none());

        let snapshot = manager.metrics().snapshot();
        assert_eq!(snapshot.tasks.created, 1);
        assert_eq!(snapshot.tasks.completed, 1);
        assert_eq!(snapshot.tasks.failed, 0);
    }

    #[tokio::test]
    async fn test_upload_path_produces_public_url() {
        let store = CountingStore::new(false);
        let manager = manager_with_oss(store.clone());

        let task = manager.create_task(svg_config()).unwrap();
        let finished = wait_for_finished(&manager, task.id).await;

        assert_eq!(finished.state, TaskState::Completed);
        let file_name = finished.file_name.as_deref().unwrap();
        assert!(file_name.starts_with("exports/"));
        // 公开URL与存储路径满足适配层的URL公式
        let expected = manager.oss().unwrap().public_url(file_name);
        assert_eq!(finished.image_url.as_deref(), Some(expected.as_str()));
        assert_eq!(store.uploads.load(Ordering::Relaxed), 1);
        assert_eq!(manager.metrics().snapshot().oss.uploads, 1);
    }

    #[tokio::test]
    async fn test_render_failure_consumes_retry_budget() {
        let manager = TaskManager::new(
            queue_config(1, 1),
            Arc::new(FailingRenderer),
            None,
            Arc::new(MetricsCollector::new()),
            ManagerOptions::default(),
        );

        let task = manager.create_task(svg_config()).unwrap();
        let finished = wait_for_finished(&manager, task.id).await;

        assert_eq!(finished.state, TaskState::Failed);
        assert_eq!(finished.retry_count, 1);
        assert!(finished.error.as_deref().unwrap().contains("canvas exploded"));

        let snapshot = manager.metrics().snapshot();
        assert_eq!(snapshot.tasks.failed, 1);
        assert_eq!(snapshot.tasks.retried, 1);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_backing_objects() {
        let store = CountingStore::new(false);
        let manager = manager_with_oss(store.clone());

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(manager.create_task(svg_config()).unwrap().id);
        }
        for id in &ids {
            wait_for_finished(&manager, *id).await;
        }

        // retention_days = 0：所有已完结记录都超龄
        let outcome = manager.cleanup_expired_tasks().await.unwrap();
        assert_eq!(outcome.cleaned_tasks, 3);
        assert_eq!(outcome.deleted_files, 3);
        assert!(outcome.errors.is_empty());
        assert_eq!(store.deletes.load(Ordering::Relaxed), 3);

        for id in &ids {
            assert!(manager.get_task(*id).is_none());
        }
        assert_eq!(manager.metrics().snapshot().oss.deletes, 3);
    }

    #[tokio::test]
    async fn test_cleanup_collects_delete_failures() {
        let store = CountingStore::new(true);
        let manager = manager_with_oss(store);

        let task = manager.create_task(svg_config()).unwrap();
        wait_for_finished(&manager, task.id).await;

        let outcome = manager.cleanup_expired_tasks().await.unwrap();
        assert_eq!(outcome.cleaned_tasks, 1);
        assert_eq!(outcome.deleted_files, 0);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].error.contains("access denied"));
        // 删除失败不阻止内存记录被淘汰
        assert!(manager.get_task(task.id).is_none());
    }

    #[tokio::test]
    async fn test_delete_batching_covers_all_files() {
        let store = CountingStore::new(false);
        let manager = manager_with_oss(store.clone());

        let file_names: Vec<String> = (0..23).map(|i| format!("exports/{i}.svg")).collect();
        let (deleted, errors) = manager.delete_oss_files_with_error_handling(file_names).await;

        assert_eq!(deleted, 23);
        assert!(errors.is_empty());
        assert_eq!(store.deletes.load(Ordering::Relaxed), 23);
    }

    #[tokio::test]
    async fn test_concurrency_bound_held_during_burst() {
        let manager = manager_without_oss(0);
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(manager.create_task(svg_config()).unwrap().id);
        }

        // 任意时刻处理中数量不超过并发上限
        for _ in 0..50 {
            let status = manager.queue_status();
            assert!(status.processing_tasks <= status.max_concurrent);
            sleep(Duration::from_millis(2)).await;
        }

        for id in ids {
            let finished = wait_for_finished(&manager, id).await;
            assert_eq!(finished.state, TaskState::Completed);
        }
    }

    #[tokio::test]
    async fn test_manager_lifecycle() {
        let manager = manager_without_oss(0);
        manager.start();
        let task = manager.create_task(svg_config()).unwrap();
        wait_for_finished(&manager, task.id).await;
        manager.destroy().await;
    }
}
