use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use echarts_export_config::QueueConfig;
use echarts_export_domain::{QueueEvent, QueueEventListener, QueueStatus, RenderTask};
use echarts_export_errors::{ExportError, ExportResult};

use crate::metrics::SampleWindow;

/// 超时巡检周期
const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// 处理耗时滚动窗口的容量
const DURATION_WINDOW_CAPACITY: usize = 1000;

/// 任务队列
///
/// 三个状态容器（等待队列、处理中集合、已完结归档）由同一把锁串行化，
/// 一个任务id在任意时刻只出现在其中一个容器里。事件在状态变更完成后、
/// 锁释放之后同步派发。
pub struct TaskQueue {
    config: QueueConfig,
    inner: Mutex<QueueState>,
    listeners: RwLock<Vec<Arc<dyn QueueEventListener>>>,
    paused: AtomicBool,
    total_processed: AtomicU64,
    total_failed: AtomicU64,
    sweep_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    sweep_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct QueueState {
    pending: VecDeque<RenderTask>,
    processing: HashMap<Uuid, RenderTask>,
    completed: HashMap<Uuid, RenderTask>,
    durations: SampleWindow,
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(QueueState {
                pending: VecDeque::new(),
                processing: HashMap::new(),
                completed: HashMap::new(),
                durations: SampleWindow::new(DURATION_WINDOW_CAPACITY),
            }),
            listeners: RwLock::new(Vec::new()),
            paused: AtomicBool::new(false),
            total_processed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            sweep_shutdown: Mutex::new(None),
            sweep_handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn subscribe(&self, listener: Arc<dyn QueueEventListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    fn emit(&self, event: &QueueEvent) {
        let listeners = self.listeners.read().unwrap();
        for listener in listeners.iter() {
            listener.on_event(event);
        }
    }

    /// 入队
    ///
    /// 重复id直接拒绝，不产生任何副作用。
    pub fn enqueue(&self, task: RenderTask) -> ExportResult<()> {
        let snapshot = {
            let mut state = self.inner.lock().unwrap();
            if state.pending.iter().any(|t| t.id == task.id)
                || state.processing.contains_key(&task.id)
                || state.completed.contains_key(&task.id)
            {
                return Err(ExportError::duplicate_task(task.id.to_string()));
            }
            state.pending.push_back(task.clone());
            task
        };

        debug!(task_id = %snapshot.id, "task enqueued");
        self.emit(&QueueEvent::Enqueued { task: snapshot });
        self.process_next();
        Ok(())
    }

    /// 尝试放行一个等待中的任务
    ///
    /// 单次调用至多放行一个；每次入队、完成、失败和重试都会重新触发。
    /// 返回是否实际放行。
    pub fn process_next(&self) -> bool {
        if self.paused.load(Ordering::Relaxed) {
            return false;
        }

        let started = {
            let mut state = self.inner.lock().unwrap();
            if state.processing.len() >= self.config.max_concurrent || state.pending.is_empty() {
                None
            } else {
                let mut task = state.pending.pop_front().expect("pending is non-empty");
                task.mark_started();
                state.processing.insert(task.id, task.clone());
                Some(task)
            }
        };

        match started {
            Some(task) => {
                debug!(task_id = %task.id, retry_count = task.retry_count, "task started");
                self.emit(&QueueEvent::Started { task });
                true
            }
            None => false,
        }
    }

    /// 任务成功完成
    pub fn complete_task(
        &self,
        id: Uuid,
        image_url: String,
        file_name: Option<String>,
    ) -> ExportResult<()> {
        let snapshot = {
            let mut state = self.inner.lock().unwrap();
            let mut task = state
                .processing
                .remove(&id)
                .ok_or_else(|| ExportError::task_not_found(id.to_string()))?;
            task.mark_completed(image_url, file_name);
            if let Some(duration) = task.processing_duration_ms() {
                state.durations.record(duration as f64);
            }
            state.completed.insert(id, task.clone());
            task
        };

        self.total_processed.fetch_add(1, Ordering::Relaxed);
        info!(
            task_id = %snapshot.id,
            duration_ms = snapshot.processing_duration_ms(),
            "task completed"
        );
        self.emit(&QueueEvent::Completed { task: snapshot });
        self.process_next();
        Ok(())
    }

    /// 任务失败
    ///
    /// 重试预算未耗尽时插回等待队列头部（重试任务插队），否则转为终态失败。
    pub fn fail_task(&self, id: Uuid, reason: &str) -> ExportResult<()> {
        enum Outcome {
            Retried(RenderTask),
            Failed(RenderTask),
        }

        let outcome = {
            let mut state = self.inner.lock().unwrap();
            let mut task = state
                .processing
                .remove(&id)
                .ok_or_else(|| ExportError::task_not_found(id.to_string()))?;
            if task.retry_count < self.config.retry_attempts {
                task.mark_retrying();
                state.pending.push_front(task.clone());
                Outcome::Retried(task)
            } else {
                task.mark_failed(reason);
                state.completed.insert(id, task.clone());
                Outcome::Failed(task)
            }
        };

        match outcome {
            Outcome::Retried(task) => {
                warn!(
                    task_id = %task.id,
                    retry_count = task.retry_count,
                    reason,
                    "task failed, requeued for retry"
                );
                self.emit(&QueueEvent::Retry { task });
            }
            Outcome::Failed(task) => {
                self.total_processed.fetch_add(1, Ordering::Relaxed);
                self.total_failed.fetch_add(1, Ordering::Relaxed);
                warn!(task_id = %task.id, reason, "task terminally failed");
                self.emit(&QueueEvent::Failed { task });
            }
        }

        self.process_next();
        Ok(())
    }

    /// 扫描处理中集合，把超过单次执行时限的任务按失败路径处理
    pub fn check_timeouts(&self) {
        let timeout_ms = self.config.task_timeout.as_millis() as i64;
        let now = Utc::now();

        let timed_out: Vec<RenderTask> = {
            let state = self.inner.lock().unwrap();
            state
                .processing
                .values()
                .filter(|task| {
                    task.started_at
                        .map(|started| (now - started).num_milliseconds() > timeout_ms)
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };

        for task in timed_out {
            warn!(task_id = %task.id, "task exceeded deadline");
            self.emit(&QueueEvent::Timeout { task: task.clone() });
            if let Err(e) = self.fail_task(task.id, "task timeout") {
                // 任务可能在巡检与失败处理之间已经离开处理中集合
                debug!(task_id = %task.id, error = %e, "timeout fail skipped");
            }
        }
    }

    /// 按保留期清理已完结归档，返回被移除的记录
    pub fn cleanup_expired_tasks(&self, retention_days: i64) -> Vec<RenderTask> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);

        let removed: Vec<RenderTask> = {
            let mut state = self.inner.lock().unwrap();
            let expired: Vec<Uuid> = state
                .completed
                .iter()
                .filter(|(_, task)| task.created_at < cutoff)
                .map(|(id, _)| *id)
                .collect();
            expired
                .into_iter()
                .filter_map(|id| state.completed.remove(&id))
                .collect()
        };

        if !removed.is_empty() {
            info!(count = removed.len(), retention_days, "expired tasks removed");
            self.emit(&QueueEvent::CleanedUp {
                tasks: removed.clone(),
            });
        }
        removed
    }

    /// 按 处理中 → 已完结 → 等待中 的顺序查找任务快照
    pub fn get_task(&self, id: Uuid) -> Option<RenderTask> {
        let state = self.inner.lock().unwrap();
        state
            .processing
            .get(&id)
            .or_else(|| state.completed.get(&id))
            .cloned()
            .or_else(|| state.pending.iter().find(|t| t.id == id).cloned())
    }

    pub fn get_status(&self) -> QueueStatus {
        let state = self.inner.lock().unwrap();
        QueueStatus {
            pending_tasks: state.pending.len(),
            processing_tasks: state.processing.len(),
            completed_tasks: state.completed.len(),
            total_processed: self.total_processed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            average_processing_time: state.durations.average(),
            max_concurrent: self.config.max_concurrent,
        }
    }

    /// 暂停放行与超时巡检；处理中的任务继续执行到完成
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::Relaxed) {
            info!("queue paused");
            self.emit(&QueueEvent::Paused);
        }
    }

    /// 恢复，并连续放行直到饱和或队列为空
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::Relaxed) {
            info!("queue resumed");
            self.emit(&QueueEvent::Resumed);
            while self.process_next() {}
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// 启动后台超时巡检
    pub fn start(self: &Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.sweep_shutdown.lock().unwrap() = Some(shutdown_tx);

        let queue = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut sweep_interval = interval(TIMEOUT_SWEEP_INTERVAL);
            sweep_interval.tick().await; // 第一次tick立即返回，跳过
            loop {
                tokio::select! {
                    _ = sweep_interval.tick() => {
                        if !queue.is_paused() {
                            queue.check_timeouts();
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!("timeout sweep shutting down");
                        break;
                    }
                }
            }
        });
        *self.sweep_handle.lock().unwrap() = Some(handle);
        info!(
            max_concurrent = self.config.max_concurrent,
            task_timeout_secs = self.config.task_timeout.as_secs(),
            retry_attempts = self.config.retry_attempts,
            "task queue started"
        );
    }

    /// 停止超时巡检
    pub async fn shutdown(&self) {
        if let Some(tx) = self.sweep_shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        let handle = self.sweep_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("error stopping timeout sweep: {e}");
            }
        }
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.get_status();
        f.debug_struct("TaskQueue")
            .field("pending", &status.pending_tasks)
            .field("processing", &status.processing_tasks)
            .field("completed", &status.completed_tasks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echarts_export_domain::{ChartConfig, TaskState};
    use std::time::Duration;

    /// 记录事件序列的测试监听器
    struct RecordingListener {
        events: Mutex<Vec<(String, Option<Uuid>)>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn names(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|(name, _)| name.clone())
                .collect()
        }

        fn ids_for(&self, name: &str) -> Vec<Uuid> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(n, _)| n == name)
                .filter_map(|(_, id)| *id)
                .collect()
        }
    }

    impl QueueEventListener for RecordingListener {
        fn on_event(&self, event: &QueueEvent) {
            let id = match event {
                QueueEvent::Enqueued { task }
                | QueueEvent::Started { task }
                | QueueEvent::Completed { task }
                | QueueEvent::Failed { task }
                | QueueEvent::Retry { task }
                | QueueEvent::Timeout { task } => Some(task.id),
                _ => None,
            };
            self.events
                .lock()
                .unwrap()
                .push((event.name().to_string(), id));
        }
    }

    fn test_config(max_concurrent: usize, retry_attempts: u32) -> QueueConfig {
        QueueConfig {
            max_concurrent,
            task_timeout: Duration::from_secs(300),
            retry_attempts,
        }
    }

    fn new_task() -> RenderTask {
        RenderTask::new(ChartConfig {
            option: serde_json::json!({"series": []}),
            ..Default::default()
        })
    }

    #[test]
    fn test_enqueue_admits_up_to_capacity() {
        let queue = TaskQueue::new(test_config(2, 0));
        let listener = RecordingListener::new();
        queue.subscribe(listener.clone());

        for _ in 0..5 {
            queue.enqueue(new_task()).unwrap();
        }

        let status = queue.get_status();
        assert_eq!(status.processing_tasks, 2);
        assert_eq!(status.pending_tasks, 3);
        assert_eq!(listener.ids_for("taskStarted").len(), 2);
    }

    #[test]
    fn test_duplicate_id_rejected_without_side_effects() {
        let queue = TaskQueue::new(test_config(1, 0));
        let task = new_task();
        queue.enqueue(task.clone()).unwrap();

        let err = queue.enqueue(task).unwrap_err();
        assert!(matches!(err, ExportError::DuplicateTask { .. }));

        let status = queue.get_status();
        assert_eq!(status.pending_tasks + status.processing_tasks, 1);
    }

    #[test]
    fn test_fifo_order_without_retries() {
        let queue = TaskQueue::new(test_config(1, 0));
        let listener = RecordingListener::new();
        queue.subscribe(listener.clone());

        let tasks: Vec<RenderTask> = (0..4).map(|_| new_task()).collect();
        let submitted: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
        for task in tasks {
            queue.enqueue(task).unwrap();
        }

        // 容量为1时逐个完成，完成顺序必须等于提交顺序
        for _ in 0..4 {
            let started = listener.ids_for("taskStarted");
            let current = *started.last().unwrap();
            queue
                .complete_task(current, "data:image/svg+xml;base64,".to_string(), None)
                .unwrap();
        }

        assert_eq!(listener.ids_for("taskCompleted"), submitted);
        let status = queue.get_status();
        assert_eq!(status.total_processed, 4);
        assert_eq!(status.total_failed, 0);
        assert_eq!(status.completed_tasks, 4);
    }

    #[test]
    fn test_retry_requeues_at_head() {
        let queue = TaskQueue::new(test_config(1, 1));
        let listener = RecordingListener::new();
        queue.subscribe(listener.clone());

        let first = new_task();
        let second = new_task();
        let first_id = first.id;
        let second_id = second.id;
        queue.enqueue(first).unwrap();
        queue.enqueue(second).unwrap();

        // first 正在处理，second 在等待；失败后 first 应插到 second 前面
        queue.fail_task(first_id, "render crashed").unwrap();

        let started = listener.ids_for("taskStarted");
        assert_eq!(started, vec![first_id, first_id]);
        assert_eq!(listener.ids_for("taskRetry"), vec![first_id]);

        let retried = queue.get_task(first_id).unwrap();
        assert_eq!(retried.retry_count, 1);
        assert!(retried.error.is_none());

        // 预算耗尽后转为终态失败，second 才被放行
        queue.fail_task(first_id, "render crashed").unwrap();
        assert_eq!(listener.ids_for("taskFailed"), vec![first_id]);
        assert_eq!(*listener.ids_for("taskStarted").last().unwrap(), second_id);

        let failed = queue.get_task(first_id).unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(failed.error.as_deref(), Some("render crashed"));
        assert_eq!(failed.retry_count, 1);
    }

    #[test]
    fn test_zero_retry_budget_fails_immediately() {
        let queue = TaskQueue::new(test_config(1, 0));
        let listener = RecordingListener::new();
        queue.subscribe(listener.clone());

        let task = new_task();
        let id = task.id;
        queue.enqueue(task).unwrap();
        queue.fail_task(id, "boom").unwrap();

        assert!(listener.ids_for("taskRetry").is_empty());
        assert_eq!(listener.ids_for("taskFailed"), vec![id]);
        let status = queue.get_status();
        assert_eq!(status.total_processed, 1);
        assert_eq!(status.total_failed, 1);
    }

    #[test]
    fn test_timeout_sweep_follows_failure_path() {
        let config = QueueConfig {
            max_concurrent: 1,
            task_timeout: Duration::from_millis(0),
            retry_attempts: 1,
        };
        let queue = TaskQueue::new(config);
        let listener = RecordingListener::new();
        queue.subscribe(listener.clone());

        let task = new_task();
        let id = task.id;
        queue.enqueue(task).unwrap();

        // 时限为0，处理中的任务立即视为超时
        std::thread::sleep(Duration::from_millis(5));
        queue.check_timeouts();
        assert_eq!(listener.ids_for("taskTimeout"), vec![id]);
        assert_eq!(listener.ids_for("taskRetry"), vec![id]);

        // 重试后再次超时，预算耗尽
        std::thread::sleep(Duration::from_millis(5));
        queue.check_timeouts();
        let failed = queue.get_task(id).unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(failed.error.as_deref(), Some("task timeout"));
    }

    #[test]
    fn test_cleanup_expired_tasks() {
        let queue = TaskQueue::new(test_config(3, 0));
        let listener = RecordingListener::new();
        queue.subscribe(listener.clone());

        let ids: Vec<Uuid> = (0..3)
            .map(|_| {
                let task = new_task();
                let id = task.id;
                queue.enqueue(task).unwrap();
                id
            })
            .collect();
        for id in &ids {
            queue
                .complete_task(*id, "https://cdn.example.com/x.svg".to_string(), Some("x.svg".to_string()))
                .unwrap();
        }

        // 保留期为0天：所有已完结记录都超龄
        let removed = queue.cleanup_expired_tasks(0);
        assert_eq!(removed.len(), 3);
        assert_eq!(queue.get_status().completed_tasks, 0);
        for id in &ids {
            assert!(queue.get_task(*id).is_none());
        }
        assert_eq!(listener.names().iter().filter(|n| *n == "tasksCleanedUp").count(), 1);

        // totalProcessed 单调，不随清理回退
        assert_eq!(queue.get_status().total_processed, 3);
    }

    #[test]
    fn test_cleanup_keeps_recent_tasks() {
        let queue = TaskQueue::new(test_config(1, 0));
        let task = new_task();
        let id = task.id;
        queue.enqueue(task).unwrap();
        queue
            .complete_task(id, "data:image/svg+xml;base64,".to_string(), None)
            .unwrap();

        let removed = queue.cleanup_expired_tasks(7);
        assert!(removed.is_empty());
        assert!(queue.get_task(id).is_some());
    }

    #[test]
    fn test_pause_and_resume() {
        let queue = TaskQueue::new(test_config(2, 0));
        let listener = RecordingListener::new();
        queue.subscribe(listener.clone());

        queue.pause();
        for _ in 0..3 {
            queue.enqueue(new_task()).unwrap();
        }
        assert_eq!(queue.get_status().processing_tasks, 0);
        assert!(listener.ids_for("taskStarted").is_empty());

        queue.resume();
        assert_eq!(queue.get_status().processing_tasks, 2);
        assert_eq!(listener.ids_for("taskStarted").len(), 2);

        let names = listener.names();
        assert!(names.contains(&"queuePaused".to_string()));
        assert!(names.contains(&"queueResumed".to_string()));
    }

    #[test]
    fn test_get_task_lookup_order() {
        let queue = TaskQueue::new(test_config(1, 0));
        let processing = new_task();
        let pending = new_task();
        let processing_id = processing.id;
        let pending_id = pending.id;
        queue.enqueue(processing).unwrap();
        queue.enqueue(pending).unwrap();

        assert_eq!(
            queue.get_task(processing_id).unwrap().state,
            TaskState::Processing
        );
        assert_eq!(queue.get_task(pending_id).unwrap().state, TaskState::Pending);
        assert!(queue.get_task(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_complete_unknown_task_is_error() {
        let queue = TaskQueue::new(test_config(1, 0));
        let err = queue
            .complete_task(Uuid::new_v4(), "url".to_string(), None)
            .unwrap_err();
        assert!(matches!(err, ExportError::TaskNotFound { .. }));
    }

    #[test]
    fn test_average_processing_time_reported() {
        let queue = TaskQueue::new(test_config(1, 0));
        let task = new_task();
        let id = task.id;
        queue.enqueue(task).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        queue
            .complete_task(id, "data:image/svg+xml;base64,".to_string(), None)
            .unwrap();

        let status = queue.get_status();
        assert!(status.average_processing_time >= 10.0);
    }

    #[tokio::test]
    async fn test_sweep_lifecycle() {
        let queue = Arc::new(TaskQueue::new(test_config(1, 0)));
        queue.start();
        queue.shutdown().await;
    }
}
