use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{error, info, warn};

use echarts_export_errors::{ExportError, ExportResult};

use crate::manager::{CleanupOutcome, TaskManager};

/// 清理周期失败后的重试基数：第 n 次失败等待 5s × n
const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSchedulerOptions {
    /// 每天触发清理的本地整点，0-23
    pub cleanup_hour: u8,
    /// 单个周期内的最大尝试次数
    pub max_retries: u32,
    pub retention_days: i64,
}

impl Default for CleanupSchedulerOptions {
    fn default() -> Self {
        Self {
            cleanup_hour: 2,
            max_retries: 3,
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupStats {
    pub total_runs: u64,
    pub total_tasks_cleaned: u64,
    pub total_files_cleaned: u64,
    pub total_errors: u64,
    /// 最近一次成功周期的耗时（毫秒）
    pub last_run_duration: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSchedulerStatus {
    pub is_running: bool,
    pub last_cleanup_time: Option<DateTime<Utc>>,
    pub next_cleanup_time: Option<DateTime<Utc>>,
    pub stats: CleanupStats,
    pub options: CleanupSchedulerOptions,
}

/// 定点清理调度器
///
/// 每天在配置的本地整点触发一次编排器的保留期清理；单次触发失败
/// 按线性退避重试。手动触发共用同一条重试路径，但不计入周期计数。
pub struct CleanupScheduler {
    manager: Arc<TaskManager>,
    options: CleanupSchedulerOptions,
    running: AtomicBool,
    stats: Mutex<CleanupStats>,
    last_cleanup: Mutex<Option<DateTime<Utc>>>,
    next_cleanup: Mutex<Option<DateTime<Utc>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// 下一个严格在 after 之后的 cleanup_hour:00:00（本地时间）
pub fn next_fire_time(cleanup_hour: u8, after: DateTime<Local>) -> Option<DateTime<Utc>> {
    let expr = format!("0 0 {cleanup_hour} * * *");
    let schedule = Schedule::from_str(&expr).ok()?;
    schedule
        .after(&after)
        .next()
        .map(|t| t.with_timezone(&Utc))
}

impl CleanupScheduler {
    pub fn new(manager: Arc<TaskManager>, options: CleanupSchedulerOptions) -> Arc<Self> {
        Arc::new(Self {
            manager,
            options,
            running: AtomicBool::new(false),
            stats: Mutex::new(CleanupStats::default()),
            last_cleanup: Mutex::new(None),
            next_cleanup: Mutex::new(None),
            shutdown: Mutex::new(None),
            handle: Mutex::new(None),
        })
    }

    /// 启动调度循环
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::Relaxed) {
            warn!("cleanup scheduler already running");
            return;
        }

        let (tx, mut rx) = oneshot::channel();
        *self.shutdown.lock().unwrap() = Some(tx);

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = next_fire_time(scheduler.options.cleanup_hour, Local::now())
                else {
                    error!(
                        cleanup_hour = scheduler.options.cleanup_hour,
                        "failed to compute next cleanup time"
                    );
                    break;
                };
                *scheduler.next_cleanup.lock().unwrap() = Some(next);

                let delay = (next - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_secs(0));
                info!(next = %next, "next cleanup cycle armed");

                tokio::select! {
                    _ = sleep(delay) => {
                        if let Err(e) = scheduler.run_cycle(false).await {
                            error!("cleanup cycle exhausted retries: {e}");
                        }
                    }
                    _ = &mut rx => break,
                }
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
        info!(
            cleanup_hour = self.options.cleanup_hour,
            retention_days = self.options.retention_days,
            "cleanup scheduler started"
        );
    }

    /// 取消当前定时并停止循环
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("error stopping cleanup scheduler: {e}");
            }
        }
        *self.next_cleanup.lock().unwrap() = None;
        info!("cleanup scheduler stopped");
    }

    /// 重启：取消并按当前时间重新计算下一次触发
    pub async fn restart(self: &Arc<Self>) {
        self.stop().await;
        self.start();
    }

    /// 手动触发：走同一条重试路径，累计任务/文件/错误总数但不计入周期数
    pub async fn trigger_manual(&self) -> ExportResult<CleanupOutcome> {
        self.run_cycle(true).await
    }

    async fn run_cycle(&self, manual: bool) -> ExportResult<CleanupOutcome> {
        let started = std::time::Instant::now();
        let max_attempts = self.options.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.manager.cleanup_expired_tasks().await {
                Ok(outcome) => {
                    {
                        let mut stats = self.stats.lock().unwrap();
                        if !manual {
                            stats.total_runs += 1;
                        }
                        stats.total_tasks_cleaned += outcome.cleaned_tasks as u64;
                        stats.total_files_cleaned += outcome.deleted_files as u64;
                        stats.total_errors += outcome.errors.len() as u64;
                        stats.last_run_duration = started.elapsed().as_millis() as u64;
                    }
                    *self.last_cleanup.lock().unwrap() = Some(Utc::now());
                    info!(
                        manual,
                        attempt,
                        cleaned = outcome.cleaned_tasks,
                        deleted = outcome.deleted_files,
                        "cleanup cycle finished"
                    );
                    return Ok(outcome);
                }
                Err(e) => {
                    error!(attempt, max_attempts, "cleanup attempt failed: {e}");
                    last_error = Some(e);
                    if attempt < max_attempts {
                        sleep(RETRY_BACKOFF_BASE * attempt).await;
                    }
                }
            }
        }

        let last = last_error.expect("at least one attempt was made");
        Err(ExportError::Cleanup(format!(
            "all {max_attempts} attempts failed: {last}"
        )))
    }

    pub fn status(&self) -> CleanupSchedulerStatus {
        CleanupSchedulerStatus {
            is_running: self.running.load(Ordering::Relaxed),
            last_cleanup_time: *self.last_cleanup.lock().unwrap(),
            next_cleanup_time: *self.next_cleanup.lock().unwrap(),
            stats: self.stats.lock().unwrap().clone(),
            options: self.options.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerOptions;
    use crate::metrics::MetricsCollector;
    use crate::renderer::SvgChartRenderer;
    use chrono::Timelike;
    use echarts_export_config::QueueConfig;
    use echarts_export_domain::ChartConfig;

    fn test_manager() -> Arc<TaskManager> {
        TaskManager::new(
            QueueConfig::default(),
            Arc::new(SvgChartRenderer),
            None,
            Arc::new(MetricsCollector::new()),
            ManagerOptions {
                retention_days: 0,
                cleanup_interval: Duration::from_secs(3600),
            },
        )
    }

    #[test]
    fn test_next_fire_time_is_strictly_future() {
        let now = Local::now();
        let next = next_fire_time(2, now).unwrap();
        assert!(next > Utc::now() - chrono::Duration::seconds(1));

        let local_next = next.with_timezone(&Local);
        assert_eq!(local_next.hour(), 2);
        assert_eq!(local_next.minute(), 0);
        assert_eq!(local_next.second(), 0);

        // 与当前时间的间隔不超过一天
        assert!(next - now.with_timezone(&Utc) <= chrono::Duration::days(1));
    }

    #[test]
    fn test_next_fire_time_every_hour_valid() {
        for hour in 0..24u8 {
            assert!(next_fire_time(hour, Local::now()).is_some());
        }
    }

    #[tokio::test]
    async fn test_manual_trigger_does_not_count_as_run() {
        let manager = test_manager();
        let scheduler = CleanupScheduler::new(manager.clone(), CleanupSchedulerOptions::default());

        // 先完成一个任务再手动清理
        let task = manager
            .create_task(ChartConfig {
                chart_type: Some("svg".to_string()),
                option: serde_json::json!({"series": [{"type": "bar", "data": [1]}]}),
                ..Default::default()
            })
            .unwrap();
        for _ in 0..200 {
            if manager.get_task(task.id).map(|t| t.is_finished()).unwrap_or(false) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        let outcome = scheduler.trigger_manual().await.unwrap();
        assert_eq!(outcome.cleaned_tasks, 1);

        let status = scheduler.status();
        assert_eq!(status.stats.total_runs, 0);
        assert_eq!(status.stats.total_tasks_cleaned, 1);
        assert!(status.last_cleanup_time.is_some());
    }

    #[tokio::test]
    async fn test_stats_accumulate_across_triggers() {
        let manager = test_manager();
        let scheduler = CleanupScheduler::new(manager, CleanupSchedulerOptions::default());

        scheduler.trigger_manual().await.unwrap();
        scheduler.trigger_manual().await.unwrap();

        let status = scheduler.status();
        assert_eq!(status.stats.total_runs, 0);
        assert_eq!(status.stats.total_tasks_cleaned, 0);
        assert!(status.last_cleanup_time.is_some());
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let manager = test_manager();
        let scheduler = CleanupScheduler::new(manager, CleanupSchedulerOptions::default());

        assert!(!scheduler.status().is_running);
        scheduler.start();
        // 给循环一点时间计算下一次触发
        sleep(Duration::from_millis(50)).await;
        let status = scheduler.status();
        assert!(status.is_running);
        assert!(status.next_cleanup_time.is_some());

        scheduler.stop().await;
        let status = scheduler.status();
        assert!(!status.is_running);
        assert!(status.next_cleanup_time.is_none());
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = CleanupSchedulerStatus {
            is_running: true,
            last_cleanup_time: None,
            next_cleanup_time: None,
            stats: CleanupStats::default(),
            options: CleanupSchedulerOptions::default(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["isRunning"], true);
        assert!(json["stats"]["totalRuns"].is_number());
        assert_eq!(json["options"]["cleanupHour"], 2);
    }
}
