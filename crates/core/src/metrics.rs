use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prometheus 文本协议的内容类型
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// 有界样本窗口
///
/// 写满后每次插入丢弃最旧的样本。
#[derive(Debug)]
pub struct SampleWindow {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().copied().collect()
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

/// 最近邻法分位数：下标为 ⌈n·q⌉−1
pub fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (sorted.len() as f64 * quantile).ceil() as usize;
    let index = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[index]
}

/// 处理耗时统计摘要，每次插入样本后重算
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DurationSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl DurationSummary {
    fn from_window(window: &SampleWindow) -> Self {
        if window.is_empty() {
            return Self::default();
        }
        let mut sorted = window.values();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Self {
            count: sorted.len(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            avg: window.average(),
            p50: percentile(&sorted, 0.5),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
        }
    }
}

/// 指标收集器
///
/// 计数器只增不减；仪表盘可以双向移动。所有读取都返回快照，
/// 不同指标族之间允许轻微的观测不一致。
pub struct MetricsCollector {
    start_time: DateTime<Utc>,

    // 任务计数
    tasks_created: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_retried: AtomicU64,
    tasks_timeout: AtomicU64,

    // 队列仪表
    pending_tasks: AtomicU64,
    processing_tasks: AtomicU64,
    max_pending_tasks: AtomicU64,
    max_processing_tasks: AtomicU64,

    // 对象存储计数
    oss_uploads: AtomicU64,
    oss_upload_failures: AtomicU64,
    oss_deletes: AtomicU64,
    oss_delete_failures: AtomicU64,
    upload_sizes: Mutex<SampleWindow>,
    upload_durations: Mutex<SampleWindow>,

    // HTTP 计数
    http_requests: AtomicU64,
    http_responses_2xx: AtomicU64,
    http_responses_4xx: AtomicU64,
    http_responses_5xx: AtomicU64,
    response_durations: Mutex<SampleWindow>,

    // 任务处理耗时
    processing_times: Mutex<SampleWindow>,
    processing_summary: Mutex<DurationSummary>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            tasks_created: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_retried: AtomicU64::new(0),
            tasks_timeout: AtomicU64::new(0),
            pending_tasks: AtomicU64::new(0),
            processing_tasks: AtomicU64::new(0),
            max_pending_tasks: AtomicU64::new(0),
            max_processing_tasks: AtomicU64::new(0),
            oss_uploads: AtomicU64::new(0),
            oss_upload_failures: AtomicU64::new(0),
            oss_deletes: AtomicU64::new(0),
            oss_delete_failures: AtomicU64::new(0),
            upload_sizes: Mutex::new(SampleWindow::new(500)),
            upload_durations: Mutex::new(SampleWindow::new(500)),
            http_requests: AtomicU64::new(0),
            http_responses_2xx: AtomicU64::new(0),
            http_responses_4xx: AtomicU64::new(0),
            http_responses_5xx: AtomicU64::new(0),
            response_durations: Mutex::new(SampleWindow::new(1000)),
            processing_times: Mutex::new(SampleWindow::new(1000)),
            processing_summary: Mutex::new(DurationSummary::default()),
        }
    }

    pub fn record_task_created(&self) {
        self.tasks_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_completed(&self, duration_ms: f64) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        let mut window = self.processing_times.lock().unwrap();
        window.record(duration_ms);
        let summary = DurationSummary::from_window(&window);
        drop(window);
        *self.processing_summary.lock().unwrap() = summary;
    }

    pub fn record_task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_retried(&self) {
        self.tasks_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_timeout(&self) {
        self.tasks_timeout.fetch_add(1, Ordering::Relaxed);
    }

    /// 刷新队列仪表，同步维护历史峰值
    pub fn update_queue_gauges(&self, pending: usize, processing: usize) {
        self.pending_tasks.store(pending as u64, Ordering::Relaxed);
        self.processing_tasks
            .store(processing as u64, Ordering::Relaxed);
        self.max_pending_tasks
            .fetch_max(pending as u64, Ordering::Relaxed);
        self.max_processing_tasks
            .fetch_max(processing as u64, Ordering::Relaxed);
    }

    pub fn record_upload(&self, size_bytes: usize, duration_ms: f64) {
        self.oss_uploads.fetch_add(1, Ordering::Relaxed);
        self.upload_sizes.lock().unwrap().record(size_bytes as f64);
        self.upload_durations.lock().unwrap().record(duration_ms);
    }

    pub fn record_upload_failure(&self) {
        self.oss_upload_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.oss_deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete_failure(&self) {
        self.oss_delete_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_http_request(&self, status: u16, duration_ms: f64) {
        self.http_requests.fetch_add(1, Ordering::Relaxed);
        match status {
            200..=299 => self.http_responses_2xx.fetch_add(1, Ordering::Relaxed),
            400..=499 => self.http_responses_4xx.fetch_add(1, Ordering::Relaxed),
            500..=599 => self.http_responses_5xx.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        self.response_durations.lock().unwrap().record(duration_ms);
    }

    pub fn processing_summary(&self) -> DurationSummary {
        *self.processing_summary.lock().unwrap()
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.start_time).num_seconds()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks: TaskMetricsSnapshot {
                created: self.tasks_created.load(Ordering::Relaxed),
                completed: self.tasks_completed.load(Ordering::Relaxed),
                failed: self.tasks_failed.load(Ordering::Relaxed),
                retried: self.tasks_retried.load(Ordering::Relaxed),
                timeout: self.tasks_timeout.load(Ordering::Relaxed),
            },
            queue: QueueMetricsSnapshot {
                pending_tasks: self.pending_tasks.load(Ordering::Relaxed),
                processing_tasks: self.processing_tasks.load(Ordering::Relaxed),
                max_pending_tasks: self.max_pending_tasks.load(Ordering::Relaxed),
                max_processing_tasks: self.max_processing_tasks.load(Ordering::Relaxed),
            },
            oss: OssMetricsSnapshot {
                uploads: self.oss_uploads.load(Ordering::Relaxed),
                upload_failures: self.oss_upload_failures.load(Ordering::Relaxed),
                deletes: self.oss_deletes.load(Ordering::Relaxed),
                delete_failures: self.oss_delete_failures.load(Ordering::Relaxed),
                average_upload_size: self.upload_sizes.lock().unwrap().average(),
                average_upload_duration: self.upload_durations.lock().unwrap().average(),
            },
            http: HttpMetricsSnapshot {
                total_requests: self.http_requests.load(Ordering::Relaxed),
                responses_2xx: self.http_responses_2xx.load(Ordering::Relaxed),
                responses_4xx: self.http_responses_4xx.load(Ordering::Relaxed),
                responses_5xx: self.http_responses_5xx.load(Ordering::Relaxed),
                average_response_time: self.response_durations.lock().unwrap().average(),
            },
            system: SystemMetricsSnapshot {
                start_time: self.start_time,
                uptime_seconds: self.uptime_seconds(),
                // 进程堆峰值与CPU时间没有可移植的读取方式，留空
                memory_usage_mb: None,
                cpu_usage_percent: None,
            },
            processing_time: self.processing_summary(),
            timestamp: Utc::now(),
        }
    }

    /// 渲染 Prometheus 文本协议
    pub fn render_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::with_capacity(4096);

        counter_family(
            &mut out,
            "echarts_tasks_created_total",
            "Total number of render tasks submitted",
            snapshot.tasks.created,
        );
        counter_family(
            &mut out,
            "echarts_tasks_completed_total",
            "Total number of render tasks completed successfully",
            snapshot.tasks.completed,
        );
        counter_family(
            &mut out,
            "echarts_tasks_failed_total",
            "Total number of render tasks that terminally failed",
            snapshot.tasks.failed,
        );
        counter_family(
            &mut out,
            "echarts_tasks_retried_total",
            "Total number of task retry attempts",
            snapshot.tasks.retried,
        );
        counter_family(
            &mut out,
            "echarts_tasks_timeout_total",
            "Total number of task timeouts detected by the sweep",
            snapshot.tasks.timeout,
        );

        gauge_family(
            &mut out,
            "echarts_queue_pending_tasks",
            "Current number of tasks waiting in the queue",
            snapshot.queue.pending_tasks as f64,
        );
        gauge_family(
            &mut out,
            "echarts_queue_processing_tasks",
            "Current number of in-flight tasks",
            snapshot.queue.processing_tasks as f64,
        );
        gauge_family(
            &mut out,
            "echarts_queue_max_pending_tasks",
            "Historical maximum of pending tasks",
            snapshot.queue.max_pending_tasks as f64,
        );
        gauge_family(
            &mut out,
            "echarts_queue_max_processing_tasks",
            "Historical maximum of in-flight tasks",
            snapshot.queue.max_processing_tasks as f64,
        );

        counter_family(
            &mut out,
            "echarts_oss_uploads_total",
            "Total number of successful object uploads",
            snapshot.oss.uploads,
        );
        counter_family(
            &mut out,
            "echarts_oss_upload_failures_total",
            "Total number of failed object uploads",
            snapshot.oss.upload_failures,
        );
        counter_family(
            &mut out,
            "echarts_oss_deletes_total",
            "Total number of successful object deletions",
            snapshot.oss.deletes,
        );
        counter_family(
            &mut out,
            "echarts_oss_delete_failures_total",
            "Total number of failed object deletions",
            snapshot.oss.delete_failures,
        );

        counter_family(
            &mut out,
            "echarts_http_requests_total",
            "Total number of HTTP requests received",
            snapshot.http.total_requests,
        );
        out.push_str("# HELP echarts_http_responses_total HTTP responses grouped by status class\n");
        out.push_str("# TYPE echarts_http_responses_total counter\n");
        out.push_str(&format!(
            "echarts_http_responses_total{{status_class=\"2xx\"}} {}\n",
            snapshot.http.responses_2xx
        ));
        out.push_str(&format!(
            "echarts_http_responses_total{{status_class=\"4xx\"}} {}\n",
            snapshot.http.responses_4xx
        ));
        out.push_str(&format!(
            "echarts_http_responses_total{{status_class=\"5xx\"}} {}\n",
            snapshot.http.responses_5xx
        ));

        let summary = snapshot.processing_time;
        out.push_str(
            "# HELP echarts_task_processing_time_ms Per-task processing duration in milliseconds\n",
        );
        out.push_str("# TYPE echarts_task_processing_time_ms gauge\n");
        out.push_str(&format!(
            "echarts_task_processing_time_ms{{quantile=\"0.5\"}} {}\n",
            summary.p50
        ));
        out.push_str(&format!(
            "echarts_task_processing_time_ms{{quantile=\"0.95\"}} {}\n",
            summary.p95
        ));
        out.push_str(&format!(
            "echarts_task_processing_time_ms{{quantile=\"0.99\"}} {}\n",
            summary.p99
        ));
        gauge_family(
            &mut out,
            "echarts_task_processing_time_avg_ms",
            "Average per-task processing duration in milliseconds",
            summary.avg,
        );

        gauge_family(
            &mut out,
            "echarts_uptime_seconds",
            "Seconds since the service started",
            snapshot.system.uptime_seconds as f64,
        );

        out.push_str("# HELP echarts_info Service build information\n");
        out.push_str("# TYPE echarts_info gauge\n");
        out.push_str(&format!(
            "echarts_info{{version=\"{}\"}} 1\n",
            env!("CARGO_PKG_VERSION")
        ));

        out
    }
}

fn counter_family(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} counter\n"));
    out.push_str(&format!("{name} {value}\n"));
}

fn gauge_family(out: &mut String, name: &str, help: &str, value: f64) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} gauge\n"));
    out.push_str(&format!("{name} {value}\n"));
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub tasks: TaskMetricsSnapshot,
    pub queue: QueueMetricsSnapshot,
    pub oss: OssMetricsSnapshot,
    pub http: HttpMetricsSnapshot,
    pub system: SystemMetricsSnapshot,
    pub processing_time: DurationSummary,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetricsSnapshot {
    pub created: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetricsSnapshot {
    pub pending_tasks: u64,
    pub processing_tasks: u64,
    pub max_pending_tasks: u64,
    pub max_processing_tasks: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OssMetricsSnapshot {
    pub uploads: u64,
    pub upload_failures: u64,
    pub deletes: u64,
    pub delete_failures: u64,
    pub average_upload_size: f64,
    pub average_upload_duration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpMetricsSnapshot {
    pub total_requests: u64,
    pub responses_2xx: u64,
    pub responses_4xx: u64,
    pub responses_5xx: u64,
    pub average_response_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetricsSnapshot {
    pub start_time: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub memory_usage_mb: Option<f64>,
    pub cpu_usage_percent: Option<f64>,
}
