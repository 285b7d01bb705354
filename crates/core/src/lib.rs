pub mod cleanup;
pub mod manager;
pub mod metrics;
pub mod oss;
pub mod oss_client;
pub mod queue;
pub mod renderer;

pub use cleanup::{CleanupScheduler, CleanupSchedulerOptions, CleanupSchedulerStatus};
pub use manager::{CleanupOutcome, DeleteFailure, ManagerOptions, TaskManager};
pub use metrics::{MetricsCollector, MetricsSnapshot, PROMETHEUS_CONTENT_TYPE};
pub use oss::{ObjectStore, OssAdapter, UploadResult, UploadedObject};
pub use oss_client::HttpOssClient;
pub use queue::TaskQueue;
pub use renderer::{ChartRenderer, RenderedChart, SvgChartRenderer};
