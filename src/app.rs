use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, sync::broadcast};
use tracing::info;

use echarts_export_api::{create_app, AppState};
use echarts_export_config::AppConfig;
use echarts_export_core::{
    CleanupScheduler, CleanupSchedulerOptions, HttpOssClient, ManagerOptions, MetricsCollector,
    OssAdapter, SvgChartRenderer, TaskManager,
};

/// 主应用程序：装配引擎各部件并承载HTTP服务
pub struct Application {
    config: AppConfig,
    manager: Arc<TaskManager>,
    cleanup_scheduler: Arc<CleanupScheduler>,
    metrics: Arc<MetricsCollector>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let metrics = Arc::new(MetricsCollector::new());

        let oss = match &config.oss {
            Some(oss_config) => {
                let client = Arc::new(HttpOssClient::new(oss_config.clone()));
                let adapter = Arc::new(OssAdapter::new(client, oss_config.clone()));
                match adapter.test_connection().await {
                    Ok(true) => info!(bucket = %oss_config.bucket, "对象存储连通性正常"),
                    Ok(false) => tracing::warn!("对象存储连通性探测未通过，上传可能失败"),
                    Err(e) => tracing::warn!("对象存储连通性探测失败: {e}"),
                }
                Some(adapter)
            }
            None => {
                info!("未配置对象存储，渲染结果将以dataURL内联返回");
                None
            }
        };

        let manager = TaskManager::new(
            config.queue.clone(),
            Arc::new(SvgChartRenderer),
            oss,
            Arc::clone(&metrics),
            ManagerOptions {
                retention_days: config.cleanup.retention_days,
                cleanup_interval: config.cleanup.interval(),
            },
        );

        let cleanup_scheduler = CleanupScheduler::new(
            Arc::clone(&manager),
            CleanupSchedulerOptions {
                cleanup_hour: config.cleanup.cleanup_hour,
                max_retries: config.cleanup.max_retries,
                retention_days: config.cleanup.retention_days,
            },
        );

        Ok(Self {
            config,
            manager,
            cleanup_scheduler,
            metrics,
        })
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.manager.start();
        self.cleanup_scheduler.start();

        let state = AppState {
            manager: Arc::clone(&self.manager),
            cleanup_scheduler: Arc::clone(&self.cleanup_scheduler),
            metrics: Arc::clone(&self.metrics),
        };
        let app = create_app(state);

        let addr = format!("0.0.0.0:{}", self.config.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("绑定监听地址失败: {addr}"))?;
        info!("HTTP服务监听于 http://{addr}");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
            .context("HTTP服务异常退出")?;

        // HTTP停止后拆除后台部件
        self.cleanup_scheduler.stop().await;
        self.manager.destroy().await;
        info!("应用组件已全部停止");
        Ok(())
    }
}
