use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use echarts_export_config::{normalize_path_prefix, OssConfig};
use echarts_export_errors::{ExportError, ExportResult};

/// 对象存储上传结果
#[derive(Debug, Clone)]
pub struct UploadedObject {
    pub url: String,
    pub stored_path: String,
}

/// 外部对象存储契约
///
/// delete 要求幂等：对象不存在视为成功。
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(
        &self,
        buffer: &[u8],
        path: &str,
        content_type: &str,
    ) -> ExportResult<UploadedObject>;
    async fn delete(&self, path: &str) -> ExportResult<()>;
    async fn test_connection(&self) -> ExportResult<bool>;
}

/// 图表上传结果，file_name 是对象存储内的完整路径
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub url: String,
    pub file_name: String,
}

/// 对象存储适配层
///
/// 为上层屏蔽外部存储的瞬时故障：线性退避重试、生成唯一存储文件名、
/// 拼装公开访问URL。
pub struct OssAdapter {
    store: Arc<dyn ObjectStore>,
    config: OssConfig,
}

impl OssAdapter {
    pub fn new(store: Arc<dyn ObjectStore>, config: OssConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &OssConfig {
        &self.config
    }

    /// 生成并上传，返回公开URL与存储路径
    pub async fn upload_chart(
        &self,
        task_id: Uuid,
        buffer: &[u8],
        content_type: &str,
        extension: &str,
        path_override: Option<&str>,
    ) -> ExportResult<UploadResult> {
        let file_name = self.generate_file_name_in(task_id, extension, path_override);
        let uploaded = self
            .with_retry("upload", || {
                self.store.upload(buffer, &file_name, content_type)
            })
            .await?;
        debug!(path = %uploaded.stored_path, size = buffer.len(), "chart uploaded");
        Ok(UploadResult {
            url: self.public_url(&uploaded.stored_path),
            file_name: uploaded.stored_path,
        })
    }

    /// 删除对象；NoSuchKey 视为成功，不消耗重试
    pub async fn delete_file(&self, path: &str) -> ExportResult<()> {
        let store = &self.store;
        self.with_retry("delete", || async move {
            match store.delete(path).await {
                Err(e) if is_not_found(&e) => {
                    debug!(path, "object already absent, delete treated as success");
                    Ok(())
                }
                other => other,
            }
        })
        .await
    }

    pub async fn test_connection(&self) -> ExportResult<bool> {
        self.with_retry("test_connection", || self.store.test_connection())
            .await
    }

    /// `{prefix}{taskId}_{millis}_{6位随机hex}.{ext}`，构造上保证跨调用唯一
    pub fn generate_file_name(&self, task_id: Uuid, extension: &str) -> String {
        self.generate_file_name_in(task_id, extension, None)
    }

    fn generate_file_name_in(
        &self,
        task_id: Uuid,
        extension: &str,
        path_override: Option<&str>,
    ) -> String {
        let prefix = match path_override {
            Some(p) => normalize_path_prefix(p.to_string()),
            None => self.config.path_prefix.clone().unwrap_or_default(),
        };
        let millis = Utc::now().timestamp_millis();
        let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
        format!("{prefix}{task_id}_{millis}_{suffix:06x}.{extension}")
    }

    /// 公开访问URL：自定义域名优先，否则用 bucket.region.aliyuncs.com
    pub fn public_url(&self, path: &str) -> String {
        match &self.config.custom_domain {
            Some(domain) => format!("https://{domain}/{path}"),
            None => format!(
                "https://{}.{}.aliyuncs.com/{}",
                self.config.bucket, self.config.region, path
            ),
        }
    }

    /// 最多尝试 max_retries 次，第 n 次失败后等待 retry_delay × n
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut attempt_fn: F) -> ExportResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExportResult<T>>,
    {
        let max_attempts = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(operation, attempt, error = %e, "object store operation failed");
                    last_error = Some(e);
                    if attempt < max_attempts {
                        sleep(self.config.retry_delay * attempt).await;
                    }
                }
            }
        }

        let last = last_error.expect("at least one attempt was made");
        Err(ExportError::object_store(format!(
            "{operation} failed after {max_attempts} attempts: {last}"
        )))
    }
}

fn is_not_found(err: &ExportError) -> bool {
    let msg = err.to_string();
    msg.contains("NoSuchKey") || msg.contains("not found")
}
