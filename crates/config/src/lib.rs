use std::time::Duration;

use echarts_export_errors::{ExportError, ExportResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// 服务完整配置
///
/// 全部来自进程环境变量；变量名沿用原部署约定，便于直接替换部署。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub oss: Option<OssConfig>,
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// PORT，默认3000
    pub port: u16,
    /// NODE_ENV，非 production 时启用 pretty 日志
    pub environment: String,
}

impl ServerConfig {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// QUEUE_MAX_CONCURRENT，默认10，有效范围 1-100
    pub max_concurrent: usize,
    /// QUEUE_TASK_TIMEOUT（秒），默认300，有效范围 30-3600
    pub task_timeout: Duration,
    /// QUEUE_RETRY_ATTEMPTS，默认3，有效范围 0-10（首次执行之外的重试次数）
    pub retry_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            task_timeout: Duration::from_secs(300),
            retry_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OssConfig {
    pub access_key_id: String,
    pub access_key_secret: String,
    pub bucket: String,
    /// OSS_REGION，必须以 oss- 开头
    pub region: String,
    pub custom_domain: Option<String>,
    /// OSS_PATH_PREFIX，规范化为以 / 结尾
    pub path_prefix: Option<String>,
    /// 单次操作的最大尝试次数
    pub max_retries: u32,
    /// 线性退避基数：第 n 次失败后等待 retry_delay × n
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// CLEANUP_INTERVAL_HOURS，默认24
    pub interval_hours: u64,
    /// TASK_RETENTION_DAYS，默认7，有效范围 1-365
    pub retention_days: i64,
    /// CLEANUP_HOUR，每天执行定时清理的本地整点，默认2
    pub cleanup_hour: u8,
    /// 单个清理周期内的最大尝试次数
    pub max_retries: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_hours: 24,
            retention_days: 7,
            cleanup_hour: 2,
            max_retries: 3,
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours * 3600)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 3000,
                environment: "development".to_string(),
            },
            queue: QueueConfig::default(),
            oss: None,
            cleanup: CleanupConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从进程环境加载配置
    pub fn from_env() -> ExportResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 从任意查找函数加载配置，测试时可以注入变量表
    pub fn from_lookup<F>(get: F) -> ExportResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server = ServerConfig {
            port: parse_number(&get, "PORT", 3000u64, 1, 65535)? as u16,
            environment: get("NODE_ENV").unwrap_or_else(|| "development".to_string()),
        };

        let queue = QueueConfig {
            max_concurrent: parse_number(&get, "QUEUE_MAX_CONCURRENT", 10u64, 1, 100)? as usize,
            task_timeout: Duration::from_secs(parse_number(
                &get,
                "QUEUE_TASK_TIMEOUT",
                300u64,
                30,
                3600,
            )?),
            retry_attempts: parse_number(&get, "QUEUE_RETRY_ATTEMPTS", 3u64, 0, 10)? as u32,
        };

        let cleanup = CleanupConfig {
            interval_hours: parse_number(&get, "CLEANUP_INTERVAL_HOURS", 24u64, 1, 720)?,
            retention_days: parse_number(&get, "TASK_RETENTION_DAYS", 7u64, 1, 365)? as i64,
            cleanup_hour: parse_number(&get, "CLEANUP_HOUR", 2u64, 0, 23)? as u8,
            max_retries: 3,
        };

        let oss = Self::load_oss(&get)?;

        Ok(Self {
            server,
            queue,
            oss,
            cleanup,
        })
    }

    /// 三个凭证变量必须同时给出，否则视为未配置对象存储
    fn load_oss<F>(get: &F) -> ExportResult<Option<OssConfig>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let key_id = get("OSS_ACCESS_KEY_ID");
        let key_secret = get("OSS_ACCESS_KEY_SECRET");
        let bucket = get("OSS_BUCKET");

        let (access_key_id, access_key_secret, bucket) = match (key_id, key_secret, bucket) {
            (Some(id), Some(secret), Some(bucket)) => (id, secret, bucket),
            (None, None, None) => return Ok(None),
            _ => {
                warn!("OSS credentials incomplete, object store disabled");
                return Ok(None);
            }
        };

        let region = get("OSS_REGION").unwrap_or_else(|| "oss-cn-hangzhou".to_string());
        if !region.starts_with("oss-") {
            return Err(ExportError::config_error(format!(
                "OSS_REGION 必须以 oss- 开头: {region}"
            )));
        }

        Ok(Some(OssConfig {
            access_key_id,
            access_key_secret,
            bucket,
            region,
            custom_domain: get("OSS_CUSTOM_DOMAIN").filter(|d| !d.is_empty()),
            path_prefix: get("OSS_PATH_PREFIX").map(normalize_path_prefix),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }))
    }
}

/// 路径前缀统一以 / 结尾，开头的 / 去掉
pub fn normalize_path_prefix(prefix: String) -> String {
    let trimmed = prefix.trim_start_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

/// 解析数值变量；超出有效范围时收敛到边界并告警，无法解析则报配置错误
fn parse_number<F>(get: &F, name: &str, default: u64, min: u64, max: u64) -> ExportResult<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = match get(name) {
        Some(raw) if !raw.trim().is_empty() => raw,
        _ => return Ok(default),
    };

    let value: u64 = raw.trim().parse().map_err(|_| {
        ExportError::config_error(format!("环境变量 {name} 的值无法解析为数字: {raw}"))
    })?;

    if value < min || value > max {
        let clamped = value.clamp(min, max);
        warn!(
            variable = name,
            value, clamped, "config value out of range, clamped"
        );
        return Ok(clamped);
    }

    Ok(value)
}
