use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use ring::hmac;
use tracing::debug;

use echarts_export_config::OssConfig;
use echarts_export_errors::{ExportError, ExportResult};

use crate::oss::{ObjectStore, UploadedObject};

/// 阿里云OSS的最小REST客户端
///
/// 只实现引擎需要的三个操作：PUT对象、DELETE对象、连通性探测，
/// 请求用V1签名（HMAC-SHA1）。
pub struct HttpOssClient {
    http: reqwest::Client,
    config: OssConfig,
}

impl HttpOssClient {
    pub fn new(config: OssConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "https://{}.{}.aliyuncs.com",
            self.config.bucket, self.config.region
        )
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint(), path)
    }

    /// V1签名串：VERB\nContent-MD5\nContent-Type\nDate\nCanonicalizedResource
    fn string_to_sign(verb: &str, content_type: &str, date: &str, resource: &str) -> String {
        format!("{verb}\n\n{content_type}\n{date}\n{resource}")
    }

    fn authorization(&self, verb: &str, content_type: &str, date: &str, path: &str) -> String {
        let resource = format!("/{}/{}", self.config.bucket, path);
        let sts = Self::string_to_sign(verb, content_type, date, &resource);
        let key = hmac::Key::new(
            hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            self.config.access_key_secret.as_bytes(),
        );
        let signature = general_purpose::STANDARD.encode(hmac::sign(&key, sts.as_bytes()));
        format!("OSS {}:{}", self.config.access_key_id, signature)
    }
}

/// HTTP Date 头要求的GMT格式
fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[async_trait]
impl ObjectStore for HttpOssClient {
    async fn upload(
        &self,
        buffer: &[u8],
        path: &str,
        content_type: &str,
    ) -> ExportResult<UploadedObject> {
        let date = http_date(Utc::now());
        let url = self.object_url(path);
        debug!(path, size = buffer.len(), "uploading object");

        let response = self
            .http
            .put(&url)
            .header("Date", &date)
            .header("Content-Type", content_type)
            .header(
                "Authorization",
                self.authorization("PUT", content_type, &date, path),
            )
            .body(buffer.to_vec())
            .send()
            .await
            .map_err(|e| ExportError::object_store(format!("upload request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExportError::object_store(format!(
                "upload rejected with status {status}: {body}"
            )));
        }

        Ok(UploadedObject {
            url,
            stored_path: path.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> ExportResult<()> {
        let date = http_date(Utc::now());
        debug!(path, "deleting object");

        let response = self
            .http
            .delete(self.object_url(path))
            .header("Date", &date)
            .header("Authorization", self.authorization("DELETE", "", &date, path))
            .send()
            .await
            .map_err(|e| ExportError::object_store(format!("delete request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            // 适配层把 NoSuchKey 当成功处理
            return Err(ExportError::object_store("NoSuchKey"));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExportError::object_store(format!(
                "delete rejected with status {status}: {body}"
            )));
        }
        Ok(())
    }

    async fn test_connection(&self) -> ExportResult<bool> {
        let date = http_date(Utc::now());
        let resource_path = "?max-keys=1";

        let response = self
            .http
            .get(format!("{}/{resource_path}", self.endpoint()))
            .header("Date", &date)
            .header("Authorization", self.authorization("GET", "", &date, ""))
            .send()
            .await
            .map_err(|e| ExportError::object_store(format!("connectivity probe failed: {e}")))?;

        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn test_config() -> OssConfig {
        OssConfig {
            access_key_id: "LTAItest".to_string(),
            access_key_secret: "secret".to_string(),
            bucket: "charts".to_string(),
            region: "oss-cn-hangzhou".to_string(),
            custom_domain: None,
            path_prefix: None,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_http_date_format() {
        let date = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap();
        assert_eq!(http_date(date), "Fri, 01 Mar 2024 12:30:45 GMT");
    }

    #[test]
    fn test_string_to_sign_layout() {
        let sts = HttpOssClient::string_to_sign(
            "PUT",
            "image/svg+xml",
            "Fri, 01 Mar 2024 12:30:45 GMT",
            "/charts/exports/a.svg",
        );
        assert_eq!(
            sts,
            "PUT\n\nimage/svg+xml\nFri, 01 Mar 2024 12:30:45 GMT\n/charts/exports/a.svg"
        );
    }

    #[test]
    fn test_authorization_header_shape() {
        let client = HttpOssClient::new(test_config());
        let auth = client.authorization(
            "PUT",
            "image/svg+xml",
            "Fri, 01 Mar 2024 12:30:45 GMT",
            "exports/a.svg",
        );
        assert!(auth.starts_with("OSS LTAItest:"));
        // HMAC-SHA1 的base64编码固定28个字符
        let signature = auth.rsplit(':').next().unwrap();
        assert_eq!(signature.len(), 28);
    }

    #[test]
    fn test_object_url() {
        let client = HttpOssClient::new(test_config());
        assert_eq!(
            client.object_url("exports/a.svg"),
            "https://charts.oss-cn-hangzhou.aliyuncs.com/exports/a.svg"
        );
    }
}
