use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

/// 统一响应封装：code 与HTTP状态一致
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: u16,
    pub msg: String,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
}

impl<T> ApiResponse<T>
where
    T: Serialize,
{
    pub fn success(data: T) -> Self {
        Self {
            code: 200,
            msg: "success".to_string(),
            data: Some(data),
            error: None,
        }
    }

    pub fn with_status(code: StatusCode, msg: impl Into<String>, data: T) -> Self {
        Self {
            code: code.as_u16(),
            msg: msg.into(),
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<serde_json::Value> {
    pub fn failure(code: StatusCode, msg: impl Into<String>, error: ErrorBody) -> Self {
        Self {
            code: code.as_u16(),
            msg: msg.into(),
            data: None,
            error: Some(error),
        }
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Serialize,
{
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

pub fn success<T: Serialize>(data: T) -> ApiResponse<T> {
    ApiResponse::success(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope_shape() {
        let response = ApiResponse::success(serde_json::json!({"taskId": "abc"}));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["code"], 200);
        assert_eq!(json["msg"], "success");
        assert_eq!(json["data"]["taskId"], "abc");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_failure_envelope_carries_error_type() {
        let response = ApiResponse::failure(
            StatusCode::BAD_REQUEST,
            "invalid task config",
            ErrorBody {
                kind: "VALIDATION_ERROR".to_string(),
                message: "invalid task config: width must be between 1 and 4000".to_string(),
                details: Some(vec!["width must be between 1 and 4000".to_string()]),
            },
        );
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["code"], 400);
        assert_eq!(json["data"], serde_json::Value::Null);
        assert_eq!(json["error"]["type"], "VALIDATION_ERROR");
        assert!(json["error"]["details"].is_array());
    }
}
