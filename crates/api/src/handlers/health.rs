use axum::Json;
use serde_json::{json, Value};

/// 存活探针：进程在则200
pub async fn liveness() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": "echarts-export-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
