//! 健康检查处理器
//! 提供 /health 和 /ready 端点

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::{db, middleware::AppState};

/// 存活探针响应
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// 就绪探针响应
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub checks: Vec<HealthCheck>,
}

/// 健康检查项
#[derive(Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthCheck {
    fn from_status(name: &str, status: db::HealthStatus) -> Self {
        Self {
            name: name.to_string(),
            status: status.as_str().to_string(),
            message: match status {
                db::HealthStatus::Healthy => None,
                db::HealthStatus::Unhealthy(msg) => Some(msg),
            },
        }
    }
}

static APP_START_TIME: OnceLock<Instant> = OnceLock::new();

/// 记录应用启动时间，main 中调用
pub fn set_start_time() {
    APP_START_TIME.get_or_init(Instant::now);
}

/// 应用运行时间（秒）
pub fn get_uptime() -> u64 {
    APP_START_TIME
        .get()
        .map_or(0, |start| start.elapsed().as_secs())
}

/// 存活探针
/// 快速响应，不检查依赖
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: get_uptime(),
    })
}

/// 就绪探针
///
/// 数据库不可用时未就绪；计数存储不可用只报告，服务以降级模式继续。
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut checks = Vec::new();

    if let Some(pool) = &state.db {
        checks.push(HealthCheck::from_status("database", db::health_check(pool).await));
        db::record_pool_metrics(pool);
    }

    let store_status = match state.store.ping().await {
        Ok(()) => db::HealthStatus::Healthy,
        Err(e) => db::HealthStatus::Unhealthy(e.to_string()),
    };
    checks.push(HealthCheck::from_status("counter_store", store_status));

    let ready = checks
        .iter()
        .filter(|c| c.name != "counter_store")
        .all(|c| c.status == "healthy");
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(ReadinessResponse { ready, checks }))
}
