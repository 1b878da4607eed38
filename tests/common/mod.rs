//! 测试公共模块
//! 内存仓储 + 内存计数存储构建的应用状态，无需数据库

#![allow(dead_code)]

use account_service::{
    config::{
        AppConfig, CounterStoreConfig, DatabaseConfig, LoggingConfig, MaintenanceConfig,
        RateLimitConfig, SecurityConfig, ServerConfig,
    },
    middleware::AppState,
    models::{auth::ClientInfo, user::RegisterRequest, user::User},
    repository::Repositories,
    routes,
    store::{CounterStore, MemoryCounterStore, StoreError},
};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, Response},
    Router,
};
use http_body_util::BodyExt;
use secrecy::Secret;
use std::{sync::Arc, time::Duration};

pub const TEST_PASSWORD: &str = "secret";

/// 创建测试配置
pub fn create_test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            addr: "127.0.0.1:0".to_string(),
            graceful_shutdown_timeout_secs: 5,
            max_body_bytes: 64 * 1024,
        },
        database: DatabaseConfig {
            backend: "memory".to_string(),
            url: Secret::new("postgresql://localhost/account_test".to_string()),
            max_connections: 5,
            min_connections: 1,
            acquire_timeout_secs: 5,
            idle_timeout_secs: 300,
            max_lifetime_secs: 1800,
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
        security: SecurityConfig {
            jwt_secret: Secret::new("test-secret-key-for-testing-only-min-32-chars".to_string()),
            access_token_exp_secs: 300,
            refresh_token_exp_secs: 3600,
            password_min_length: 6,
            password_require_uppercase: false,
            password_require_digit: false,
            password_require_special: false,
            // 测试中使用最低成本
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
            trust_proxy: true,
            token_blacklist_fail_mode: "closed".to_string(),
        },
        rate_limit: RateLimitConfig {
            global_max_requests: 1000,
            global_window_secs: 60,
            auth_max_requests: 1000,
            auth_window_secs: 60,
            user_max_requests: 1000,
            user_window_secs: 60,
        },
        counter_store: CounterStoreConfig {
            backend: "memory".to_string(),
            connect_retries: 1,
            retry_interval_secs: 1,
        },
        maintenance: MaintenanceConfig {
            cleanup_interval_secs: 0,
            login_attempt_retention_days: 30,
            security_event_retention_days: 90,
        },
    }
}

/// 测试应用：状态 + 直接访问的仓储与计数存储
pub struct TestApp {
    pub state: Arc<AppState>,
    pub repos: Repositories,
    pub store: Arc<MemoryCounterStore>,
}

impl TestApp {
    pub fn router(&self) -> Router {
        routes::create_router(self.state.clone())
    }
}

pub fn create_test_app() -> TestApp {
    create_test_app_with(create_test_config())
}

pub fn create_test_app_with(config: AppConfig) -> TestApp {
    let repos = Repositories::in_memory();
    let store = Arc::new(MemoryCounterStore::new());
    let state = AppState::new(config, repos.clone(), store.clone(), None)
        .expect("Failed to create app state");

    TestApp {
        state: Arc::new(state),
        repos,
        store,
    }
}

/// 使用指定计数存储创建应用状态
pub fn create_test_state_with_store(config: AppConfig, store: Arc<dyn CounterStore>) -> Arc<AppState> {
    Arc::new(
        AppState::new(config, Repositories::in_memory(), store, None)
            .expect("Failed to create app state"),
    )
}

pub fn client(ip: &str) -> ClientInfo {
    ClientInfo::new(ip, "test-agent/1.0")
}

pub fn register_request(email: &str, password: &str) -> RegisterRequest {
    RegisterRequest {
        name: "Test User".to_string(),
        email: email.to_string(),
        password: password.to_string(),
        age: None,
    }
}

/// 通过服务层注册用户
pub async fn register_user(state: &AppState, email: &str, ip: &str) -> User {
    state
        .auth_service
        .register(register_request(email, TEST_PASSWORD), &client(ip))
        .await
        .expect("Failed to register test user")
}

/// 构造 JSON 请求
pub fn json_request(method: &str, uri: &str, ip: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", ip)
        .header(header::USER_AGENT, "test-agent/1.0")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// 构造带访问令牌的请求
pub fn authed_request(
    method: &str,
    uri: &str,
    ip: &str,
    token: &str,
    body: Option<serde_json::Value>,
) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", ip)
        .header(header::USER_AGENT, "test-agent/1.0")
        .header(header::AUTHORIZATION, format!("Bearer {}", token));

    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    if bytes.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(&bytes).unwrap()
}

/// 所有操作都失败的计数存储
pub struct FailingCounterStore;

fn down() -> StoreError {
    StoreError::Unavailable("connection refused".to_string())
}

#[async_trait]
impl CounterStore for FailingCounterStore {
    async fn set(&self, _: &str, _: i64, _: Option<Duration>) -> Result<(), StoreError> {
        Err(down())
    }

    async fn get(&self, _: &str) -> Result<Option<i64>, StoreError> {
        Err(down())
    }

    async fn delete(&self, _: &str) -> Result<bool, StoreError> {
        Err(down())
    }

    async fn exists(&self, _: &str) -> Result<bool, StoreError> {
        Err(down())
    }

    async fn incr(&self, _: &str) -> Result<i64, StoreError> {
        Err(down())
    }

    async fn expire(&self, _: &str, _: Duration) -> Result<bool, StoreError> {
        Err(down())
    }

    async fn ttl(&self, _: &str) -> Result<Option<Duration>, StoreError> {
        Err(down())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Err(down())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        Err(down())
    }
}
