//! HTTP 中间件
//! 应用状态、请求追踪、速率限制、客户端信息提取

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{request::Parts, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    auth::{middleware::AuthContext, JwtService, PasswordHasher, PasswordPolicy},
    config::AppConfig,
    error::AppError,
    models::auth::ClientInfo,
    repository::Repositories,
    services::{
        AdminService, AuditService, AuthService, CredentialService, FraudService, RateLimitDecision,
        RateLimiter, SessionService, TokenService,
    },
    store::CounterStore,
};

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    /// 内存后端时为 None
    pub db: Option<PgPool>,
    pub store: Arc<dyn CounterStore>,
    pub auth_service: Arc<AuthService>,
    pub credential_service: Arc<CredentialService>,
    pub token_service: Arc<TokenService>,
    pub session_service: Arc<SessionService>,
    pub admin_service: Arc<AdminService>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    /// 组装全部服务
    pub fn new(
        config: AppConfig,
        repos: Repositories,
        store: Arc<dyn CounterStore>,
        db: Option<PgPool>,
    ) -> Result<Self, AppError> {
        let security = &config.security;

        let jwt = Arc::new(JwtService::from_config(security)?);
        let hasher = Arc::new(PasswordHasher::from_config(security)?);
        let policy = PasswordPolicy::from_config(security);

        let audit = Arc::new(AuditService::new(
            repos.security_events.clone(),
            repos.login_attempts.clone(),
        ));
        let token_service = Arc::new(TokenService::new(jwt, &repos, store.clone(), security));
        let credential_service = Arc::new(CredentialService::new(
            &repos,
            token_service.clone(),
            hasher,
            policy,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            store.clone(),
            repos.rate_limit_rules.clone(),
            config.rate_limit.clone(),
        ));
        let session_service = Arc::new(SessionService::new(
            &repos,
            store.clone(),
            config.maintenance.clone(),
        ));
        let fraud_service = Arc::new(FraudService::new(&repos));
        let admin_service = Arc::new(AdminService::new(
            &repos,
            rate_limiter.clone(),
            audit.clone(),
        ));
        let auth_service = Arc::new(AuthService::new(
            credential_service.clone(),
            token_service.clone(),
            fraud_service,
            session_service.clone(),
            rate_limiter.clone(),
            audit,
            security.refresh_token_exp_secs,
        ));

        Ok(Self {
            config,
            db,
            store,
            auth_service,
            credential_service,
            token_service,
            session_service,
            admin_service,
            rate_limiter,
        })
    }
}

tokio::task_local! {
    static REQUEST_ID: String;
}

/// 当前请求的 request_id，不在请求上下文中时返回 None
pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(|id| id.clone()).ok()
}

/// 请求追踪中间件
/// 为每个请求生成 trace_id 和 request_id，并记录指标
pub async fn request_tracking_middleware(req: Request, next: Next) -> Response {
    let trace_id = extract_or_generate_trace_id(req.headers());
    let request_id = Uuid::new_v4().to_string();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let span = tracing::info_span!(
        "http_request",
        trace_id = %trace_id,
        request_id = %request_id,
        method = %method,
        path = %path,
    );

    async move {
        let start = Instant::now();
        let mut response = REQUEST_ID.scope(request_id.clone(), next.run(req)).await;
        let elapsed = start.elapsed();
        let status = response.status().as_u16();

        metrics::counter!(
            "http_requests_total",
            "method" => method.clone(),
            "status" => status.to_string()
        )
        .increment(1);
        metrics::histogram!("http_request_duration_seconds").record(elapsed.as_secs_f64());

        tracing::info!(
            method = %method,
            path = %path,
            status,
            elapsed_ms = elapsed.as_millis() as u64,
            "Request completed"
        );

        if let Ok(value) = HeaderValue::from_str(&trace_id) {
            response.headers_mut().insert("x-trace-id", value);
        }
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("x-request-id", value);
        }

        response
    }
    .instrument(span)
    .await
}

/// 从请求头中提取或生成 trace_id
fn extract_or_generate_trace_id(headers: &HeaderMap) -> String {
    headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty() && s.len() <= 128)
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

// ==================== Rate Limiting ====================

const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// 写入限流响应头；已有的头（更内层的限流器写入）保持不变
fn apply_rate_limit_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    let values = [
        (RATE_LIMIT_LIMIT, decision.limit.to_string()),
        (RATE_LIMIT_REMAINING, decision.remaining.to_string()),
        (RATE_LIMIT_RESET, decision.reset_at.timestamp().to_string()),
    ];

    for (name, value) in values {
        if headers.contains_key(&name) {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}

fn rate_limited(scope: &'static str, key: &str, decision: &RateLimitDecision) -> Response {
    metrics::counter!("rate_limit_denied_total", "scope" => scope).increment(1);
    tracing::warn!(scope, key = %key, limit = decision.limit, "Rate limit exceeded");

    let mut response = AppError::RateLimitExceeded {
        retry_after_secs: decision.retry_after_secs(),
    }
    .into_response();
    apply_rate_limit_headers(&mut response, decision);
    response
}

/// 全局限流中间件（按客户端 IP）
/// 同时把解析出的客户端 IP 放入请求扩展
pub async fn global_rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&req, state.config.security.trust_proxy);
    let decision = state.rate_limiter.check_ip(&ip).await;

    if !decision.allowed {
        return rate_limited("global", &ip, &decision);
    }

    req.extensions_mut().insert(ClientIp(ip));

    let mut response = next.run(req).await;
    apply_rate_limit_headers(&mut response, &decision);
    response
}

/// 认证端点限流中间件（按端点 + IP）
pub async fn auth_rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&req, state.config.security.trust_proxy);
    let endpoint = req
        .uri()
        .path()
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("unknown")
        .to_string();

    let decision = state.rate_limiter.check_endpoint(&endpoint, &ip).await;

    if !decision.allowed {
        return rate_limited("auth", &endpoint, &decision);
    }

    let mut response = next.run(req).await;
    apply_rate_limit_headers(&mut response, &decision);
    response
}

/// 已认证用户限流中间件，需位于 JWT 认证之后
pub async fn user_rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(user_id) = req.extensions().get::<AuthContext>().map(|ctx| ctx.user_id) else {
        return next.run(req).await;
    };

    let decision = state.rate_limiter.check_user(user_id).await;

    if !decision.allowed {
        return rate_limited("user", &user_id.to_string(), &decision);
    }

    let mut response = next.run(req).await;
    apply_rate_limit_headers(&mut response, &decision);
    response
}

// ==================== Client Info ====================

/// 已解析的客户端 IP（由全局限流中间件写入扩展）
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

/// 解析客户端 IP
///
/// 信任代理时依次取 X-Forwarded-For 第一个地址、X-Real-IP，
/// 否则取连接地址；都拿不到时使用回环地址。
pub fn client_ip(req: &Request, trust_proxy: bool) -> String {
    if let Some(ClientIp(ip)) = req.extensions().get::<ClientIp>() {
        return ip.clone();
    }

    client_ip_from_parts(req.headers(), req.extensions(), trust_proxy)
}

fn client_ip_from_parts(
    headers: &HeaderMap,
    extensions: &axum::http::Extensions,
    trust_proxy: bool,
) -> String {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .map(str::trim)
            .filter(|ip| ip.parse::<std::net::IpAddr>().is_ok());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|ip| ip.parse::<std::net::IpAddr>().is_ok());
        if let Some(ip) = real_ip {
            return ip.to_string();
        }
    }

    if let Some(ConnectInfo(addr)) = extensions.get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }

    tracing::debug!("Could not determine client IP, using loopback address");
    "127.0.0.1".to_string()
}

/// Axum 提取器：客户端 IP 与 User-Agent
impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip = match parts.extensions.get::<ClientIp>() {
            Some(ClientIp(ip)) => ip.clone(),
            None => client_ip_from_parts(&parts.headers, &parts.extensions, false),
        };

        let user_agent = parts
            .headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown");

        Ok(ClientInfo::new(ip, user_agent))
    }
}
