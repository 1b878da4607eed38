//! 路由注册
//! 创建所有 API 路由并应用中间件

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::{
    auth::middleware::{jwt_auth_middleware, require_admin},
    handlers,
    middleware::{
        auth_rate_limit_middleware, global_rate_limit_middleware, request_tracking_middleware,
        user_rate_limit_middleware, AppState,
    },
};

/// 创建应用路由
pub fn create_router(state: Arc<AppState>) -> Router {
    // 公开端点（健康检查），不限流
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check));

    // 认证路由（无需认证，按端点 + IP 限流）
    let auth_routes = Router::new()
        .route("/api/v1/auth/register", post(handlers::auth::register))
        .route("/api/v1/auth/login", post(handlers::auth::login))
        .route("/api/v1/auth/refresh", post(handlers::auth::refresh_token))
        .layer(from_fn_with_state(state.clone(), auth_rate_limit_middleware));

    // 修改密码同时受端点限流和认证保护
    let password_routes = Router::new()
        .route("/api/v1/auth/password", put(handlers::auth::change_password))
        .layer(from_fn_with_state(state.clone(), auth_rate_limit_middleware));

    // 需要认证的路由
    let authenticated_routes = Router::new()
        .merge(password_routes)
        .route("/api/v1/auth/logout", post(handlers::auth::logout))
        .route(
            "/api/v1/users/me",
            get(handlers::user::get_me)
                .put(handlers::user::update_me)
                .delete(handlers::user::delete_me),
        )
        .route("/api/v1/devices", get(handlers::device::list_devices))
        .route("/api/v1/devices/trust", post(handlers::device::trust_device))
        .layer(from_fn_with_state(state.clone(), user_rate_limit_middleware))
        .layer(from_fn_with_state(state.clone(), jwt_auth_middleware));

    // 管理端点（需要 admin 角色）
    let admin_routes = Router::new()
        .route(
            "/api/v1/admin/rate-limit-rules",
            get(handlers::admin::list_rate_limit_rules).post(handlers::admin::create_rate_limit_rule),
        )
        .route(
            "/api/v1/admin/rate-limit-rules/{id}",
            put(handlers::admin::update_rate_limit_rule),
        )
        .route(
            "/api/v1/admin/rate-limit-rules/{id}/deactivate",
            post(handlers::admin::deactivate_rate_limit_rule),
        )
        .route(
            "/api/v1/admin/blacklist",
            get(handlers::admin::list_blacklist).post(handlers::admin::blacklist_ip),
        )
        .route(
            "/api/v1/admin/blacklist/{ip}",
            axum::routing::delete(handlers::admin::remove_from_blacklist),
        )
        .route(
            "/api/v1/admin/security-events",
            get(handlers::admin::list_security_events),
        )
        .route("/api/v1/admin/cleanup", post(handlers::admin::run_cleanup))
        .layer(from_fn(require_admin))
        .layer(from_fn_with_state(state.clone(), user_rate_limit_middleware))
        .layer(from_fn_with_state(state.clone(), jwt_auth_middleware));

    let api_routes = Router::new()
        .merge(auth_routes)
        .merge(authenticated_routes)
        .merge(admin_routes)
        .layer(from_fn_with_state(state.clone(), global_rate_limit_middleware))
        .layer(RequestBodyLimitLayer::new(state.config.server.max_body_bytes));

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(request_tracking_middleware))
        .with_state(state)
}
