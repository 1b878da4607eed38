//! 管理端点：限流规则、IP 黑名单、安全事件、数据清理

use crate::{
    auth::middleware::AuthContext,
    error::AppError,
    middleware::AppState,
    models::security::{
        BlacklistIpRequest, CreateRateLimitRuleRequest, SecurityEventQuery,
        UpdateRateLimitRuleRequest,
    },
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

pub async fn list_rate_limit_rules(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.admin_service.list_rules().await?))
}

pub async fn create_rate_limit_rule(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
    Json(req): Json<CreateRateLimitRuleRequest>,
) -> Result<impl IntoResponse, AppError> {
    let rule = state.admin_service.create_rule(ctx.user_id, req).await?;

    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn update_rate_limit_rule(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
    Path(rule_id): Path<Uuid>,
    Json(req): Json<UpdateRateLimitRuleRequest>,
) -> Result<impl IntoResponse, AppError> {
    let rule = state
        .admin_service
        .update_rule(ctx.user_id, rule_id, req)
        .await?;

    Ok(Json(rule))
}

pub async fn deactivate_rate_limit_rule(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
    Path(rule_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state
        .admin_service
        .deactivate_rule(ctx.user_id, rule_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_blacklist(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.admin_service.list_blacklist().await?))
}

pub async fn blacklist_ip(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
    Json(req): Json<BlacklistIpRequest>,
) -> Result<impl IntoResponse, AppError> {
    let entry = state.admin_service.blacklist_ip(ctx.user_id, req).await?;

    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn remove_from_blacklist(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
    Path(ip): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state
        .admin_service
        .remove_from_blacklist(ctx.user_id, &ip)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_security_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SecurityEventQuery>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.admin_service.list_security_events(&query).await?))
}

/// 立即执行一次过期数据清理
pub async fn run_cleanup(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.session_service.cleanup_expired().await?))
}
