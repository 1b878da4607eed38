//! 认证相关的 HTTP 处理器

use crate::{
    auth::middleware::AuthContext,
    error::AppError,
    middleware::AppState,
    models::{
        auth::{ClientInfo, LoginRequest, LogoutRequest, RefreshTokenRequest},
        user::{ChangePasswordRequest, RegisterRequest, UserResponse},
    },
};
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::sync::Arc;

/// 注册
pub async fn register(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user = state.auth_service.register(req, &client).await?;

    Ok((StatusCode::CREATED, Json(UserResponse::from(user))))
}

/// 登录
pub async fn login(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let response = state.auth_service.login(req, &client).await?;

    Ok(Json(response))
}

/// 刷新令牌
pub async fn refresh_token(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    Json(req): Json<RefreshTokenRequest>,
) -> Result<impl IntoResponse, AppError> {
    let token_pair = state
        .auth_service
        .refresh(&req.refresh_token, &client)
        .await?;

    Ok(Json(token_pair))
}

/// 登出
pub async fn logout(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
    client: ClientInfo,
    Json(req): Json<LogoutRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .auth_service
        .logout(
            &ctx.claims,
            req.refresh_token.as_deref(),
            ctx.session_id.as_deref(),
            &client,
        )
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// 修改密码
pub async fn change_password(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
    client: ClientInfo,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .auth_service
        .change_password(&ctx.claims, &req.current_password, &req.new_password, &client)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}
