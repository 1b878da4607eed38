//! 当前用户资料

use crate::{
    auth::middleware::AuthContext,
    error::AppError,
    middleware::AppState,
    models::{
        auth::ClientInfo,
        user::{UpdateProfileRequest, UserResponse, UserWithRoles},
    },
};
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::sync::Arc;

pub async fn get_me(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let (user, roles) = state.credential_service.get_profile(ctx.user_id).await?;

    Ok(Json(UserWithRoles {
        user: UserResponse::from(user),
        roles,
    }))
}

pub async fn update_me(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user = state
        .credential_service
        .update_profile(ctx.user_id, req)
        .await?;

    Ok(Json(UserResponse::from(user)))
}

/// 停用当前账户
pub async fn delete_me(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
    client: ClientInfo,
) -> Result<impl IntoResponse, AppError> {
    state
        .auth_service
        .deactivate_account(&ctx.claims, &client)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}
