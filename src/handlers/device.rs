//! 设备信任

use crate::{
    auth::middleware::AuthContext,
    error::AppError,
    middleware::AppState,
    models::{auth::ClientInfo, session::TrustDeviceRequest},
};
use axum::{extract::State, response::IntoResponse, Json};
use std::sync::Arc;

pub async fn list_devices(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let devices = state.session_service.list_devices(ctx.user_id).await?;

    Ok(Json(devices))
}

pub async fn trust_device(
    State(state): State<Arc<AppState>>,
    ctx: AuthContext,
    client: ClientInfo,
    Json(req): Json<TrustDeviceRequest>,
) -> Result<impl IntoResponse, AppError> {
    let device = state
        .auth_service
        .trust_device(ctx.user_id, &req.fingerprint, &client)
        .await?;

    Ok(Json(device))
}
