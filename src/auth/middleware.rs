//! JWT 认证中间件

use crate::{
    auth::jwt::Claims,
    error::AppError,
    middleware::AppState,
    models::role::ADMIN_ROLE,
};
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use uuid::Uuid;

const ACCESS_TOKEN_COOKIE: &str = "access_token";
const SESSION_HEADER: &str = "x-session-id";

/// 认证上下文（附加到请求扩展）
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub claims: Claims,
    /// 通过 X-Session-ID 提供并已校验归属的会话
    pub session_id: Option<String>,
}

impl AuthContext {
    pub fn is_admin(&self) -> bool {
        self.claims.roles.iter().any(|r| r == ADMIN_ROLE)
    }
}

impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or(AppError::InvalidToken)
    }
}

/// 提取访问令牌：优先 Authorization: Bearer，其次 access_token cookie
pub fn extract_token(headers: &HeaderMap) -> Result<String, AppError> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Ok(token.to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|s| s.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == ACCESS_TOKEN_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
        .ok_or(AppError::InvalidToken)
}

fn extract_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// JWT 认证中间件 - 必须认证
///
/// 校验令牌签名与撤销状态；带 X-Session-ID 时会话必须有效且属于该用户。
pub async fn jwt_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_token(req.headers())?;
    let claims = state.token_service.authenticate(&token).await?;
    let user_id = claims.user_id()?;

    let session_id = match extract_session_id(req.headers()) {
        Some(session_id) => {
            let session = state.session_service.validate_session(&session_id).await?;
            if session.user_id != user_id {
                tracing::warn!(user_id = %user_id, "Session does not belong to token subject");
                return Err(AppError::InvalidSession);
            }
            Some(session_id)
        }
        None => None,
    };

    req.extensions_mut().insert(AuthContext {
        user_id,
        claims,
        session_id,
    });

    Ok(next.run(req).await)
}

/// 管理员角色检查，需位于 JWT 认证之后
pub async fn require_admin(req: Request, next: Next) -> Result<Response, AppError> {
    let ctx = req
        .extensions()
        .get::<AuthContext>()
        .ok_or(AppError::InvalidToken)?;

    if !ctx.is_admin() {
        tracing::warn!(user_id = %ctx.user_id, "Admin endpoint denied");
        return Err(AppError::Forbidden);
    }

    Ok(next.run(req).await)
}
