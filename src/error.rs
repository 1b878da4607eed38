//! 统一错误模型
//! 定义所有错误类型和错误响应格式

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// 应用错误类型
///
/// 身份类错误（`InvalidCredentials`、`InvalidToken`）不携带具体原因，
/// 具体原因只进入日志和审计记录。
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Account already exists")]
    AlreadyExists,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Weak credential: {0}")]
    WeakCredential(String),

    #[error("Invalid token")]
    InvalidToken,

    #[error("Invalid session")]
    InvalidSession,

    #[error("Access denied")]
    Forbidden,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::AlreadyExists => StatusCode::CONFLICT,
            AppError::InvalidCredentials | AppError::InvalidToken | AppError::InvalidSession => {
                StatusCode::UNAUTHORIZED
            }
            AppError::WeakCredential(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Database(_)
            | AppError::Store(_)
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 获取用户友好的错误消息（不包含敏感信息）
    pub fn user_message(&self) -> String {
        match self {
            AppError::AlreadyExists => "Account already exists".to_string(),
            AppError::InvalidCredentials => "Invalid email or password".to_string(),
            AppError::WeakCredential(msg) => msg.clone(),
            AppError::InvalidToken => "Invalid or expired token".to_string(),
            AppError::InvalidSession => "Invalid or expired session".to_string(),
            AppError::Forbidden => "Access denied".to_string(),
            AppError::Validation(msg) => msg.clone(),
            AppError::NotFound(what) => format!("{} not found", what),
            AppError::RateLimitExceeded { .. } => "Rate limit exceeded".to_string(),
            AppError::Database(_) => "Database error occurred".to_string(),
            AppError::Store(_) => "Service temporarily unavailable".to_string(),
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> u16 {
        self.status_code().as_u16()
    }

    /// 是否为服务端错误
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

/// 错误响应 DTO
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: u16,
    pub message: String,
    pub request_id: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id = crate::middleware::current_request_id()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                message: self.user_message(),
                request_id,
            },
        };

        if self.is_server_error() {
            tracing::error!(
                code = self.code(),
                message = %self,
                request_id = %error_response.error.request_id,
                "Application error"
            );
        } else {
            tracing::debug!(
                code = self.code(),
                message = %self,
                request_id = %error_response.error.request_id,
                "Request rejected"
            );
        }

        let mut response = (status, Json(error_response)).into_response();

        if let AppError::RateLimitExceeded { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

/// 将 validator 的校验错误转换为 Validation
impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        AppError::Validation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(AppError::AlreadyExists.code(), 409);
        assert_eq!(AppError::InvalidCredentials.code(), 401);
        assert_eq!(AppError::InvalidToken.code(), 401);
        assert_eq!(AppError::InvalidSession.code(), 401);
        assert_eq!(AppError::WeakCredential("short".to_string()).code(), 400);
        assert_eq!(AppError::Forbidden.code(), 403);
        assert_eq!(AppError::NotFound("device".to_string()).code(), 404);
        assert_eq!(AppError::Validation("test".to_string()).code(), 400);
        assert_eq!(AppError::RateLimitExceeded { retry_after_secs: 5 }.code(), 429);
    }

    #[test]
    fn test_user_message_no_sensitive_info() {
        let error = AppError::Database(sqlx::Error::RowNotFound);
        let message = error.user_message();
        assert_eq!(message, "Database error occurred");
        assert!(!message.contains("sqlx"));

        let error = AppError::Store(StoreError::Unavailable("connection refused".to_string()));
        assert!(!error.user_message().contains("connection refused"));
    }

    #[test]
    fn test_rate_limit_response_has_retry_after() {
        let response = AppError::RateLimitExceeded { retry_after_secs: 42 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "42");
    }
}
