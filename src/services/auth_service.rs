//! 认证流程编排
//!
//! 登录、注册、修改密码都先经过黑名单与欺诈评分，再做凭据检查。
//! 所有与风险相关的结果都回写到登录尝试、安全事件和设备记录。

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    auth::jwt::Claims,
    error::AppError,
    models::{
        auth::{ClientInfo, LoginRequest, LoginResponse, TokenPair},
        fraud::{FraudAnalysis, RiskLevel},
        security::{LoginAttempt, SecurityEvent, SecurityEventType, Severity},
        session::DeviceFingerprint,
        user::{RegisterRequest, User, UserResponse},
    },
    services::{
        audit_service::AuditService,
        credential_service::{normalize_email, CredentialService},
        fraud_service::FraudService,
        rate_limiter::RateLimiter,
        session_service::{device_fingerprint, SessionService},
        token_service::TokenService,
    },
};

/// 需要风险筛查的流程
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFlow {
    Login,
    Register,
    PasswordChange,
}

impl AuthFlow {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthFlow::Login => "login",
            AuthFlow::Register => "register",
            AuthFlow::PasswordChange => "password_change",
        }
    }

    /// 高风险拦截时对外返回的错误，与该流程的普通失败一致
    fn blocked_error(&self) -> AppError {
        match self {
            AuthFlow::Login => AppError::InvalidCredentials,
            AuthFlow::Register | AuthFlow::PasswordChange => AppError::Forbidden,
        }
    }
}

pub struct AuthService {
    credentials: Arc<CredentialService>,
    tokens: Arc<TokenService>,
    fraud: Arc<FraudService>,
    sessions: Arc<SessionService>,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<AuditService>,
    session_ttl: chrono::Duration,
}

impl AuthService {
    pub fn new(
        credentials: Arc<CredentialService>,
        tokens: Arc<TokenService>,
        fraud: Arc<FraudService>,
        sessions: Arc<SessionService>,
        rate_limiter: Arc<RateLimiter>,
        audit: Arc<AuditService>,
        session_ttl_secs: u64,
    ) -> Self {
        Self {
            credentials,
            tokens,
            fraud,
            sessions,
            rate_limiter,
            audit,
            session_ttl: chrono::Duration::seconds(session_ttl_secs as i64),
        }
    }

    /// 黑名单检查 + 欺诈评分
    ///
    /// HIGH 直接拦截，MEDIUM 记录事件后放行。
    pub async fn screen(
        &self,
        flow: AuthFlow,
        user_id: Option<Uuid>,
        email: &str,
        client: &ClientInfo,
    ) -> Result<FraudAnalysis, AppError> {
        if self.rate_limiter.check_blacklist(&client.ip).await {
            tracing::warn!(ip = %client.ip, flow = flow.as_str(), "Request from blacklisted IP");
            self.audit
                .record_event(self.event(
                    SecurityEventType::BlacklistedIp,
                    Severity::High,
                    format!("{} attempt from blacklisted IP", flow.as_str()),
                    user_id,
                    client,
                ))
                .await;
            self.audit
                .record_attempt(LoginAttempt::failed(
                    email,
                    &client.ip,
                    &client.user_agent,
                    "ip_blacklisted",
                ))
                .await;
            return Err(AppError::Forbidden);
        }

        let analysis = self
            .fraud
            .analyze(user_id, email, &client.ip, &client.user_agent)
            .await;

        match analysis.risk_level {
            RiskLevel::High => {
                metrics::counter!("fraud_blocked_total", "flow" => flow.as_str()).increment(1);
                tracing::warn!(
                    ip = %client.ip,
                    flow = flow.as_str(),
                    score = analysis.risk_score,
                    "High fraud risk, request blocked"
                );
                self.audit
                    .record_event(self.event(
                        SecurityEventType::FraudBlocked,
                        Severity::High,
                        format!(
                            "{} blocked (score {:.2}): {}",
                            flow.as_str(),
                            analysis.risk_score,
                            analysis.factors.join(", ")
                        ),
                        user_id,
                        client,
                    ))
                    .await;
                self.audit
                    .record_attempt(LoginAttempt::failed(
                        email,
                        &client.ip,
                        &client.user_agent,
                        "high_fraud_risk",
                    ))
                    .await;
                Err(flow.blocked_error())
            }
            RiskLevel::Medium => {
                self.audit
                    .record_event(self.event(
                        SecurityEventType::SuspiciousActivity,
                        Severity::Medium,
                        format!(
                            "{} with elevated risk (score {:.2}): {}",
                            flow.as_str(),
                            analysis.risk_score,
                            analysis.factors.join(", ")
                        ),
                        user_id,
                        client,
                    ))
                    .await;
                Ok(analysis)
            }
            RiskLevel::Low => Ok(analysis),
        }
    }

    fn event(
        &self,
        event_type: SecurityEventType,
        severity: Severity,
        description: String,
        user_id: Option<Uuid>,
        client: &ClientInfo,
    ) -> SecurityEvent {
        let event = SecurityEvent::new(event_type, severity, description)
            .with_client(&client.ip, &client.user_agent);
        match user_id {
            Some(user_id) => event.with_user(user_id),
            None => event,
        }
    }

    /// 注册
    pub async fn register(&self, req: RegisterRequest, client: &ClientInfo) -> Result<User, AppError> {
        let email = normalize_email(&req.email);
        self.screen(AuthFlow::Register, None, &email, client).await?;

        let user = self.credentials.register(req).await?;

        self.audit
            .record_event(self.event(
                SecurityEventType::Registration,
                Severity::Low,
                "account registered".to_string(),
                Some(user.id),
                client,
            ))
            .await;

        Ok(user)
    }

    /// 登录
    pub async fn login(&self, req: LoginRequest, client: &ClientInfo) -> Result<LoginResponse, AppError> {
        let email = normalize_email(&req.email);
        let known_user = self.credentials.lookup_user_id(&email).await;

        let analysis = self
            .screen(AuthFlow::Login, known_user, &email, client)
            .await?;

        let (credential, roles) = match self.credentials.check_login(&email, &req.password).await {
            Ok(found) => found,
            Err(failure) => {
                tracing::info!(ip = %client.ip, reason = failure.reason(), "Login failed");
                self.audit
                    .record_attempt(LoginAttempt::failed(
                        &email,
                        &client.ip,
                        &client.user_agent,
                        failure.reason(),
                    ))
                    .await;
                self.audit
                    .record_event(self.event(
                        SecurityEventType::LoginFailure,
                        Severity::Low,
                        format!("login failed: {}", failure.reason()),
                        known_user,
                        client,
                    ))
                    .await;
                return Err(failure.into_error());
            }
        };

        let user_id = credential.user_id;
        self.audit
            .record_attempt(LoginAttempt::succeeded(&email, &client.ip, &client.user_agent))
            .await;

        let fingerprint = device_fingerprint(&client.ip, &client.user_agent);
        if let Err(e) = self
            .sessions
            .record_device(user_id, &fingerprint, Some(&client.user_agent))
            .await
        {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to record device");
        }

        let (user, _) = self.credentials.get_profile(user_id).await?;
        let tokens = self.tokens.issue_token_pair(&credential, roles).await?;
        let session = self
            .sessions
            .create_session(
                user_id,
                &client.ip,
                &client.user_agent,
                Utc::now() + self.session_ttl,
            )
            .await?;

        self.audit
            .record_event(self.event(
                SecurityEventType::LoginSuccess,
                Severity::Low,
                format!("login succeeded (risk {})", analysis.risk_level.as_str()),
                Some(user_id),
                client,
            ))
            .await;

        tracing::info!(user_id = %user_id, "User logged in");

        Ok(LoginResponse {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            token_type: tokens.token_type,
            expires_in: tokens.expires_in,
            session_id: session.session_id,
            risk_level: analysis.risk_level,
            user: UserResponse::from(user),
        })
    }

    /// 刷新令牌
    pub async fn refresh(&self, refresh_token: &str, client: &ClientInfo) -> Result<TokenPair, AppError> {
        match self.tokens.refresh(refresh_token).await {
            Ok(pair) => Ok(pair),
            Err(AppError::InvalidToken) => {
                self.audit
                    .record_event(self.event(
                        SecurityEventType::TokenRefreshRejected,
                        Severity::Medium,
                        "refresh token rejected".to_string(),
                        None,
                        client,
                    ))
                    .await;
                Err(AppError::InvalidToken)
            }
            Err(e) => Err(e),
        }
    }

    /// 登出：访问令牌拉黑、刷新令牌撤销、会话停用
    pub async fn logout(
        &self,
        claims: &Claims,
        refresh_token: Option<&str>,
        session_id: Option<&str>,
        client: &ClientInfo,
    ) -> Result<(), AppError> {
        let user_id = claims.user_id()?;

        if let Err(e) = self.tokens.revoke_access_token(claims).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to blacklist access token");
        }

        if let Some(token) = refresh_token {
            self.tokens.revoke_refresh_token(user_id, token).await?;
        }

        if let Some(session_id) = session_id {
            match self.sessions.validate_session(session_id).await {
                Ok(session) if session.user_id == user_id => {
                    self.sessions.deactivate_session(session_id).await?;
                }
                Ok(_) => {
                    tracing::warn!(user_id = %user_id, "Logout with a session of another user");
                }
                Err(_) => {}
            }
        }

        self.audit
            .record_event(self.event(
                SecurityEventType::Logout,
                Severity::Low,
                "logged out".to_string(),
                Some(user_id),
                client,
            ))
            .await;

        Ok(())
    }

    /// 修改密码
    pub async fn change_password(
        &self,
        claims: &Claims,
        current_password: &str,
        new_password: &str,
        client: &ClientInfo,
    ) -> Result<(), AppError> {
        let user_id = claims.user_id()?;
        self.screen(AuthFlow::PasswordChange, Some(user_id), &claims.email, client)
            .await?;

        self.credentials
            .change_password(user_id, current_password, new_password)
            .await?;

        self.audit
            .record_event(self.event(
                SecurityEventType::PasswordChanged,
                Severity::Medium,
                "password changed, refresh tokens revoked".to_string(),
                Some(user_id),
                client,
            ))
            .await;

        Ok(())
    }

    /// 停用账户：凭据停用、令牌撤销、会话停用
    pub async fn deactivate_account(&self, claims: &Claims, client: &ClientInfo) -> Result<(), AppError> {
        let user_id = claims.user_id()?;

        self.credentials.deactivate_account(user_id).await?;
        let sessions = self.sessions.deactivate_user_sessions(user_id).await?;

        if let Err(e) = self.tokens.revoke_access_token(claims).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to blacklist access token");
        }

        self.audit
            .record_event(self.event(
                SecurityEventType::AccountDeactivated,
                Severity::Medium,
                format!("account deactivated, {} sessions closed", sessions),
                Some(user_id),
                client,
            ))
            .await;

        Ok(())
    }

    /// 信任当前用户的设备
    pub async fn trust_device(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        client: &ClientInfo,
    ) -> Result<DeviceFingerprint, AppError> {
        let device = self.sessions.trust_device(user_id, fingerprint).await?;

        self.audit
            .record_event(self.event(
                SecurityEventType::DeviceTrusted,
                Severity::Low,
                format!("device {} trusted", device.id),
                Some(user_id),
                client,
            ))
            .await;

        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_error_per_flow() {
        assert!(matches!(
            AuthFlow::Login.blocked_error(),
            AppError::InvalidCredentials
        ));
        assert!(matches!(AuthFlow::Register.blocked_error(), AppError::Forbidden));
        assert!(matches!(
            AuthFlow::PasswordChange.blocked_error(),
            AppError::Forbidden
        ));
    }
}
