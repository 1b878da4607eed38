//! Security domain models: audit events and risk signals

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Security event severity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "security_severity", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// Security event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityEventType {
    Registration,
    LoginSuccess,
    LoginFailure,
    Logout,
    FraudBlocked,
    SuspiciousActivity,
    BlacklistedIp,
    PasswordChanged,
    AccountDeactivated,
    TokenRefreshRejected,
    DeviceTrusted,
    BlacklistChanged,
    RateLimitRuleChanged,
}

impl SecurityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::Registration => "registration",
            SecurityEventType::LoginSuccess => "login_success",
            SecurityEventType::LoginFailure => "login_failure",
            SecurityEventType::Logout => "logout",
            SecurityEventType::FraudBlocked => "fraud_blocked",
            SecurityEventType::SuspiciousActivity => "suspicious_activity",
            SecurityEventType::BlacklistedIp => "blacklisted_ip",
            SecurityEventType::PasswordChanged => "password_changed",
            SecurityEventType::AccountDeactivated => "account_deactivated",
            SecurityEventType::TokenRefreshRejected => "token_refresh_rejected",
            SecurityEventType::DeviceTrusted => "device_trusted",
            SecurityEventType::BlacklistChanged => "blacklist_changed",
            SecurityEventType::RateLimitRuleChanged => "rate_limit_rule_changed",
        }
    }
}

/// Append-only security audit record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub event_type: String,
    pub description: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: None,
            event_type: event_type.as_str().to_string(),
            description: description.into(),
            ip_address: None,
            user_agent: None,
            severity,
            created_at: Utc::now(),
        }
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_client(mut self, ip: &str, user_agent: &str) -> Self {
        self.ip_address = Some(ip.to_string());
        self.user_agent = Some(user_agent.to_string());
        self
    }
}

/// Security event filters
#[derive(Debug, Default, Deserialize)]
pub struct SecurityEventQuery {
    pub user_id: Option<Uuid>,
    pub limit: Option<i64>,
}

/// Login attempt record, append-only
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LoginAttempt {
    pub id: Uuid,
    pub email: String,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl LoginAttempt {
    pub fn succeeded(email: &str, ip: &str, user_agent: &str) -> Self {
        Self::build(email, ip, user_agent, true, None)
    }

    pub fn failed(email: &str, ip: &str, user_agent: &str, reason: &str) -> Self {
        Self::build(email, ip, user_agent, false, Some(reason.to_string()))
    }

    fn build(
        email: &str,
        ip: &str,
        user_agent: &str,
        success: bool,
        failure_reason: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.to_string(),
            ip_address: ip.to_string(),
            user_agent: Some(user_agent.to_string()),
            success,
            failure_reason,
            attempted_at: Utc::now(),
        }
    }
}

/// IP blacklist entry
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IpBlacklistEntry {
    pub id: Uuid,
    pub ip_address: String,
    pub reason: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl IpBlacklistEntry {
    /// Active and not past its expiry
    pub fn is_in_effect(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |at| at > now)
    }
}

/// New blacklist entry; re-blacklisting an IP reactivates its row
#[derive(Debug, Clone)]
pub struct NewBlacklistEntry {
    pub ip_address: String,
    pub reason: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Blacklist request
#[derive(Debug, Deserialize, Validate)]
pub struct BlacklistIpRequest {
    #[validate(length(min = 1, max = 45))]
    pub ip_address: String,
    #[validate(length(min = 1, max = 255))]
    pub reason: String,
    /// Lifetime in seconds, at most ten years; None means permanent
    #[validate(range(min = 1, max = 315360000))]
    pub expires_in_secs: Option<i64>,
}

/// Rate limit rule
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RateLimitRule {
    pub id: Uuid,
    pub name: String,
    pub resource: String,
    pub max_requests: i32,
    pub window_seconds: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create rate limit rule request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateRateLimitRuleRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[validate(length(min = 1, max = 255))]
    pub resource: String,
    #[validate(range(min = 1))]
    pub max_requests: i32,
    #[validate(range(min = 1, max = 86400))]
    pub window_seconds: i32,
}

/// Update rate limit rule request
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateRateLimitRuleRequest {
    #[validate(length(min = 1, max = 255))]
    pub resource: Option<String>,
    #[validate(range(min = 1))]
    pub max_requests: Option<i32>,
    #[validate(range(min = 1, max = 86400))]
    pub window_seconds: Option<i32>,
    pub is_active: Option<bool>,
}
