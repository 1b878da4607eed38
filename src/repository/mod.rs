//! Repository layer
//!
//! One capability trait per entity group. Services only see the traits, so the
//! PostgreSQL implementation and the in-memory implementation are
//! interchangeable.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryRepository;
pub use postgres::PgRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{
        auth::RefreshToken,
        security::{
            CreateRateLimitRuleRequest, IpBlacklistEntry, LoginAttempt, NewBlacklistEntry,
            RateLimitRule, SecurityEvent, UpdateRateLimitRuleRequest,
        },
        session::{DeviceFingerprint, UserSession},
        user::{Credential, NewAccount, User},
    },
};

// ==================== Accounts ====================

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, AppError>;

    /// 只更新提供的字段，用户不存在时返回 None
    async fn update_profile(
        &self,
        user_id: Uuid,
        name: Option<&str>,
        age: Option<i32>,
    ) -> Result<Option<User>, AppError>;
}

#[async_trait]
pub trait CredentialRepository: Send + Sync {
    /// 在同一事务内创建用户、凭据和默认角色绑定
    ///
    /// 邮箱已存在时返回 `AppError::AlreadyExists`。
    async fn create_account(&self, account: &NewAccount) -> Result<User, AppError>;

    async fn find_credential_by_email(&self, email: &str) -> Result<Option<Credential>, AppError>;

    async fn find_credential_by_user(&self, user_id: Uuid) -> Result<Option<Credential>, AppError>;

    async fn update_password_hash(&self, user_id: Uuid, password_hash: &str)
        -> Result<bool, AppError>;

    async fn record_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), AppError>;

    async fn set_active(&self, user_id: Uuid, active: bool) -> Result<bool, AppError>;
}

#[async_trait]
pub trait RoleRepository: Send + Sync {
    async fn role_names_for_user(&self, user_id: Uuid) -> Result<Vec<String>, AppError>;

    /// 绑定角色，角色不存在时返回 NotFound，已绑定时返回 false
    async fn assign_role(&self, user_id: Uuid, role_name: &str) -> Result<bool, AppError>;
}

// ==================== Tokens ====================

#[async_trait]
pub trait RefreshTokenRepository: Send + Sync {
    async fn store_refresh_token(&self, token: &RefreshToken) -> Result<(), AppError>;

    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, AppError>;

    /// 比较并设置：仅当令牌尚未撤销时撤销，返回本次调用是否完成撤销
    async fn revoke_refresh_token(&self, token_id: Uuid) -> Result<bool, AppError>;

    async fn revoke_refresh_token_by_hash(
        &self,
        token_hash: &str,
        user_id: Uuid,
    ) -> Result<bool, AppError>;

    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64, AppError>;

    async fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64, AppError>;
}

// ==================== Risk Signals ====================

#[async_trait]
pub trait IpBlacklistRepository: Send + Sync {
    /// 新增或重新激活一个 IP 的黑名单记录
    async fn upsert_blacklist_entry(
        &self,
        entry: &NewBlacklistEntry,
    ) -> Result<IpBlacklistEntry, AppError>;

    async fn find_in_effect(
        &self,
        ip_address: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IpBlacklistEntry>, AppError>;

    async fn deactivate_blacklist_entry(&self, ip_address: &str) -> Result<bool, AppError>;

    async fn list_in_effect(&self, now: DateTime<Utc>) -> Result<Vec<IpBlacklistEntry>, AppError>;

    async fn deactivate_expired_entries(&self, now: DateTime<Utc>) -> Result<u64, AppError>;
}

#[async_trait]
pub trait LoginAttemptRepository: Send + Sync {
    async fn record_attempt(&self, attempt: &LoginAttempt) -> Result<(), AppError>;

    async fn count_failed_by_email_since(
        &self,
        email: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError>;

    async fn count_by_ip_since(&self, ip_address: &str, since: DateTime<Utc>)
        -> Result<i64, AppError>;

    async fn delete_attempts_before(&self, before: DateTime<Utc>) -> Result<u64, AppError>;
}

#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn find_device(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<DeviceFingerprint>, AppError>;

    /// 指纹是否登记在其他用户名下
    async fn fingerprint_owned_by_other(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<bool, AppError>;

    /// 存在则刷新 last_seen_at，否则以未信任状态新建
    async fn record_sighting(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        device_info: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DeviceFingerprint, AppError>;

    async fn mark_trusted(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<DeviceFingerprint>, AppError>;

    async fn list_devices(&self, user_id: Uuid) -> Result<Vec<DeviceFingerprint>, AppError>;
}

#[async_trait]
pub trait RateLimitRuleRepository: Send + Sync {
    /// 名称重复时返回 `AppError::AlreadyExists`
    async fn create_rule(&self, req: &CreateRateLimitRuleRequest)
        -> Result<RateLimitRule, AppError>;

    async fn update_rule(
        &self,
        id: Uuid,
        req: &UpdateRateLimitRuleRequest,
    ) -> Result<Option<RateLimitRule>, AppError>;

    async fn deactivate_rule(&self, id: Uuid) -> Result<bool, AppError>;

    /// 资源匹配的最近更新的启用规则
    async fn find_active_rule(&self, resource: &str) -> Result<Option<RateLimitRule>, AppError>;

    async fn list_rules(&self) -> Result<Vec<RateLimitRule>, AppError>;
}

// ==================== Sessions & Audit ====================

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create_session(&self, session: &UserSession) -> Result<(), AppError>;

    async fn find_session(&self, session_id: &str) -> Result<Option<UserSession>, AppError>;

    async fn deactivate_session(&self, session_id: &str) -> Result<bool, AppError>;

    async fn deactivate_user_sessions(&self, user_id: Uuid) -> Result<u64, AppError>;

    async fn deactivate_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, AppError>;
}

#[async_trait]
pub trait SecurityEventRepository: Send + Sync {
    async fn append_event(&self, event: &SecurityEvent) -> Result<(), AppError>;

    /// 按时间倒序
    async fn list_events(
        &self,
        user_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<SecurityEvent>, AppError>;

    async fn delete_events_before(&self, before: DateTime<Utc>) -> Result<u64, AppError>;
}

/// 所有仓储的集合，由服务层按需取用
#[derive(Clone)]
pub struct Repositories {
    pub users: Arc<dyn UserRepository>,
    pub credentials: Arc<dyn CredentialRepository>,
    pub roles: Arc<dyn RoleRepository>,
    pub refresh_tokens: Arc<dyn RefreshTokenRepository>,
    pub blacklist: Arc<dyn IpBlacklistRepository>,
    pub login_attempts: Arc<dyn LoginAttemptRepository>,
    pub devices: Arc<dyn DeviceRepository>,
    pub rate_limit_rules: Arc<dyn RateLimitRuleRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    pub security_events: Arc<dyn SecurityEventRepository>,
}

/// 同时实现全部仓储能力的存储
pub trait RepositoryBackend:
    UserRepository
    + CredentialRepository
    + RoleRepository
    + RefreshTokenRepository
    + IpBlacklistRepository
    + LoginAttemptRepository
    + DeviceRepository
    + RateLimitRuleRepository
    + SessionRepository
    + SecurityEventRepository
    + 'static
{
}

impl<T> RepositoryBackend for T where
    T: UserRepository
        + CredentialRepository
        + RoleRepository
        + RefreshTokenRepository
        + IpBlacklistRepository
        + LoginAttemptRepository
        + DeviceRepository
        + RateLimitRuleRepository
        + SessionRepository
        + SecurityEventRepository
        + 'static
{
}

impl Repositories {
    pub fn postgres(db: PgPool) -> Self {
        Self::from_backend(Arc::new(PgRepository::new(db)))
    }

    pub fn in_memory() -> Self {
        Self::from_backend(Arc::new(InMemoryRepository::new()))
    }

    pub fn from_backend<B: RepositoryBackend>(backend: Arc<B>) -> Self {
        Self {
            users: backend.clone(),
            credentials: backend.clone(),
            roles: backend.clone(),
            refresh_tokens: backend.clone(),
            blacklist: backend.clone(),
            login_attempts: backend.clone(),
            devices: backend.clone(),
            rate_limit_rules: backend.clone(),
            sessions: backend.clone(),
            security_events: backend,
        }
    }
}
