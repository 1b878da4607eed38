//! 凭据服务：注册、登录校验、修改密码、个人资料

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::password::{PasswordHasher, PasswordPolicy},
    error::AppError,
    models::{
        role::DEFAULT_ROLE,
        user::{Credential, NewAccount, RegisterRequest, UpdateProfileRequest, User},
    },
    repository::{CredentialRepository, Repositories, RoleRepository, UserRepository},
    services::token_service::TokenService,
};

/// 登录失败的内部原因，只用于审计，对外统一为 InvalidCredentials
#[derive(Debug)]
pub enum LoginFailure {
    UnknownEmail,
    AccountDisabled,
    PasswordMismatch,
    Internal(AppError),
}

impl LoginFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            LoginFailure::UnknownEmail => "unknown_email",
            LoginFailure::AccountDisabled => "account_disabled",
            LoginFailure::PasswordMismatch => "invalid_password",
            LoginFailure::Internal(_) => "internal_error",
        }
    }

    pub fn into_error(self) -> AppError {
        match self {
            LoginFailure::Internal(e) => e,
            _ => AppError::InvalidCredentials,
        }
    }
}

impl From<AppError> for LoginFailure {
    fn from(e: AppError) -> Self {
        LoginFailure::Internal(e)
    }
}

/// 邮箱统一去空格并转小写
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub struct CredentialService {
    users: Arc<dyn UserRepository>,
    credentials: Arc<dyn CredentialRepository>,
    roles: Arc<dyn RoleRepository>,
    tokens: Arc<TokenService>,
    hasher: Arc<PasswordHasher>,
    policy: PasswordPolicy,
}

impl CredentialService {
    pub fn new(
        repos: &Repositories,
        tokens: Arc<TokenService>,
        hasher: Arc<PasswordHasher>,
        policy: PasswordPolicy,
    ) -> Self {
        Self {
            users: repos.users.clone(),
            credentials: repos.credentials.clone(),
            roles: repos.roles.clone(),
            tokens,
            hasher,
            policy,
        }
    }

    /// 注册新账户
    ///
    /// 密码策略最先检查，任何持久化之前拒绝弱密码。
    pub async fn register(&self, req: RegisterRequest) -> Result<User, AppError> {
        self.policy.validate(&req.password)?;

        if req.email.trim().is_empty() {
            return Err(AppError::Validation("email is required".to_string()));
        }

        let req = RegisterRequest {
            email: normalize_email(&req.email),
            name: req.name.trim().to_string(),
            ..req
        };
        req.validate()?;

        let password_hash = self.hasher.hash(&req.password)?;

        let user = self
            .credentials
            .create_account(&NewAccount {
                name: req.name,
                email: req.email,
                age: req.age.unwrap_or(0),
                password_hash,
                default_role: DEFAULT_ROLE.to_string(),
            })
            .await?;

        tracing::info!(user_id = %user.id, "Account registered");

        Ok(user)
    }

    /// 按邮箱查找用户 ID，只用于风险信号，查询失败视为未知
    pub async fn lookup_user_id(&self, email: &str) -> Option<Uuid> {
        match self.credentials.find_credential_by_email(email).await {
            Ok(credential) => credential.map(|c| c.user_id),
            Err(e) => {
                tracing::warn!(error = %e, "Credential lookup for risk signals failed");
                None
            }
        }
    }

    /// 校验登录，返回内部失败原因
    pub async fn check_login(
        &self,
        email: &str,
        password: &str,
    ) -> Result<(Credential, Vec<String>), LoginFailure> {
        let email = normalize_email(email);

        let Some(credential) = self.credentials.find_credential_by_email(&email).await? else {
            self.hasher.verify_dummy(password);
            return Err(LoginFailure::UnknownEmail);
        };

        if !credential.is_active {
            self.hasher.verify_dummy(password);
            return Err(LoginFailure::AccountDisabled);
        }

        if !self.hasher.verify(password, &credential.password_hash)? {
            return Err(LoginFailure::PasswordMismatch);
        }

        let now = Utc::now();
        self.credentials
            .record_login(credential.user_id, now)
            .await?;

        let roles = self.roles.role_names_for_user(credential.user_id).await?;

        Ok((
            Credential {
                last_login_at: Some(now),
                ..credential
            },
            roles,
        ))
    }

    /// 修改密码，成功后撤销该用户全部刷新令牌
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AppError> {
        self.policy.validate(new_password)?;

        let credential = self
            .credentials
            .find_credential_by_user(user_id)
            .await?
            .filter(|c| c.is_active)
            .ok_or(AppError::InvalidCredentials)?;

        if !self
            .hasher
            .verify(current_password, &credential.password_hash)?
        {
            return Err(AppError::InvalidCredentials);
        }

        let password_hash = self.hasher.hash(new_password)?;
        self.credentials
            .update_password_hash(user_id, &password_hash)
            .await?;

        let revoked = self.tokens.revoke_all_refresh_tokens(user_id).await?;
        tracing::info!(user_id = %user_id, revoked_tokens = revoked, "Password changed");

        Ok(())
    }

    pub async fn get_profile(&self, user_id: Uuid) -> Result<(User, Vec<String>), AppError> {
        let user = self
            .users
            .find_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("User".to_string()))?;
        let roles = self.roles.role_names_for_user(user_id).await?;

        Ok((user, roles))
    }

    pub async fn update_profile(
        &self,
        user_id: Uuid,
        req: UpdateProfileRequest,
    ) -> Result<User, AppError> {
        let req = UpdateProfileRequest {
            name: req.name.map(|n| n.trim().to_string()),
            ..req
        };
        req.validate()?;

        self.users
            .update_profile(user_id, req.name.as_deref(), req.age)
            .await?
            .ok_or_else(|| AppError::NotFound("User".to_string()))
    }

    /// 停用账户并撤销全部刷新令牌
    pub async fn deactivate_account(&self, user_id: Uuid) -> Result<(), AppError> {
        if !self.credentials.set_active(user_id, false).await? {
            return Err(AppError::NotFound("User".to_string()));
        }

        self.tokens.revoke_all_refresh_tokens(user_id).await?;

        Ok(())
    }
}
