//! 令牌生命周期服务：访问令牌签发/校验/撤销，刷新令牌签发/轮换/撤销

use chrono::Utc;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

use crate::{
    auth::jwt::{Claims, JwtService},
    config::SecurityConfig,
    error::AppError,
    models::{
        auth::{RefreshToken, TokenPair},
        user::Credential,
    },
    repository::{CredentialRepository, RefreshTokenRepository, Repositories, RoleRepository},
    store::CounterStore,
};

const REFRESH_TOKEN_BYTES: usize = 32;

/// 轮换成功后的结果
#[derive(Debug)]
pub struct RotatedRefreshToken {
    pub credential: Credential,
    pub roles: Vec<String>,
    pub refresh_token: String,
}

pub struct TokenService {
    jwt: Arc<JwtService>,
    refresh_tokens: Arc<dyn RefreshTokenRepository>,
    credentials: Arc<dyn CredentialRepository>,
    roles: Arc<dyn RoleRepository>,
    store: Arc<dyn CounterStore>,
    refresh_token_ttl: chrono::Duration,
    blacklist_fails_closed: bool,
}

impl TokenService {
    pub fn new(
        jwt: Arc<JwtService>,
        repos: &Repositories,
        store: Arc<dyn CounterStore>,
        config: &SecurityConfig,
    ) -> Self {
        Self {
            jwt,
            refresh_tokens: repos.refresh_tokens.clone(),
            credentials: repos.credentials.clone(),
            roles: repos.roles.clone(),
            store,
            refresh_token_ttl: chrono::Duration::seconds(config.refresh_token_exp_secs as i64),
            blacklist_fails_closed: config.token_blacklist_fails_closed(),
        }
    }

    /// 刷新令牌只保存 SHA-256 摘要
    pub fn hash_token(token: &str) -> String {
        format!("{:x}", Sha256::digest(token.as_bytes()))
    }

    fn blacklist_key(jti: &str) -> String {
        format!("blacklist:token:{}", jti)
    }

    fn generate_opaque_token() -> String {
        let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    // ==================== Access Tokens ====================

    pub fn issue_access_token(
        &self,
        user_id: Uuid,
        email: &str,
        roles: Vec<String>,
    ) -> Result<String, AppError> {
        self.jwt.generate_access_token(&user_id, email, roles)
    }

    pub fn validate_access_token(&self, token: &str) -> Result<Claims, AppError> {
        self.jwt.validate_access_token(token)
    }

    /// 校验访问令牌并检查是否已被撤销
    pub async fn authenticate(&self, token: &str) -> Result<Claims, AppError> {
        let claims = self.validate_access_token(token)?;

        if self.is_access_token_revoked(&claims.jti).await {
            tracing::debug!(jti = %claims.jti, "Revoked access token presented");
            return Err(AppError::InvalidToken);
        }

        Ok(claims)
    }

    /// 将访问令牌加入黑名单，TTL 为令牌剩余寿命
    pub async fn revoke_access_token(&self, claims: &Claims) -> Result<(), AppError> {
        let remaining = claims.remaining_secs();
        if remaining == 0 {
            return Ok(());
        }

        self.store
            .set(
                &Self::blacklist_key(&claims.jti),
                1,
                Some(Duration::from_secs(remaining)),
            )
            .await?;

        Ok(())
    }

    /// 计数存储不可用时按 `token_blacklist_fail_mode` 处理
    pub async fn is_access_token_revoked(&self, jti: &str) -> bool {
        match self.store.exists(&Self::blacklist_key(jti)).await {
            Ok(revoked) => revoked,
            Err(e) => {
                metrics::counter!("counter_store_errors_total", "operation" => "token_blacklist")
                    .increment(1);
                tracing::warn!(
                    error = %e,
                    fail_closed = self.blacklist_fails_closed,
                    "Token blacklist check failed"
                );
                self.blacklist_fails_closed
            }
        }
    }

    // ==================== Refresh Tokens ====================

    async fn store_refresh_token(
        &self,
        user_id: Uuid,
        rotated_from: Option<Uuid>,
    ) -> Result<String, AppError> {
        let token = Self::generate_opaque_token();
        let now = Utc::now();

        let record = RefreshToken {
            id: Uuid::new_v4(),
            token_hash: Self::hash_token(&token),
            user_id,
            expires_at: now + self.refresh_token_ttl,
            revoked_at: None,
            rotated_from,
            created_at: now,
        };

        self.refresh_tokens.store_refresh_token(&record).await?;

        Ok(token)
    }

    /// 签发刷新令牌（随机不透明字符串）
    pub async fn issue_refresh_token(&self, user_id: Uuid) -> Result<String, AppError> {
        self.store_refresh_token(user_id, None).await
    }

    /// 签发访问令牌 + 刷新令牌
    pub async fn issue_token_pair(
        &self,
        credential: &Credential,
        roles: Vec<String>,
    ) -> Result<TokenPair, AppError> {
        let access_token = self.issue_access_token(credential.user_id, &credential.email, roles)?;
        let refresh_token = self.issue_refresh_token(credential.user_id).await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.jwt.access_token_exp_secs(),
        })
    }

    /// 轮换刷新令牌
    ///
    /// 撤销是比较并设置，只有赢得撤销的调用方才能签发新令牌；
    /// 撤销成功后签发失败按已登出处理。
    pub async fn rotate_refresh_token(
        &self,
        old_token: &str,
    ) -> Result<RotatedRefreshToken, AppError> {
        let record = self
            .refresh_tokens
            .find_refresh_token_by_hash(&Self::hash_token(old_token))
            .await?
            .ok_or_else(|| {
                tracing::debug!("Refresh token not found");
                AppError::InvalidToken
            })?;

        if !record.is_valid(Utc::now()) {
            tracing::debug!(token_id = %record.id, "Refresh token expired or revoked");
            return Err(AppError::InvalidToken);
        }

        let credential = self
            .credentials
            .find_credential_by_user(record.user_id)
            .await?
            .filter(|c| c.is_active)
            .ok_or_else(|| {
                tracing::debug!(user_id = %record.user_id, "Refresh for inactive account");
                AppError::InvalidToken
            })?;

        let roles = self.roles.role_names_for_user(record.user_id).await?;

        if !self.refresh_tokens.revoke_refresh_token(record.id).await? {
            tracing::debug!(token_id = %record.id, "Refresh token already consumed");
            return Err(AppError::InvalidToken);
        }

        let refresh_token = self
            .store_refresh_token(record.user_id, Some(record.id))
            .await
            .map_err(|e| {
                tracing::error!(
                    user_id = %record.user_id,
                    error = %e,
                    "Refresh token revoked but successor could not be stored"
                );
                AppError::InvalidToken
            })?;

        Ok(RotatedRefreshToken {
            credential,
            roles,
            refresh_token,
        })
    }

    /// 轮换刷新令牌并签发新的访问令牌
    pub async fn refresh(&self, old_token: &str) -> Result<TokenPair, AppError> {
        let rotated = self.rotate_refresh_token(old_token).await?;
        let access_token = self.issue_access_token(
            rotated.credential.user_id,
            &rotated.credential.email,
            rotated.roles,
        )?;

        Ok(TokenPair {
            access_token,
            refresh_token: rotated.refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.jwt.access_token_exp_secs(),
        })
    }

    /// 撤销用户的某个刷新令牌（登出）
    pub async fn revoke_refresh_token(&self, user_id: Uuid, token: &str) -> Result<bool, AppError> {
        self.refresh_tokens
            .revoke_refresh_token_by_hash(&Self::hash_token(token), user_id)
            .await
    }

    /// 撤销用户的所有刷新令牌
    pub async fn revoke_all_refresh_tokens(&self, user_id: Uuid) -> Result<u64, AppError> {
        self.refresh_tokens.revoke_all_for_user(user_id).await
    }
}
