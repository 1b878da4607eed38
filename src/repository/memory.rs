//! In-memory repository
//!
//! Used by the test suite and by `database.backend = memory` for local
//! development. All tables sit behind one lock, so multi-row writes such as
//! account creation are atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    CredentialRepository, DeviceRepository, IpBlacklistRepository, LoginAttemptRepository,
    RateLimitRuleRepository, RefreshTokenRepository, RoleRepository, SecurityEventRepository,
    SessionRepository, UserRepository,
};
use crate::{
    error::AppError,
    models::{
        auth::RefreshToken,
        role::{Role, ADMIN_ROLE, DEFAULT_ROLE},
        security::{
            CreateRateLimitRuleRequest, IpBlacklistEntry, LoginAttempt, NewBlacklistEntry,
            RateLimitRule, SecurityEvent, UpdateRateLimitRuleRequest,
        },
        session::{DeviceFingerprint, UserSession},
        user::{Credential, NewAccount, User},
    },
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    credentials: HashMap<Uuid, Credential>,
    roles: Vec<Role>,
    user_roles: Vec<(Uuid, Uuid)>,
    refresh_tokens: Vec<RefreshToken>,
    blacklist: Vec<IpBlacklistEntry>,
    login_attempts: Vec<LoginAttempt>,
    devices: Vec<DeviceFingerprint>,
    rate_limit_rules: Vec<RateLimitRule>,
    sessions: Vec<UserSession>,
    security_events: Vec<SecurityEvent>,
}

pub struct InMemoryRepository {
    tables: RwLock<Tables>,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepository {
    /// 预置 user / admin 两个系统角色
    pub fn new() -> Self {
        let now = Utc::now();
        let roles = [
            (DEFAULT_ROLE, "Default role for registered accounts"),
            (ADMIN_ROLE, "Security administrator"),
        ]
        .into_iter()
        .map(|(name, description)| Role {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: Some(description.to_string()),
            created_at: now,
        })
        .collect();

        Self {
            tables: RwLock::new(Tables {
                roles,
                ..Tables::default()
            }),
        }
    }
}

// ==================== Accounts ====================

#[async_trait]
impl UserRepository for InMemoryRepository {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, AppError> {
        Ok(self.tables.read().await.users.get(&user_id).cloned())
    }

    async fn update_profile(
        &self,
        user_id: Uuid,
        name: Option<&str>,
        age: Option<i32>,
    ) -> Result<Option<User>, AppError> {
        let mut tables = self.tables.write().await;
        let Some(user) = tables.users.get_mut(&user_id) else {
            return Ok(None);
        };

        if let Some(name) = name {
            user.name = name.to_string();
        }
        if let Some(age) = age {
            user.age = age;
        }
        user.updated_at = Utc::now();

        Ok(Some(user.clone()))
    }
}

#[async_trait]
impl CredentialRepository for InMemoryRepository {
    async fn create_account(&self, account: &NewAccount) -> Result<User, AppError> {
        let mut tables = self.tables.write().await;

        if tables.credentials.values().any(|c| c.email == account.email) {
            return Err(AppError::AlreadyExists);
        }

        let role_id = tables
            .roles
            .iter()
            .find(|r| r.name == account.default_role)
            .map(|r| r.id)
            .ok_or_else(|| AppError::Internal(format!("role {} missing", account.default_role)))?;

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            name: account.name.clone(),
            email: account.email.clone(),
            age: account.age,
            created_at: now,
            updated_at: now,
        };

        tables.credentials.insert(
            user.id,
            Credential {
                user_id: user.id,
                email: account.email.clone(),
                password_hash: account.password_hash.clone(),
                is_active: true,
                last_login_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        tables.user_roles.push((user.id, role_id));
        tables.users.insert(user.id, user.clone());

        Ok(user)
    }

    async fn find_credential_by_email(&self, email: &str) -> Result<Option<Credential>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .credentials
            .values()
            .find(|c| c.email == email)
            .cloned())
    }

    async fn find_credential_by_user(&self, user_id: Uuid) -> Result<Option<Credential>, AppError> {
        Ok(self.tables.read().await.credentials.get(&user_id).cloned())
    }

    async fn update_password_hash(
        &self,
        user_id: Uuid,
        password_hash: &str,
    ) -> Result<bool, AppError> {
        let mut tables = self.tables.write().await;
        match tables.credentials.get_mut(&user_id) {
            Some(credential) => {
                credential.password_hash = password_hash.to_string();
                credential.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        if let Some(credential) = self.tables.write().await.credentials.get_mut(&user_id) {
            credential.last_login_at = Some(at);
        }
        Ok(())
    }

    async fn set_active(&self, user_id: Uuid, active: bool) -> Result<bool, AppError> {
        let mut tables = self.tables.write().await;
        match tables.credentials.get_mut(&user_id) {
            Some(credential) => {
                credential.is_active = active;
                credential.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl RoleRepository for InMemoryRepository {
    async fn role_names_for_user(&self, user_id: Uuid) -> Result<Vec<String>, AppError> {
        let tables = self.tables.read().await;
        let mut names: Vec<String> = tables
            .user_roles
            .iter()
            .filter(|(uid, _)| *uid == user_id)
            .filter_map(|(_, role_id)| tables.roles.iter().find(|r| r.id == *role_id))
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn assign_role(&self, user_id: Uuid, role_name: &str) -> Result<bool, AppError> {
        let mut tables = self.tables.write().await;
        let role_id = tables
            .roles
            .iter()
            .find(|r| r.name == role_name)
            .map(|r| r.id)
            .ok_or_else(|| AppError::NotFound("Role".to_string()))?;

        if tables.user_roles.contains(&(user_id, role_id)) {
            return Ok(false);
        }
        tables.user_roles.push((user_id, role_id));
        Ok(true)
    }
}

// ==================== Tokens ====================

#[async_trait]
impl RefreshTokenRepository for InMemoryRepository {
    async fn store_refresh_token(&self, token: &RefreshToken) -> Result<(), AppError> {
        self.tables.write().await.refresh_tokens.push(token.clone());
        Ok(())
    }

    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .refresh_tokens
            .iter()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn revoke_refresh_token(&self, token_id: Uuid) -> Result<bool, AppError> {
        let mut tables = self.tables.write().await;
        match tables
            .refresh_tokens
            .iter_mut()
            .find(|t| t.id == token_id && t.revoked_at.is_none())
        {
            Some(token) => {
                token.revoked_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke_refresh_token_by_hash(
        &self,
        token_hash: &str,
        user_id: Uuid,
    ) -> Result<bool, AppError> {
        let mut tables = self.tables.write().await;
        match tables.refresh_tokens.iter_mut().find(|t| {
            t.token_hash == token_hash && t.user_id == user_id && t.revoked_at.is_none()
        }) {
            Some(token) => {
                token.revoked_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64, AppError> {
        let now = Utc::now();
        let mut count = 0;
        for token in self
            .tables
            .write()
            .await
            .refresh_tokens
            .iter_mut()
            .filter(|t| t.user_id == user_id && t.revoked_at.is_none())
        {
            token.revoked_at = Some(now);
            count += 1;
        }
        Ok(count)
    }

    async fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut tables = self.tables.write().await;
        let before = tables.refresh_tokens.len();
        tables.refresh_tokens.retain(|t| t.expires_at > now);
        Ok((before - tables.refresh_tokens.len()) as u64)
    }
}

// ==================== Risk Signals ====================

#[async_trait]
impl IpBlacklistRepository for InMemoryRepository {
    async fn upsert_blacklist_entry(
        &self,
        entry: &NewBlacklistEntry,
    ) -> Result<IpBlacklistEntry, AppError> {
        let mut tables = self.tables.write().await;

        if let Some(existing) = tables
            .blacklist
            .iter_mut()
            .find(|e| e.ip_address == entry.ip_address)
        {
            existing.reason = entry.reason.clone();
            existing.expires_at = entry.expires_at;
            existing.is_active = true;
            return Ok(existing.clone());
        }

        let created = IpBlacklistEntry {
            id: Uuid::new_v4(),
            ip_address: entry.ip_address.clone(),
            reason: entry.reason.clone(),
            expires_at: entry.expires_at,
            is_active: true,
            created_at: Utc::now(),
        };
        tables.blacklist.push(created.clone());
        Ok(created)
    }

    async fn find_in_effect(
        &self,
        ip_address: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IpBlacklistEntry>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .blacklist
            .iter()
            .find(|e| e.ip_address == ip_address && e.is_in_effect(now))
            .cloned())
    }

    async fn deactivate_blacklist_entry(&self, ip_address: &str) -> Result<bool, AppError> {
        let mut tables = self.tables.write().await;
        match tables
            .blacklist
            .iter_mut()
            .find(|e| e.ip_address == ip_address && e.is_active)
        {
            Some(entry) => {
                entry.is_active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_in_effect(&self, now: DateTime<Utc>) -> Result<Vec<IpBlacklistEntry>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .blacklist
            .iter()
            .filter(|e| e.is_in_effect(now))
            .cloned()
            .collect())
    }

    async fn deactivate_expired_entries(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut count = 0;
        for entry in self.tables.write().await.blacklist.iter_mut().filter(|e| {
            e.is_active && e.expires_at.is_some_and(|at| at <= now)
        }) {
            entry.is_active = false;
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait]
impl LoginAttemptRepository for InMemoryRepository {
    async fn record_attempt(&self, attempt: &LoginAttempt) -> Result<(), AppError> {
        self.tables.write().await.login_attempts.push(attempt.clone());
        Ok(())
    }

    async fn count_failed_by_email_since(
        &self,
        email: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .login_attempts
            .iter()
            .filter(|a| a.email == email && !a.success && a.attempted_at >= since)
            .count() as i64)
    }

    async fn count_by_ip_since(
        &self,
        ip_address: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .login_attempts
            .iter()
            .filter(|a| a.ip_address == ip_address && a.attempted_at >= since)
            .count() as i64)
    }

    async fn delete_attempts_before(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let mut tables = self.tables.write().await;
        let count = tables.login_attempts.len();
        tables.login_attempts.retain(|a| a.attempted_at >= before);
        Ok((count - tables.login_attempts.len()) as u64)
    }
}

#[async_trait]
impl DeviceRepository for InMemoryRepository {
    async fn find_device(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<DeviceFingerprint>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .devices
            .iter()
            .find(|d| d.user_id == user_id && d.fingerprint == fingerprint)
            .cloned())
    }

    async fn fingerprint_owned_by_other(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<bool, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .devices
            .iter()
            .any(|d| d.user_id != user_id && d.fingerprint == fingerprint))
    }

    async fn record_sighting(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        device_info: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DeviceFingerprint, AppError> {
        let mut tables = self.tables.write().await;

        if let Some(device) = tables
            .devices
            .iter_mut()
            .find(|d| d.user_id == user_id && d.fingerprint == fingerprint)
        {
            device.last_seen_at = now;
            if let Some(info) = device_info {
                device.device_info = Some(info.to_string());
            }
            return Ok(device.clone());
        }

        let device = DeviceFingerprint {
            id: Uuid::new_v4(),
            user_id,
            fingerprint: fingerprint.to_string(),
            device_info: device_info.map(str::to_string),
            is_trusted: false,
            first_seen_at: now,
            last_seen_at: now,
        };
        tables.devices.push(device.clone());
        Ok(device)
    }

    async fn mark_trusted(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<DeviceFingerprint>, AppError> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .devices
            .iter_mut()
            .find(|d| d.user_id == user_id && d.fingerprint == fingerprint)
            .map(|device| {
                device.is_trusted = true;
                device.clone()
            }))
    }

    async fn list_devices(&self, user_id: Uuid) -> Result<Vec<DeviceFingerprint>, AppError> {
        let mut devices: Vec<DeviceFingerprint> = self
            .tables
            .read()
            .await
            .devices
            .iter()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        devices.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        Ok(devices)
    }
}

#[async_trait]
impl RateLimitRuleRepository for InMemoryRepository {
    async fn create_rule(
        &self,
        req: &CreateRateLimitRuleRequest,
    ) -> Result<RateLimitRule, AppError> {
        let mut tables = self.tables.write().await;

        if tables.rate_limit_rules.iter().any(|r| r.name == req.name) {
            return Err(AppError::AlreadyExists);
        }

        let now = Utc::now();
        let rule = RateLimitRule {
            id: Uuid::new_v4(),
            name: req.name.clone(),
            resource: req.resource.clone(),
            max_requests: req.max_requests,
            window_seconds: req.window_seconds,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        tables.rate_limit_rules.push(rule.clone());
        Ok(rule)
    }

    async fn update_rule(
        &self,
        id: Uuid,
        req: &UpdateRateLimitRuleRequest,
    ) -> Result<Option<RateLimitRule>, AppError> {
        let mut tables = self.tables.write().await;
        let Some(rule) = tables.rate_limit_rules.iter_mut().find(|r| r.id == id) else {
            return Ok(None);
        };

        if let Some(resource) = &req.resource {
            rule.resource = resource.clone();
        }
        if let Some(max_requests) = req.max_requests {
            rule.max_requests = max_requests;
        }
        if let Some(window_seconds) = req.window_seconds {
            rule.window_seconds = window_seconds;
        }
        if let Some(is_active) = req.is_active {
            rule.is_active = is_active;
        }
        rule.updated_at = Utc::now();

        Ok(Some(rule.clone()))
    }

    async fn deactivate_rule(&self, id: Uuid) -> Result<bool, AppError> {
        let mut tables = self.tables.write().await;
        match tables.rate_limit_rules.iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                rule.is_active = false;
                rule.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_active_rule(&self, resource: &str) -> Result<Option<RateLimitRule>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .rate_limit_rules
            .iter()
            .filter(|r| r.is_active && r.resource == resource)
            .max_by_key(|r| r.updated_at)
            .cloned())
    }

    async fn list_rules(&self) -> Result<Vec<RateLimitRule>, AppError> {
        let mut rules = self.tables.read().await.rate_limit_rules.clone();
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rules)
    }
}

// ==================== Sessions & Audit ====================

#[async_trait]
impl SessionRepository for InMemoryRepository {
    async fn create_session(&self, session: &UserSession) -> Result<(), AppError> {
        let mut tables = self.tables.write().await;
        if tables
            .sessions
            .iter()
            .any(|s| s.session_id == session.session_id)
        {
            return Err(AppError::AlreadyExists);
        }
        tables.sessions.push(session.clone());
        Ok(())
    }

    async fn find_session(&self, session_id: &str) -> Result<Option<UserSession>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .sessions
            .iter()
            .find(|s| s.session_id == session_id)
            .cloned())
    }

    async fn deactivate_session(&self, session_id: &str) -> Result<bool, AppError> {
        let mut tables = self.tables.write().await;
        match tables
            .sessions
            .iter_mut()
            .find(|s| s.session_id == session_id && s.is_active)
        {
            Some(session) => {
                session.is_active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn deactivate_user_sessions(&self, user_id: Uuid) -> Result<u64, AppError> {
        let mut count = 0;
        for session in self
            .tables
            .write()
            .await
            .sessions
            .iter_mut()
            .filter(|s| s.user_id == user_id && s.is_active)
        {
            session.is_active = false;
            count += 1;
        }
        Ok(count)
    }

    async fn deactivate_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut count = 0;
        for session in self
            .tables
            .write()
            .await
            .sessions
            .iter_mut()
            .filter(|s| s.is_active && s.expires_at <= now)
        {
            session.is_active = false;
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait]
impl SecurityEventRepository for InMemoryRepository {
    async fn append_event(&self, event: &SecurityEvent) -> Result<(), AppError> {
        self.tables.write().await.security_events.push(event.clone());
        Ok(())
    }

    async fn list_events(
        &self,
        user_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<SecurityEvent>, AppError> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        let tables = self.tables.read().await;
        let mut events: Vec<SecurityEvent> = tables
            .security_events
            .iter()
            .filter(|e| user_id.map_or(true, |uid| e.user_id == Some(uid)))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        events.truncate(limit);
        Ok(events)
    }

    async fn delete_events_before(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let mut tables = self.tables.write().await;
        let count = tables.security_events.len();
        tables.security_events.retain(|e| e.created_at >= before);
        Ok((count - tables.security_events.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(email: &str) -> NewAccount {
        NewAccount {
            name: "Test".to_string(),
            email: email.to_string(),
            age: 0,
            password_hash: "hash".to_string(),
            default_role: DEFAULT_ROLE.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_account_assigns_default_role() {
        let repo = InMemoryRepository::new();
        let user = repo.create_account(&account("a@x.com")).await.unwrap();

        assert_eq!(repo.role_names_for_user(user.id).await.unwrap(), vec!["user"]);
        assert!(repo.find_credential_by_user(user.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_account_duplicate_email() {
        let repo = InMemoryRepository::new();
        repo.create_account(&account("a@x.com")).await.unwrap();

        let result = repo.create_account(&account("a@x.com")).await;
        assert!(matches!(result, Err(AppError::AlreadyExists)));
    }

    #[tokio::test]
    async fn test_revoke_refresh_token_is_compare_and_set() {
        let repo = InMemoryRepository::new();
        let now = Utc::now();
        let token = RefreshToken {
            id: Uuid::new_v4(),
            token_hash: "digest".to_string(),
            user_id: Uuid::new_v4(),
            expires_at: now + chrono::Duration::days(1),
            revoked_at: None,
            rotated_from: None,
            created_at: now,
        };
        repo.store_refresh_token(&token).await.unwrap();

        assert!(repo.revoke_refresh_token(token.id).await.unwrap());
        assert!(!repo.revoke_refresh_token(token.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_device_sighting_upserts() {
        let repo = InMemoryRepository::new();
        let user_id = Uuid::new_v4();
        let first = repo
            .record_sighting(user_id, "1.2.3.4_ua", None, Utc::now())
            .await
            .unwrap();
        let second = repo
            .record_sighting(user_id, "1.2.3.4_ua", Some("Firefox"), Utc::now())
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert!(!second.is_trusted);
        assert_eq!(repo.list_devices(user_id).await.unwrap().len(), 1);
    }
}
