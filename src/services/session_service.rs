//! 会话与设备信任服务，以及过期数据清理

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    config::MaintenanceConfig,
    error::AppError,
    models::session::{CleanupReport, DeviceFingerprint, UserSession},
    repository::{
        DeviceRepository, IpBlacklistRepository, LoginAttemptRepository, RefreshTokenRepository,
        Repositories, SecurityEventRepository, SessionRepository,
    },
    store::CounterStore,
};

/// 设备指纹：`ip + "_" + user_agent`
pub fn device_fingerprint(ip: &str, user_agent: &str) -> String {
    format!("{}_{}", ip, user_agent)
}

pub struct SessionService {
    sessions: Arc<dyn SessionRepository>,
    devices: Arc<dyn DeviceRepository>,
    blacklist: Arc<dyn IpBlacklistRepository>,
    attempts: Arc<dyn LoginAttemptRepository>,
    refresh_tokens: Arc<dyn RefreshTokenRepository>,
    events: Arc<dyn SecurityEventRepository>,
    store: Arc<dyn CounterStore>,
    maintenance: MaintenanceConfig,
}

impl SessionService {
    pub fn new(
        repos: &Repositories,
        store: Arc<dyn CounterStore>,
        maintenance: MaintenanceConfig,
    ) -> Self {
        Self {
            sessions: repos.sessions.clone(),
            devices: repos.devices.clone(),
            blacklist: repos.blacklist.clone(),
            attempts: repos.login_attempts.clone(),
            refresh_tokens: repos.refresh_tokens.clone(),
            events: repos.security_events.clone(),
            store,
            maintenance,
        }
    }

    // ==================== Sessions ====================

    pub async fn create_session(
        &self,
        user_id: Uuid,
        ip: &str,
        user_agent: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<UserSession, AppError> {
        let session = UserSession {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4().to_string(),
            user_id,
            ip_address: ip.to_string(),
            user_agent: Some(user_agent.to_string()),
            expires_at,
            is_active: true,
            created_at: Utc::now(),
        };

        self.sessions.create_session(&session).await?;
        tracing::debug!(user_id = %user_id, session_id = %session.session_id, "Session created");

        Ok(session)
    }

    /// 会话不存在、已停用或已过期时返回 InvalidSession
    pub async fn validate_session(&self, session_id: &str) -> Result<UserSession, AppError> {
        self.sessions
            .find_session(session_id)
            .await?
            .filter(|s| s.is_valid(Utc::now()))
            .ok_or(AppError::InvalidSession)
    }

    pub async fn deactivate_session(&self, session_id: &str) -> Result<bool, AppError> {
        self.sessions.deactivate_session(session_id).await
    }

    pub async fn deactivate_user_sessions(&self, user_id: Uuid) -> Result<u64, AppError> {
        self.sessions.deactivate_user_sessions(user_id).await
    }

    // ==================== Devices ====================

    /// 登记设备：已存在则刷新 last_seen_at，否则以未信任状态新建
    pub async fn record_device(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        device_info: Option<&str>,
    ) -> Result<DeviceFingerprint, AppError> {
        self.devices
            .record_sighting(user_id, fingerprint, device_info, Utc::now())
            .await
    }

    /// 信任设备
    ///
    /// 指纹只登记在其他用户名下时返回 Forbidden，完全未知时返回 NotFound。
    pub async fn trust_device(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<DeviceFingerprint, AppError> {
        if let Some(device) = self.devices.mark_trusted(user_id, fingerprint).await? {
            tracing::info!(user_id = %user_id, device_id = %device.id, "Device trusted");
            return Ok(device);
        }

        if self
            .devices
            .fingerprint_owned_by_other(user_id, fingerprint)
            .await?
        {
            tracing::warn!(user_id = %user_id, "Attempt to trust a device of another user");
            return Err(AppError::Forbidden);
        }

        Err(AppError::NotFound("Device".to_string()))
    }

    pub async fn list_devices(&self, user_id: Uuid) -> Result<Vec<DeviceFingerprint>, AppError> {
        self.devices.list_devices(user_id).await
    }

    // ==================== Maintenance ====================

    /// 清理过期数据，只依赖时间条件，可重复执行
    pub async fn cleanup_expired(&self) -> Result<CleanupReport, AppError> {
        let now = Utc::now();
        let attempts_before = now - Duration::days(self.maintenance.login_attempt_retention_days);
        let events_before = now - Duration::days(self.maintenance.security_event_retention_days);

        let counters_purged = match self.store.purge_expired().await {
            Ok(purged) => purged,
            Err(e) => {
                tracing::warn!(error = %e, "Counter store purge failed");
                0
            }
        };

        let report = CleanupReport {
            blacklist_entries_deactivated: self.blacklist.deactivate_expired_entries(now).await?,
            sessions_deactivated: self.sessions.deactivate_expired_sessions(now).await?,
            login_attempts_deleted: self.attempts.delete_attempts_before(attempts_before).await?,
            refresh_tokens_deleted: self.refresh_tokens.delete_expired_refresh_tokens(now).await?,
            security_events_deleted: self.events.delete_events_before(events_before).await?,
            counters_purged,
        };

        tracing::info!(?report, "Expired data cleanup finished");

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::test_config,
        models::security::{LoginAttempt, NewBlacklistEntry},
        store::MemoryCounterStore,
    };

    fn service() -> SessionService {
        SessionService::new(
            &Repositories::in_memory(),
            Arc::new(MemoryCounterStore::new()),
            test_config().maintenance,
        )
    }

    #[test]
    fn test_device_fingerprint_format() {
        assert_eq!(device_fingerprint("1.2.3.4", "curl/8"), "1.2.3.4_curl/8");
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let svc = service();
        let user_id = Uuid::new_v4();

        let session = svc
            .create_session(user_id, "1.2.3.4", "ua", Utc::now() + Duration::hours(1))
            .await
            .unwrap();

        let found = svc.validate_session(&session.session_id).await.unwrap();
        assert_eq!(found.user_id, user_id);

        assert!(svc.deactivate_session(&session.session_id).await.unwrap());
        assert!(matches!(
            svc.validate_session(&session.session_id).await,
            Err(AppError::InvalidSession)
        ));
    }

    #[tokio::test]
    async fn test_expired_and_unknown_sessions_invalid() {
        let svc = service();

        let session = svc
            .create_session(Uuid::new_v4(), "1.2.3.4", "ua", Utc::now() - Duration::seconds(1))
            .await
            .unwrap();

        assert!(matches!(
            svc.validate_session(&session.session_id).await,
            Err(AppError::InvalidSession)
        ));
        assert!(matches!(
            svc.validate_session("missing").await,
            Err(AppError::InvalidSession)
        ));
    }

    #[tokio::test]
    async fn test_record_device_is_upsert() {
        let svc = service();
        let user_id = Uuid::new_v4();
        let fp = device_fingerprint("1.2.3.4", "ua");

        let first = svc.record_device(user_id, &fp, Some("ua")).await.unwrap();
        let second = svc.record_device(user_id, &fp, Some("ua")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert!(!second.is_trusted);
        assert!(second.last_seen_at >= first.last_seen_at);
        assert_eq!(svc.list_devices(user_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_trust_device_ownership() {
        let svc = service();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        let fp = device_fingerprint("1.2.3.4", "ua");

        svc.record_device(owner, &fp, None).await.unwrap();

        assert!(matches!(
            svc.trust_device(other, &fp).await,
            Err(AppError::Forbidden)
        ));
        assert!(matches!(
            svc.trust_device(owner, "unknown").await,
            Err(AppError::NotFound(_))
        ));

        let trusted = svc.trust_device(owner, &fp).await.unwrap();
        assert!(trusted.is_trusted);
    }

    #[tokio::test]
    async fn test_cleanup_expires_blacklist_and_old_attempts() {
        let repos = Repositories::in_memory();
        let svc = SessionService::new(
            &repos,
            Arc::new(MemoryCounterStore::new()),
            test_config().maintenance,
        );

        for (ip, expires_at) in [
            ("1.1.1.1", Some(Utc::now() - Duration::minutes(1))),
            ("2.2.2.2", Some(Utc::now() + Duration::hours(1))),
            ("3.3.3.3", None),
        ] {
            repos
                .blacklist
                .upsert_blacklist_entry(&NewBlacklistEntry {
                    ip_address: ip.to_string(),
                    reason: "abuse".to_string(),
                    expires_at,
                })
                .await
                .unwrap();
        }

        let mut stale = LoginAttempt::failed("a@x.com", "9.9.9.9", "ua", "bad_password");
        stale.attempted_at = Utc::now() - Duration::days(31);
        let mut recent = LoginAttempt::failed("a@x.com", "9.9.9.9", "ua", "bad_password");
        recent.attempted_at = Utc::now() - Duration::days(1);
        for attempt in [&stale, &recent] {
            repos.login_attempts.record_attempt(attempt).await.unwrap();
        }

        let report = svc.cleanup_expired().await.unwrap();
        assert_eq!(report.blacklist_entries_deactivated, 1);
        assert_eq!(report.login_attempts_deleted, 1);

        let now = Utc::now();
        assert!(repos.blacklist.find_in_effect("1.1.1.1", now).await.unwrap().is_none());
        assert!(repos.blacklist.find_in_effect("2.2.2.2", now).await.unwrap().is_some());
        assert!(repos.blacklist.find_in_effect("3.3.3.3", now).await.unwrap().is_some());

        let remaining = repos
            .login_attempts
            .count_by_ip_since("9.9.9.9", now - Duration::days(60))
            .await
            .unwrap();
        assert_eq!(remaining, 1);

        let second = svc.cleanup_expired().await.unwrap();
        assert_eq!(second, CleanupReport::default());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let svc = service();
        svc.create_session(Uuid::new_v4(), "1.2.3.4", "ua", Utc::now() - Duration::seconds(1))
            .await
            .unwrap();

        let first = svc.cleanup_expired().await.unwrap();
        assert_eq!(first.sessions_deactivated, 1);

        let second = svc.cleanup_expired().await.unwrap();
        assert_eq!(second, CleanupReport::default());
    }
}
