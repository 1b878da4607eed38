//! 管理服务：限流规则、IP 黑名单、安全事件查询
//!
//! 黑名单以仓储为准，计数存储中的 `blacklist:ip:<ip>` 只是缓存，
//! 每次变更后同步，启动时整体预热。

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::{
    error::AppError,
    models::security::{
        BlacklistIpRequest, CreateRateLimitRuleRequest, IpBlacklistEntry, NewBlacklistEntry,
        RateLimitRule, SecurityEvent, SecurityEventQuery, SecurityEventType, Severity,
        UpdateRateLimitRuleRequest,
    },
    repository::{IpBlacklistRepository, RateLimitRuleRepository, Repositories},
    services::{audit_service::AuditService, rate_limiter::RateLimiter},
};

/// 黑名单有效期换算为到期时间，溢出时视为参数错误
fn blacklist_expiry(secs: i64) -> Result<DateTime<Utc>, AppError> {
    TimeDelta::try_seconds(secs)
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .ok_or_else(|| AppError::Validation("expires_in_secs is out of range".to_string()))
}

pub struct AdminService {
    rules: Arc<dyn RateLimitRuleRepository>,
    blacklist: Arc<dyn IpBlacklistRepository>,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<AuditService>,
}

impl AdminService {
    pub fn new(repos: &Repositories, rate_limiter: Arc<RateLimiter>, audit: Arc<AuditService>) -> Self {
        Self {
            rules: repos.rate_limit_rules.clone(),
            blacklist: repos.blacklist.clone(),
            rate_limiter,
            audit,
        }
    }

    // ==================== Rate Limit Rules ====================

    pub async fn list_rules(&self) -> Result<Vec<RateLimitRule>, AppError> {
        self.rules.list_rules().await
    }

    pub async fn create_rule(
        &self,
        admin_id: Uuid,
        req: CreateRateLimitRuleRequest,
    ) -> Result<RateLimitRule, AppError> {
        req.validate()?;
        let rule = self.rules.create_rule(&req).await?;

        self.audit
            .record_event(
                SecurityEvent::new(
                    SecurityEventType::RateLimitRuleChanged,
                    Severity::Low,
                    format!(
                        "rule '{}' created: {} requests / {}s on '{}'",
                        rule.name, rule.max_requests, rule.window_seconds, rule.resource
                    ),
                )
                .with_user(admin_id),
            )
            .await;

        Ok(rule)
    }

    pub async fn update_rule(
        &self,
        admin_id: Uuid,
        rule_id: Uuid,
        req: UpdateRateLimitRuleRequest,
    ) -> Result<RateLimitRule, AppError> {
        req.validate()?;
        let rule = self
            .rules
            .update_rule(rule_id, &req)
            .await?
            .ok_or_else(|| AppError::NotFound("Rate limit rule".to_string()))?;

        self.audit
            .record_event(
                SecurityEvent::new(
                    SecurityEventType::RateLimitRuleChanged,
                    Severity::Low,
                    format!("rule '{}' updated", rule.name),
                )
                .with_user(admin_id),
            )
            .await;

        Ok(rule)
    }

    pub async fn deactivate_rule(&self, admin_id: Uuid, rule_id: Uuid) -> Result<(), AppError> {
        if !self.rules.deactivate_rule(rule_id).await? {
            return Err(AppError::NotFound("Rate limit rule".to_string()));
        }

        self.audit
            .record_event(
                SecurityEvent::new(
                    SecurityEventType::RateLimitRuleChanged,
                    Severity::Low,
                    format!("rule {} deactivated", rule_id),
                )
                .with_user(admin_id),
            )
            .await;

        Ok(())
    }

    // ==================== IP Blacklist ====================

    pub async fn list_blacklist(&self) -> Result<Vec<IpBlacklistEntry>, AppError> {
        self.blacklist.list_in_effect(Utc::now()).await
    }

    /// 拉黑 IP 并同步缓存
    pub async fn blacklist_ip(
        &self,
        admin_id: Uuid,
        req: BlacklistIpRequest,
    ) -> Result<IpBlacklistEntry, AppError> {
        req.validate()?;
        let ip_address = req.ip_address.trim().to_string();

        let entry = self
            .blacklist
            .upsert_blacklist_entry(&NewBlacklistEntry {
                ip_address: ip_address.clone(),
                reason: req.reason,
                expires_at: req.expires_in_secs.map(blacklist_expiry).transpose()?,
            })
            .await?;

        let ttl = req
            .expires_in_secs
            .and_then(|secs| u64::try_from(secs).ok())
            .map(std::time::Duration::from_secs);
        if let Err(e) = self.rate_limiter.mark_blacklisted(&ip_address, ttl).await {
            tracing::warn!(ip = %ip_address, error = %e, "Failed to sync IP blacklist cache");
        }

        self.audit
            .record_event(
                SecurityEvent::new(
                    SecurityEventType::BlacklistChanged,
                    Severity::Medium,
                    format!("IP {} blacklisted: {}", ip_address, entry.reason),
                )
                .with_user(admin_id),
            )
            .await;

        Ok(entry)
    }

    /// 解除拉黑并同步缓存
    pub async fn remove_from_blacklist(&self, admin_id: Uuid, ip_address: &str) -> Result<(), AppError> {
        if !self.blacklist.deactivate_blacklist_entry(ip_address).await? {
            return Err(AppError::NotFound("Blacklist entry".to_string()));
        }

        if let Err(e) = self.rate_limiter.clear_blacklisted(ip_address).await {
            tracing::warn!(ip = %ip_address, error = %e, "Failed to sync IP blacklist cache");
        }

        self.audit
            .record_event(
                SecurityEvent::new(
                    SecurityEventType::BlacklistChanged,
                    Severity::Low,
                    format!("IP {} removed from blacklist", ip_address),
                )
                .with_user(admin_id),
            )
            .await;

        Ok(())
    }

    /// 启动时用仓储中生效的黑名单预热缓存，返回写入条数
    pub async fn warm_blacklist_cache(&self) -> Result<usize, AppError> {
        let now = Utc::now();
        let entries = self.blacklist.list_in_effect(now).await?;
        let mut warmed = 0;

        for entry in &entries {
            let ttl = match entry.expires_at {
                Some(at) => match (at - now).to_std() {
                    Ok(ttl) => Some(ttl),
                    Err(_) => continue,
                },
                None => None,
            };

            match self.rate_limiter.mark_blacklisted(&entry.ip_address, ttl).await {
                Ok(()) => warmed += 1,
                Err(e) => {
                    tracing::warn!(ip = %entry.ip_address, error = %e, "Failed to warm blacklist cache");
                }
            }
        }

        tracing::info!(warmed, "IP blacklist cache warmed");

        Ok(warmed)
    }

    // ==================== Security Events ====================

    pub async fn list_security_events(
        &self,
        query: &SecurityEventQuery,
    ) -> Result<Vec<SecurityEvent>, AppError> {
        self.audit.list_events(query).await
    }
}
