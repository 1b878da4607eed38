//! Risk signal repository (IP 黑名单、登录尝试、设备指纹、限流规则)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{map_unique_violation, PgRepository};
use crate::{
    error::AppError,
    models::{
        security::{
            CreateRateLimitRuleRequest, IpBlacklistEntry, LoginAttempt, NewBlacklistEntry,
            RateLimitRule, UpdateRateLimitRuleRequest,
        },
        session::DeviceFingerprint,
    },
    repository::{
        DeviceRepository, IpBlacklistRepository, LoginAttemptRepository, RateLimitRuleRepository,
    },
};

// ==================== IP Blacklist ====================

#[async_trait]
impl IpBlacklistRepository for PgRepository {
    async fn upsert_blacklist_entry(
        &self,
        entry: &NewBlacklistEntry,
    ) -> Result<IpBlacklistEntry, AppError> {
        let saved = sqlx::query_as::<_, IpBlacklistEntry>(
            r#"
            INSERT INTO ip_blacklist (id, ip_address, reason, expires_at, is_active)
            VALUES ($1, $2, $3, $4, TRUE)
            ON CONFLICT (ip_address) DO UPDATE
            SET reason = EXCLUDED.reason,
                expires_at = EXCLUDED.expires_at,
                is_active = TRUE
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&entry.ip_address)
        .bind(&entry.reason)
        .bind(entry.expires_at)
        .fetch_one(&self.db)
        .await?;

        Ok(saved)
    }

    async fn find_in_effect(
        &self,
        ip_address: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IpBlacklistEntry>, AppError> {
        let entry = sqlx::query_as::<_, IpBlacklistEntry>(
            r#"
            SELECT * FROM ip_blacklist
            WHERE ip_address = $1
              AND is_active = TRUE
              AND (expires_at IS NULL OR expires_at > $2)
            "#,
        )
        .bind(ip_address)
        .bind(now)
        .fetch_optional(&self.db)
        .await?;

        Ok(entry)
    }

    async fn deactivate_blacklist_entry(&self, ip_address: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE ip_blacklist SET is_active = FALSE WHERE ip_address = $1 AND is_active = TRUE",
        )
        .bind(ip_address)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_in_effect(&self, now: DateTime<Utc>) -> Result<Vec<IpBlacklistEntry>, AppError> {
        let entries = sqlx::query_as::<_, IpBlacklistEntry>(
            r#"
            SELECT * FROM ip_blacklist
            WHERE is_active = TRUE AND (expires_at IS NULL OR expires_at > $1)
            ORDER BY created_at DESC
            "#,
        )
        .bind(now)
        .fetch_all(&self.db)
        .await?;

        Ok(entries)
    }

    async fn deactivate_expired_entries(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE ip_blacklist SET is_active = FALSE
            WHERE is_active = TRUE AND expires_at IS NOT NULL AND expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }
}

// ==================== Login Attempts ====================

#[async_trait]
impl LoginAttemptRepository for PgRepository {
    async fn record_attempt(&self, attempt: &LoginAttempt) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO login_attempts (
                id, email, ip_address, user_agent, success, failure_reason, attempted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(attempt.id)
        .bind(&attempt.email)
        .bind(&attempt.ip_address)
        .bind(&attempt.user_agent)
        .bind(attempt.success)
        .bind(&attempt.failure_reason)
        .bind(attempt.attempted_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn count_failed_by_email_since(
        &self,
        email: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM login_attempts
            WHERE email = $1 AND success = FALSE AND attempted_at >= $2
            "#,
        )
        .bind(email)
        .bind(since)
        .fetch_one(&self.db)
        .await?;

        Ok(count)
    }

    async fn count_by_ip_since(
        &self,
        ip_address: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM login_attempts WHERE ip_address = $1 AND attempted_at >= $2",
        )
        .bind(ip_address)
        .bind(since)
        .fetch_one(&self.db)
        .await?;

        Ok(count)
    }

    async fn delete_attempts_before(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM login_attempts WHERE attempted_at < $1")
            .bind(before)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }
}

// ==================== Devices ====================

#[async_trait]
impl DeviceRepository for PgRepository {
    async fn find_device(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<DeviceFingerprint>, AppError> {
        let device = sqlx::query_as::<_, DeviceFingerprint>(
            "SELECT * FROM device_fingerprints WHERE user_id = $1 AND fingerprint = $2",
        )
        .bind(user_id)
        .bind(fingerprint)
        .fetch_optional(&self.db)
        .await?;

        Ok(device)
    }

    async fn fingerprint_owned_by_other(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<bool, AppError> {
        let owned: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM device_fingerprints WHERE fingerprint = $2 AND user_id <> $1
            )
            "#,
        )
        .bind(user_id)
        .bind(fingerprint)
        .fetch_one(&self.db)
        .await?;

        Ok(owned)
    }

    async fn record_sighting(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        device_info: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DeviceFingerprint, AppError> {
        let device = sqlx::query_as::<_, DeviceFingerprint>(
            r#"
            INSERT INTO device_fingerprints (
                id, user_id, fingerprint, device_info, is_trusted, first_seen_at, last_seen_at
            )
            VALUES ($1, $2, $3, $4, FALSE, $5, $5)
            ON CONFLICT (user_id, fingerprint) DO UPDATE
            SET last_seen_at = EXCLUDED.last_seen_at,
                device_info = COALESCE(EXCLUDED.device_info, device_fingerprints.device_info)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(fingerprint)
        .bind(device_info)
        .bind(now)
        .fetch_one(&self.db)
        .await?;

        Ok(device)
    }

    async fn mark_trusted(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<DeviceFingerprint>, AppError> {
        let device = sqlx::query_as::<_, DeviceFingerprint>(
            r#"
            UPDATE device_fingerprints SET is_trusted = TRUE
            WHERE user_id = $1 AND fingerprint = $2
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(fingerprint)
        .fetch_optional(&self.db)
        .await?;

        Ok(device)
    }

    async fn list_devices(&self, user_id: Uuid) -> Result<Vec<DeviceFingerprint>, AppError> {
        let devices = sqlx::query_as::<_, DeviceFingerprint>(
            "SELECT * FROM device_fingerprints WHERE user_id = $1 ORDER BY last_seen_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(devices)
    }
}

// ==================== Rate Limit Rules ====================

#[async_trait]
impl RateLimitRuleRepository for PgRepository {
    async fn create_rule(
        &self,
        req: &CreateRateLimitRuleRequest,
    ) -> Result<RateLimitRule, AppError> {
        let rule = sqlx::query_as::<_, RateLimitRule>(
            r#"
            INSERT INTO rate_limit_rules (id, name, resource, max_requests, window_seconds)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&req.name)
        .bind(&req.resource)
        .bind(req.max_requests)
        .bind(req.window_seconds)
        .fetch_one(&self.db)
        .await
        .map_err(map_unique_violation)?;

        Ok(rule)
    }

    async fn update_rule(
        &self,
        id: Uuid,
        req: &UpdateRateLimitRuleRequest,
    ) -> Result<Option<RateLimitRule>, AppError> {
        let rule = sqlx::query_as::<_, RateLimitRule>(
            r#"
            UPDATE rate_limit_rules
            SET resource = COALESCE($2, resource),
                max_requests = COALESCE($3, max_requests),
                window_seconds = COALESCE($4, window_seconds),
                is_active = COALESCE($5, is_active),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&req.resource)
        .bind(req.max_requests)
        .bind(req.window_seconds)
        .bind(req.is_active)
        .fetch_optional(&self.db)
        .await?;

        Ok(rule)
    }

    async fn deactivate_rule(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE rate_limit_rules SET is_active = FALSE, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_active_rule(&self, resource: &str) -> Result<Option<RateLimitRule>, AppError> {
        let rule = sqlx::query_as::<_, RateLimitRule>(
            r#"
            SELECT * FROM rate_limit_rules
            WHERE resource = $1 AND is_active = TRUE
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(resource)
        .fetch_optional(&self.db)
        .await?;

        Ok(rule)
    }

    async fn list_rules(&self) -> Result<Vec<RateLimitRule>, AppError> {
        let rules = sqlx::query_as::<_, RateLimitRule>("SELECT * FROM rate_limit_rules ORDER BY name")
            .fetch_all(&self.db)
            .await?;

        Ok(rules)
    }
}
