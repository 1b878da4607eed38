//! 安全审计服务
//! 写入失败只记录日志，不影响主流程

use std::sync::Arc;

use crate::{
    error::AppError,
    models::security::{LoginAttempt, SecurityEvent, SecurityEventQuery},
    repository::{LoginAttemptRepository, SecurityEventRepository},
};

const DEFAULT_EVENT_LIMIT: i64 = 100;
const MAX_EVENT_LIMIT: i64 = 1000;

pub struct AuditService {
    events: Arc<dyn SecurityEventRepository>,
    attempts: Arc<dyn LoginAttemptRepository>,
}

impl AuditService {
    pub fn new(
        events: Arc<dyn SecurityEventRepository>,
        attempts: Arc<dyn LoginAttemptRepository>,
    ) -> Self {
        Self { events, attempts }
    }

    /// 记录安全事件
    pub async fn record_event(&self, event: SecurityEvent) {
        tracing::info!(
            event_type = %event.event_type,
            severity = event.severity.as_str(),
            user_id = ?event.user_id,
            ip = ?event.ip_address,
            "Security event"
        );

        if let Err(e) = self.events.append_event(&event).await {
            tracing::warn!(
                event_type = %event.event_type,
                error = %e,
                "Failed to persist security event"
            );
        }
    }

    /// 记录登录尝试
    pub async fn record_attempt(&self, attempt: LoginAttempt) {
        if let Err(e) = self.attempts.record_attempt(&attempt).await {
            tracing::warn!(
                success = attempt.success,
                reason = ?attempt.failure_reason,
                error = %e,
                "Failed to persist login attempt"
            );
        }
    }

    /// 查询安全事件（按时间倒序）
    pub async fn list_events(
        &self,
        query: &SecurityEventQuery,
    ) -> Result<Vec<SecurityEvent>, AppError> {
        let limit = query
            .limit
            .unwrap_or(DEFAULT_EVENT_LIMIT)
            .clamp(1, MAX_EVENT_LIMIT);

        self.events.list_events(query.user_id, limit).await
    }
}
