//! Security event repository (安全审计数据访问)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::PgRepository;
use crate::{error::AppError, models::security::SecurityEvent, repository::SecurityEventRepository};

#[async_trait]
impl SecurityEventRepository for PgRepository {
    async fn append_event(&self, event: &SecurityEvent) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO security_events (
                id, user_id, event_type, description, ip_address, user_agent, severity, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id)
        .bind(event.user_id)
        .bind(&event.event_type)
        .bind(&event.description)
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(event.severity)
        .bind(event.created_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn list_events(
        &self,
        user_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<SecurityEvent>, AppError> {
        let events = sqlx::query_as::<_, SecurityEvent>(
            r#"
            SELECT * FROM security_events
            WHERE ($1::uuid IS NULL OR user_id = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(events)
    }

    async fn delete_events_before(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM security_events WHERE created_at < $1")
            .bind(before)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }
}
