//! Session repository (会话数据访问)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{map_unique_violation, PgRepository};
use crate::{error::AppError, models::session::UserSession, repository::SessionRepository};

#[async_trait]
impl SessionRepository for PgRepository {
    async fn create_session(&self, session: &UserSession) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO user_sessions (
                id, session_id, user_id, ip_address, user_agent, expires_at, is_active, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(session.id)
        .bind(&session.session_id)
        .bind(session.user_id)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .bind(session.expires_at)
        .bind(session.is_active)
        .bind(session.created_at)
        .execute(&self.db)
        .await
        .map_err(map_unique_violation)?;

        Ok(())
    }

    async fn find_session(&self, session_id: &str) -> Result<Option<UserSession>, AppError> {
        let session =
            sqlx::query_as::<_, UserSession>("SELECT * FROM user_sessions WHERE session_id = $1")
                .bind(session_id)
                .fetch_optional(&self.db)
                .await?;

        Ok(session)
    }

    async fn deactivate_session(&self, session_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE user_sessions SET is_active = FALSE WHERE session_id = $1 AND is_active = TRUE",
        )
        .bind(session_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn deactivate_user_sessions(&self, user_id: Uuid) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE user_sessions SET is_active = FALSE WHERE user_id = $1 AND is_active = TRUE",
        )
        .bind(user_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    async fn deactivate_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE user_sessions SET is_active = FALSE WHERE is_active = TRUE AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }
}
