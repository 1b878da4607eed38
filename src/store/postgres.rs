//! PostgreSQL 计数存储
//! 多实例部署时共享同一张 counters 表

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;

use super::{CounterStore, StoreError};

pub struct PgCounterStore {
    db: PgPool,
}

impl PgCounterStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(e.to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO counters (key, value, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.map(|t| t.as_secs_f64()))
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let value: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT value FROM counters
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await?;

        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM counters
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        // 单条语句完成自增；已过期的行从 1 重新计数并清除 TTL
        let value: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO counters (key, value, expires_at)
            VALUES ($1, 1, NULL)
            ON CONFLICT (key) DO UPDATE
            SET value = CASE
                    WHEN counters.expires_at IS NOT NULL AND counters.expires_at <= NOW() THEN 1
                    ELSE counters.value + 1
                END,
                expires_at = CASE
                    WHEN counters.expires_at IS NOT NULL AND counters.expires_at <= NOW() THEN NULL
                    ELSE counters.expires_at
                END
            RETURNING value
            "#,
        )
        .bind(key)
        .fetch_one(&self.db)
        .await?;

        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE counters
            SET expires_at = NOW() + make_interval(secs => $2)
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .bind(ttl.as_secs_f64())
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let remaining: Option<Option<f64>> = sqlx::query_scalar(
            r#"
            SELECT EXTRACT(EPOCH FROM (expires_at - NOW()))::float8
            FROM counters
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await?;

        Ok(remaining
            .flatten()
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1 FROM counters LIMIT 1")
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM counters WHERE expires_at IS NOT NULL AND expires_at <= NOW()")
                .execute(&self.db)
                .await?;

        Ok(result.rows_affected())
    }
}
