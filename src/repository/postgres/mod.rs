//! PostgreSQL repository (sqlx)

mod account_repo;
mod audit_repo;
mod risk_repo;
mod session_repo;
mod token_repo;

use sqlx::PgPool;

use crate::error::AppError;

pub struct PgRepository {
    db: PgPool,
}

impl PgRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

/// 唯一约束冲突映射为 AlreadyExists，其余保持数据库错误
fn map_unique_violation(e: sqlx::Error) -> AppError {
    match &e {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => AppError::AlreadyExists,
        _ => AppError::Database(e),
    }
}
