//! Account repository (用户、凭据、角色数据访问)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{map_unique_violation, PgRepository};
use crate::{
    error::AppError,
    models::user::{Credential, NewAccount, User},
    repository::{CredentialRepository, RoleRepository, UserRepository},
};

#[async_trait]
impl UserRepository for PgRepository {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, name, email, age, created_at, updated_at FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(user)
    }

    async fn update_profile(
        &self,
        user_id: Uuid,
        name: Option<&str>,
        age: Option<i32>,
    ) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET name = COALESCE($2, name),
                age = COALESCE($3, age),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, name, email, age, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(name)
        .bind(age)
        .fetch_optional(&self.db)
        .await?;

        Ok(user)
    }
}

#[async_trait]
impl CredentialRepository for PgRepository {
    async fn create_account(&self, account: &NewAccount) -> Result<User, AppError> {
        let mut tx = self.db.begin().await?;

        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, name, email, age)
            VALUES ($1, $2, $3, $4)
            RETURNING id, name, email, age, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&account.name)
        .bind(&account.email)
        .bind(account.age)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_unique_violation)?;

        sqlx::query(
            r#"
            INSERT INTO credentials (user_id, email, password_hash)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(user.id)
        .bind(&account.email)
        .bind(&account.password_hash)
        .execute(&mut *tx)
        .await
        .map_err(map_unique_violation)?;

        let assigned = sqlx::query(
            r#"
            INSERT INTO user_roles (user_id, role_id)
            SELECT $1, id FROM roles WHERE name = $2
            "#,
        )
        .bind(user.id)
        .bind(&account.default_role)
        .execute(&mut *tx)
        .await?;

        // 默认角色缺失时回滚整个注册
        if assigned.rows_affected() != 1 {
            return Err(AppError::Internal(format!(
                "role {} missing",
                account.default_role
            )));
        }

        tx.commit().await?;

        Ok(user)
    }

    async fn find_credential_by_email(&self, email: &str) -> Result<Option<Credential>, AppError> {
        let credential =
            sqlx::query_as::<_, Credential>("SELECT * FROM credentials WHERE email = $1")
                .bind(email)
                .fetch_optional(&self.db)
                .await?;

        Ok(credential)
    }

    async fn find_credential_by_user(&self, user_id: Uuid) -> Result<Option<Credential>, AppError> {
        let credential =
            sqlx::query_as::<_, Credential>("SELECT * FROM credentials WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.db)
                .await?;

        Ok(credential)
    }

    async fn update_password_hash(
        &self,
        user_id: Uuid,
        password_hash: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE credentials SET password_hash = $2, updated_at = NOW() WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(password_hash)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query("UPDATE credentials SET last_login_at = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(at)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    async fn set_active(&self, user_id: Uuid, active: bool) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE credentials SET is_active = $2, updated_at = NOW() WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(active)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl RoleRepository for PgRepository {
    async fn role_names_for_user(&self, user_id: Uuid) -> Result<Vec<String>, AppError> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT r.name
            FROM user_roles ur
            JOIN roles r ON r.id = ur.role_id
            WHERE ur.user_id = $1
            ORDER BY r.name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(names)
    }

    async fn assign_role(&self, user_id: Uuid, role_name: &str) -> Result<bool, AppError> {
        let role_id: Option<Uuid> = sqlx::query_scalar("SELECT id FROM roles WHERE name = $1")
            .bind(role_name)
            .fetch_optional(&self.db)
            .await?;

        let role_id = role_id.ok_or_else(|| AppError::NotFound("Role".to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO user_roles (user_id, role_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id, role_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(role_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
