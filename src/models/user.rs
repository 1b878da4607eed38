//! User and credential domain models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use validator::Validate;

/// User profile
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub age: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Login credential, exactly one per user
#[derive(Clone, sqlx::FromRow)]
pub struct Credential {
    pub user_id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub is_active: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// 密码哈希不进入日志
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .field("password_hash", &"[REDACTED]")
            .field("is_active", &self.is_active)
            .field("last_login_at", &self.last_login_at)
            .finish()
    }
}

/// Everything needed to create a user + credential + default role atomically
#[derive(Clone)]
pub struct NewAccount {
    pub name: String,
    pub email: String,
    pub age: i32,
    pub password_hash: String,
    pub default_role: String,
}

/// Registration request
#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 1, max = 100, message = "name must be 1-100 characters"))]
    pub name: String,
    #[validate(email(message = "email is invalid"))]
    pub email: String,
    pub password: String,
    #[validate(range(min = 0, max = 150, message = "age must be between 0 and 150"))]
    pub age: Option<i32>,
}

/// Profile update request
#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateProfileRequest {
    #[validate(length(min = 1, max = 100, message = "name must be 1-100 characters"))]
    pub name: Option<String>,
    #[validate(range(min = 0, max = 150, message = "age must be between 0 and 150"))]
    pub age: Option<i32>,
}

/// Change password request
#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// User response (without sensitive data)
#[derive(Debug, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub age: i32,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            name: user.name,
            email: user.email,
            age: user.age,
            created_at: user.created_at,
        }
    }
}

/// User with roles
#[derive(Debug, Serialize)]
pub struct UserWithRoles {
    #[serde(flatten)]
    pub user: UserResponse,
    pub roles: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_redacts_hash() {
        let now = Utc::now();
        let credential = Credential {
            user_id: Uuid::new_v4(),
            email: "a@x.com".to_string(),
            password_hash: "$argon2id$v=19$secret".to_string(),
            is_active: true,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        };

        let debug = format!("{:?}", credential);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("argon2id"));
    }

    #[test]
    fn test_register_request_validation() {
        let valid = RegisterRequest {
            name: "Alice".to_string(),
            email: "a@x.com".to_string(),
            password: "secret".to_string(),
            age: None,
        };
        assert!(valid.validate().is_ok());

        let bad_age = RegisterRequest {
            age: Some(151),
            ..valid
        };
        assert!(bad_age.validate().is_err());
    }
}
