//! Role domain models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role assigned to every new account
pub const DEFAULT_ROLE: &str = "user";

/// Role required by the admin endpoints
pub const ADMIN_ROLE: &str = "admin";

/// Role
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}
