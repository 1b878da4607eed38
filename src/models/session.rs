//! Session and device trust models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User session
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserSession {
    pub id: Uuid,
    pub session_id: String,
    pub user_id: Uuid,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl UserSession {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at > now
    }
}

/// Device fingerprint, unique per (user_id, fingerprint)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceFingerprint {
    pub id: Uuid,
    pub user_id: Uuid,
    pub fingerprint: String,
    pub device_info: Option<String>,
    pub is_trusted: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Trust device request
#[derive(Debug, Deserialize)]
pub struct TrustDeviceRequest {
    pub fingerprint: String,
}

/// Result of one maintenance pass
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub blacklist_entries_deactivated: u64,
    pub sessions_deactivated: u64,
    pub login_attempts_deleted: u64,
    pub refresh_tokens_deleted: u64,
    pub security_events_deleted: u64,
    pub counters_purged: u64,
}
