//! 速率限制与 IP 黑名单缓存
//!
//! 固定窗口计数：首次自增时设置窗口 TTL，窗口到期后计数自然清零。
//! 计数存储不可用时放行（fail open）。

use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

use crate::{
    config::RateLimitConfig,
    repository::RateLimitRuleRepository,
    store::{CounterStore, StoreError},
};

pub const RESOURCE_GLOBAL: &str = "global";
pub const RESOURCE_USER: &str = "user";
pub const RESOURCE_AUTH_PREFIX: &str = "auth.";

/// 单次限流判定结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// 距窗口重置的秒数，至少 1
    pub fn retry_after_secs(&self) -> u64 {
        u64::try_from((self.reset_at - Utc::now()).num_seconds())
            .unwrap_or(0)
            .max(1)
    }

    fn fail_open(limit: u32, window: Duration) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_at: reset_after(window),
        }
    }
}

fn reset_after(window: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero())
}

pub fn ip_key(ip: &str) -> String {
    format!("ip:{}", ip)
}

pub fn user_key(user_id: Uuid) -> String {
    format!("user:{}", user_id)
}

pub fn endpoint_key(endpoint: &str, ip: &str) -> String {
    format!("endpoint:{}:ip:{}", endpoint, ip)
}

fn blacklist_key(ip: &str) -> String {
    format!("blacklist:ip:{}", ip)
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    rules: Arc<dyn RateLimitRuleRepository>,
    defaults: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        rules: Arc<dyn RateLimitRuleRepository>,
        defaults: RateLimitConfig,
    ) -> Self {
        Self {
            store,
            rules,
            defaults,
        }
    }

    /// 对 key 计数一次并判定是否超限
    pub async fn allow(&self, key: &str, max_requests: u32, window: Duration) -> RateLimitDecision {
        let count = match self.store.incr(key).await {
            Ok(count) => count,
            Err(e) => {
                self.store_error("incr", &e);
                return RateLimitDecision::fail_open(max_requests, window);
            }
        };

        if count == 1 {
            if let Err(e) = self.store.expire(key, window).await {
                self.store_error("expire", &e);
            }
        }

        let ttl = match self.store.ttl(key).await {
            Ok(Some(ttl)) => ttl,
            Ok(None) if count > 1 => {
                // 首次自增后的 expire 丢失，计数器会永不过期。
                // 与并发的首次 expire 竞争时两者写入同一窗口，最多延后一次往返时间。
                tracing::warn!(key = %key, count, "Counter without expiry, re-applying window");
                if let Err(e) = self.store.expire(key, window).await {
                    self.store_error("expire", &e);
                }
                window
            }
            Ok(None) => window,
            Err(e) => {
                self.store_error("ttl", &e);
                window
            }
        };

        let used = u32::try_from(count).unwrap_or(u32::MAX);

        RateLimitDecision {
            allowed: used <= max_requests,
            limit: max_requests,
            remaining: max_requests.saturating_sub(used),
            reset_at: reset_after(ttl),
        }
    }

    /// 资源对应的限额：优先启用的规则，否则使用配置默认值
    pub async fn limit_for(&self, resource: &str) -> (u32, Duration) {
        match self.rules.find_active_rule(resource).await {
            Ok(Some(rule)) => {
                return (
                    u32::try_from(rule.max_requests).unwrap_or(1).max(1),
                    Duration::from_secs(u64::try_from(rule.window_seconds).unwrap_or(1).max(1)),
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(resource = %resource, error = %e, "Rate limit rule lookup failed");
            }
        }

        let d = &self.defaults;
        if resource.starts_with(RESOURCE_AUTH_PREFIX) {
            (d.auth_max_requests, Duration::from_secs(d.auth_window_secs))
        } else if resource == RESOURCE_USER {
            (d.user_max_requests, Duration::from_secs(d.user_window_secs))
        } else {
            (d.global_max_requests, Duration::from_secs(d.global_window_secs))
        }
    }

    /// 按 IP 的全局限流
    pub async fn check_ip(&self, ip: &str) -> RateLimitDecision {
        let (max, window) = self.limit_for(RESOURCE_GLOBAL).await;
        self.allow(&ip_key(ip), max, window).await
    }

    /// 按端点 + IP 的限流，`endpoint` 如 "login"，规则资源为 "auth.login"
    pub async fn check_endpoint(&self, endpoint: &str, ip: &str) -> RateLimitDecision {
        let resource = format!("{}{}", RESOURCE_AUTH_PREFIX, endpoint);
        let (max, window) = self.limit_for(&resource).await;
        self.allow(&endpoint_key(endpoint, ip), max, window).await
    }

    /// 已认证用户的限流
    pub async fn check_user(&self, user_id: Uuid) -> RateLimitDecision {
        let (max, window) = self.limit_for(RESOURCE_USER).await;
        self.allow(&user_key(user_id), max, window).await
    }

    // ==================== IP Blacklist Cache ====================

    /// 缓存中是否拉黑；存储不可用时视为未拉黑
    pub async fn check_blacklist(&self, ip: &str) -> bool {
        match self.store.exists(&blacklist_key(ip)).await {
            Ok(hit) => hit,
            Err(e) => {
                self.store_error("blacklist_check", &e);
                false
            }
        }
    }

    /// 写入黑名单缓存，ttl 为 None 表示永久
    pub async fn mark_blacklisted(&self, ip: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.store.set(&blacklist_key(ip), 1, ttl).await
    }

    pub async fn clear_blacklisted(&self, ip: &str) -> Result<(), StoreError> {
        self.store.delete(&blacklist_key(ip)).await.map(|_| ())
    }

    fn store_error(&self, operation: &'static str, error: &StoreError) {
        metrics::counter!("counter_store_errors_total", "operation" => operation).increment(1);
        tracing::warn!(operation, error = %error, "Counter store error, failing open");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::test_config,
        models::security::CreateRateLimitRuleRequest,
        repository::InMemoryRepository,
        store::MemoryCounterStore,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn set(&self, _: &str, _: i64, _: Option<Duration>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn get(&self, _: &str) -> Result<Option<i64>, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn exists(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn incr(&self, _: &str) -> Result<i64, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn ttl(&self, _: &str) -> Result<Option<Duration>, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn purge_expired(&self) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
    }

    fn limiter_with(store: Arc<dyn CounterStore>) -> (RateLimiter, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());
        let limiter = RateLimiter::new(store, repo.clone(), test_config().rate_limit);
        (limiter, repo)
    }

    #[tokio::test]
    async fn test_allow_counts_down_then_denies() {
        let (limiter, _) = limiter_with(Arc::new(MemoryCounterStore::new()));
        let window = Duration::from_secs(60);

        let remaining: Vec<u32> = {
            let mut out = Vec::new();
            for _ in 0..3 {
                let decision = limiter.allow("ip:9.9.9.9", 3, window).await;
                assert!(decision.allowed);
                out.push(decision.remaining);
            }
            out
        };
        assert_eq!(remaining, vec![2, 1, 0]);

        let denied = limiter.allow("ip:9.9.9.9", 3, window).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.limit, 3);
        assert!(denied.retry_after_secs() >= 1 && denied.retry_after_secs() <= 60);
    }

    #[tokio::test]
    async fn test_window_resets() {
        let (limiter, _) = limiter_with(Arc::new(MemoryCounterStore::new()));
        let window = Duration::from_secs(1);

        assert!(limiter.allow("ip:1.1.1.1", 1, window).await.allowed);
        assert!(!limiter.allow("ip:1.1.1.1", 1, window).await.allowed);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let decision = limiter.allow("ip:1.1.1.1", 1, window).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (limiter, _) = limiter_with(Arc::new(MemoryCounterStore::new()));
        let window = Duration::from_secs(60);

        assert!(limiter.allow(&ip_key("1.1.1.1"), 1, window).await.allowed);
        assert!(limiter.allow(&ip_key("2.2.2.2"), 1, window).await.allowed);
        assert!(limiter.allow(&endpoint_key("login", "1.1.1.1"), 1, window).await.allowed);
    }

    #[tokio::test]
    async fn test_missing_expiry_is_reapplied() {
        let store = Arc::new(MemoryCounterStore::new());
        store.set("ip:3.3.3.3", 1, None).await.unwrap();
        let (limiter, _) = limiter_with(store.clone());

        let decision = limiter.allow("ip:3.3.3.3", 5, Duration::from_secs(30)).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 3);
        assert!(store.ttl("ip:3.3.3.3").await.unwrap().is_some());
    }

    /// ttl 始终缺失，并统计 expire 调用次数
    struct NoTtlStore {
        inner: MemoryCounterStore,
        expires: AtomicUsize,
    }

    #[async_trait]
    impl CounterStore for NoTtlStore {
        async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), StoreError> {
            self.inner.set(key, value, ttl).await
        }
        async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
            self.inner.get(key).await
        }
        async fn delete(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.delete(key).await
        }
        async fn exists(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.exists(key).await
        }
        async fn incr(&self, key: &str) -> Result<i64, StoreError> {
            self.inner.incr(key).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
            self.expires.fetch_add(1, Ordering::SeqCst);
            self.inner.expire(key, ttl).await
        }
        async fn ttl(&self, _: &str) -> Result<Option<Duration>, StoreError> {
            Ok(None)
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn purge_expired(&self) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_first_increment_sets_expiry_once() {
        let store = Arc::new(NoTtlStore {
            inner: MemoryCounterStore::new(),
            expires: AtomicUsize::new(0),
        });
        let (limiter, _) = limiter_with(store.clone());
        let window = Duration::from_secs(30);

        assert!(limiter.allow("ip:4.4.4.4", 5, window).await.allowed);
        assert_eq!(store.expires.load(Ordering::SeqCst), 1);

        // 之后的自增才补设过期
        assert!(limiter.allow("ip:4.4.4.4", 5, window).await.allowed);
        assert_eq!(store.expires.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let (limiter, _) = limiter_with(Arc::new(DownStore));

        for _ in 0..10 {
            let decision = limiter.allow("ip:4.4.4.4", 1, Duration::from_secs(60)).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 1);
        }
        assert!(!limiter.check_blacklist("4.4.4.4").await);
    }

    #[tokio::test]
    async fn test_limit_for_defaults_and_rules() {
        let (limiter, repo) = limiter_with(Arc::new(MemoryCounterStore::new()));
        let defaults = test_config().rate_limit;

        assert_eq!(
            limiter.limit_for("auth.login").await,
            (defaults.auth_max_requests, Duration::from_secs(defaults.auth_window_secs))
        );
        assert_eq!(
            limiter.limit_for("global").await,
            (defaults.global_max_requests, Duration::from_secs(defaults.global_window_secs))
        );

        repo.create_rule(&CreateRateLimitRuleRequest {
            name: "login-strict".to_string(),
            resource: "auth.login".to_string(),
            max_requests: 2,
            window_seconds: 120,
        })
        .await
        .unwrap();

        assert_eq!(
            limiter.limit_for("auth.login").await,
            (2, Duration::from_secs(120))
        );

        assert!(limiter.check_endpoint("login", "5.5.5.5").await.allowed);
        assert!(limiter.check_endpoint("login", "5.5.5.5").await.allowed);
        assert!(!limiter.check_endpoint("login", "5.5.5.5").await.allowed);
    }

    #[tokio::test]
    async fn test_blacklist_cache() {
        let (limiter, _) = limiter_with(Arc::new(MemoryCounterStore::new()));

        assert!(!limiter.check_blacklist("1.2.3.4").await);
        limiter.mark_blacklisted("1.2.3.4", None).await.unwrap();
        assert!(limiter.check_blacklist("1.2.3.4").await);
        limiter.clear_blacklisted("1.2.3.4").await.unwrap();
        assert!(!limiter.check_blacklist("1.2.3.4").await);
    }
}
