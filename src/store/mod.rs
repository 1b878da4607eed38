//! 共享计数存储
//! 带 TTL 的计数器/键值存储，供速率限制、IP 黑名单缓存和访问令牌黑名单使用

mod memory;
mod postgres;

pub use memory::MemoryCounterStore;
pub use postgres::PgCounterStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// 计数存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("counter store backend error: {0}")]
    Backend(String),
}

/// 计数存储能力接口
///
/// `incr` 必须是原子的：并发调用各自看到不同的返回值。
/// 过期的键对所有读操作都表现为不存在。
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// 写入值，可选 TTL
    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// 删除键，返回键是否存在
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// 原子自增，不存在的键从 0 开始，返回自增后的值
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// 为已存在的键设置 TTL，键不存在时返回 false
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// 剩余 TTL；键不存在或没有 TTL 时返回 None
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// 清理已过期的键，返回清理数量
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}

/// 启动时以固定间隔重试连接计数存储
///
/// 返回 false 表示重试耗尽，调用方以降级模式继续启动。
pub async fn connect_with_retry(
    store: &dyn CounterStore,
    attempts: u32,
    interval: Duration,
) -> bool {
    let attempts = attempts.max(1);

    for attempt in 1..=attempts {
        match store.ping().await {
            Ok(()) => {
                tracing::info!(attempt, "Counter store reachable");
                return true;
            }
            Err(e) => {
                tracing::warn!(
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "Counter store ping failed"
                );
                if attempt < attempts {
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    tracing::error!(
        max_attempts = attempts,
        "Counter store unreachable, starting in degraded mode"
    );
    false
}
