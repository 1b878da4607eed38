//! 进程内计数存储（DashMap）

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

use super::{CounterStore, StoreError};

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    value: i64,
    expires_at: Option<Instant>,
}

impl CounterEntry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// 基于 DashMap 的计数存储
///
/// 自增在分片写锁内完成，单进程内原子。
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: DashMap<String, CounterEntry>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前未过期的键数量
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .insert(key.to_string(), CounterEntry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, entry)| !entry.is_expired(now))
            .unwrap_or(false))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert(CounterEntry {
            value: 0,
            expires_at: None,
        });

        // 过期键视为不存在，从 0 重新计数
        if entry.is_expired(now) {
            *entry = CounterEntry {
                value: 0,
                expires_at: None,
            };
        }

        entry.value += 1;
        Ok(entry.value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }
}
