//! In-memory coordination store
//!
//! Single-process stand-in with the same atomicity and TTL semantics as
//! the Redis adapter. Used by tests and by store-less local runs, where
//! cross-worker guarantees are not needed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{CoordinationStore, StoreResult};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
struct Inner {
    keys: HashMap<String, Entry>,
    lists: HashMap<String, Vec<String>>,
}

impl Inner {
    // Drops an expired entry so lookups behave like Redis lazy expiry.
    fn live_entry(&mut self, key: &str) -> Option<&Entry> {
        if self.keys.get(key).is_some_and(|e| e.expired()) {
            self.keys.remove(key);
        }
        self.keys.get(key)
    }
}

/// Process-local store with Redis-like semantics
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a list, newest first (test helper).
    pub async fn list(&self, key: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.lists.get(key).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        if inner.live_entry(key).is_some() {
            return Ok(false);
        }
        inner.keys.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.keys.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.live_entry(key).map(|e| e.value.clone()))
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let existed = inner.live_entry(key).is_some();
        inner.keys.remove(key);
        Ok(existed)
    }

    async fn del_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let matches = inner
            .live_entry(key)
            .map(|e| e.value == expected)
            .unwrap_or(false);
        if matches {
            inner.keys.remove(key);
        }
        Ok(matches)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        if inner.live_entry(key).is_none() {
            return Ok(false);
        }
        if let Some(entry) = inner.keys.get_mut(key) {
            if entry.value == expected {
                entry.expires_at = Some(Instant::now() + ttl);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        if inner.live_entry(key).is_none() {
            return Ok(false);
        }
        if let Some(entry) = inner.keys.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<u64>> {
        let mut inner = self.inner.lock().await;
        match inner.live_entry(key) {
            Some(entry) => Ok(entry
                .expires_at
                .map(|at| at.saturating_duration_since(Instant::now()).as_secs())),
            None => Ok(None),
        }
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .live_entry(key)
            .and_then(|e| e.value.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        let expires_at = inner.keys.get(key).and_then(|e| e.expires_at);
        inner.keys.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn lpush_trim(&self, key: &str, value: &str, cap: usize) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let list = inner.lists.entry(key.to_string()).or_default();
        list.insert(0, value.to_string());
        list.truncate(cap);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let expired: Vec<String> = inner
            .keys
            .iter()
            .filter(|(_, e)| e.expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            inner.keys.remove(&key);
        }
        Ok(inner
            .keys
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        assert!(store
            .set_nx_ex("k", "a", Duration::from_millis(50))
            .await
            .unwrap());
        assert!(!store
            .set_nx_ex("k", "b", Duration::from_millis(50))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store
            .set_nx_ex("k", "b", Duration::from_millis(50))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn del_if_equals_requires_matching_value() {
        let store = MemoryStore::new();
        store.set_ex("k", "owner", Duration::from_secs(5)).await.unwrap();

        assert!(!store.del_if_equals("k", "intruder").await.unwrap());
        assert!(store.del_if_equals("k", "owner").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lpush_trim_caps_list() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .lpush_trim("recent", &i.to_string(), 3)
                .await
                .unwrap();
        }
        let items = store.list("recent").await;
        assert_eq!(items, vec!["4", "3", "2"]);
    }

    #[tokio::test]
    async fn incr_counts_from_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("count").await.unwrap(), 1);
        assert_eq!(store.incr("count").await.unwrap(), 2);
    }
}
