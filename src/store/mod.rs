//! Coordination Store Adapter
//!
//! Thin async abstraction over the shared external store. Every
//! cross-worker guarantee in this crate (mutual exclusion, orphan
//! detection, alert persistence) derives from the atomic primitives
//! exposed here; nothing else is shared between workers.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors from the coordination store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Store unreachable; callers degrade rather than fail
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store protocol error: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Atomic primitives required by the coordination components.
///
/// Keys are namespaced per component (`account_lock:*`, `active_task:*`,
/// `worker_heartbeat:*`, `alert:*`); within a key only the token-verified
/// owner mutates it, enforced by the compare-and-act operations below.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Set `key` to `value` only if absent, with expiry. Returns true if set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Unconditionally set `key` with expiry.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Delete `key`. Returns true if it existed.
    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// Delete `key` only if its current value equals `expected`.
    async fn del_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Reset the expiry of `key` only if its current value equals `expected`.
    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration)
        -> StoreResult<bool>;

    /// Reset the expiry of `key`. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Remaining TTL of `key` in seconds; None if missing or unexpiring.
    async fn ttl(&self, key: &str) -> StoreResult<Option<u64>>;

    /// Increment the integer at `key`, creating it at 0 first.
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    /// Push `value` onto the head of the list at `key`, trimming to `cap`.
    async fn lpush_trim(&self, key: &str, value: &str, cap: usize) -> StoreResult<()>;

    /// All keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Liveness probe.
    async fn ping(&self) -> StoreResult<()>;
}
