//! Distributed Account Locking
//!
//! Redis-backed mutual exclusion over broker accounts so concurrent
//! workers never execute trading operations against the same account at
//! the same time. Acquisition is SET-NX-EX with exponential backoff plus
//! jitter; release and extension are token-verified compare-and-act so a
//! holder can never clobber a lock that expired and was re-acquired.
//!
//! When the coordination store is unreachable the lock fails OPEN:
//! acquisition reports success without a real lock. That trades
//! consistency for availability and leaves a window for double
//! execution during store outages; every occurrence is logged at
//! warning level so operators can audit the exposure.

use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::store::{CoordinationStore, StoreError};

/// Outcome of a lock acquisition attempt
pub enum LockAcquisition {
    /// Lock held in the store; guard releases it
    Acquired(LockGuard),
    /// Store unreachable; operation proceeds unguarded (fail-open)
    Degraded(LockGuard),
    /// Another holder kept the lock through every retry
    Contended,
}

impl LockAcquisition {
    /// Whether the caller may proceed with the protected operation
    pub fn is_acquired(&self) -> bool {
        !matches!(self, LockAcquisition::Contended)
    }

    pub fn into_guard(self) -> Option<LockGuard> {
        match self {
            LockAcquisition::Acquired(g) | LockAcquisition::Degraded(g) => Some(g),
            LockAcquisition::Contended => None,
        }
    }
}

/// Held lock with its ownership token
pub struct LockGuard {
    store: Arc<dyn CoordinationStore>,
    key: String,
    token: String,
    /// False when acquired fail-open; release becomes a no-op
    real: bool,
    released: bool,
}

impl LockGuard {
    /// Owner token stored under the lock key
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// True when no store-side lock actually backs this guard
    pub fn is_degraded(&self) -> bool {
        !self.real
    }

    /// Release the lock if we still own it
    pub async fn release(mut self) -> bool {
        self.released = true;
        if !self.real {
            return true;
        }
        match self.store.del_if_equals(&self.key, &self.token).await {
            Ok(true) => {
                debug!("Lock released: {}", self.key);
                true
            }
            Ok(false) => {
                warn!("Lock release skipped, no longer owned: {}", self.key);
                false
            }
            Err(StoreError::Unavailable(e)) => {
                // Key will expire on its own TTL.
                warn!("Store unavailable releasing lock {}: {}", self.key, e);
                true
            }
            Err(e) => {
                warn!("Failed to release lock {}: {}", self.key, e);
                false
            }
        }
    }

    /// Extend the lock expiry if we still own it
    pub async fn extend(&self, extra: Duration) -> bool {
        if !self.real {
            return true;
        }
        match self.store.expire_if_equals(&self.key, &self.token, extra).await {
            Ok(extended) => extended,
            Err(StoreError::Unavailable(e)) => {
                warn!("Store unavailable extending lock {}: {}", self.key, e);
                true
            }
            Err(e) => {
                warn!("Failed to extend lock {}: {}", self.key, e);
                false
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.real && !self.released {
            // Best effort; the TTL bounds how long an unreleased lock lingers.
            warn!(
                "Lock guard dropped without release, {} expires by TTL",
                self.key
            );
        }
    }
}

/// Point-in-time view of a lock key (admin/dashboard surface)
#[derive(Debug, Clone, Serialize)]
pub struct LockInfo {
    pub key: String,
    pub locked: bool,
    pub owner_token: Option<String>,
    pub ttl_secs: Option<u64>,
}

/// Per-account distributed lock manager
pub struct AccountLockManager {
    store: Arc<dyn CoordinationStore>,
    config: LockConfig,
}

impl AccountLockManager {
    pub fn new(store: Arc<dyn CoordinationStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// Standardized lock key for a broker account
    pub fn lock_key(account_id: &str) -> String {
        format!("account_lock:{}", account_id)
    }

    /// Acquire the lock for `account_id`, retrying with backoff and jitter.
    pub async fn acquire(&self, account_id: &str) -> LockAcquisition {
        self.acquire_key(&Self::lock_key(account_id)).await
    }

    async fn acquire_key(&self, key: &str) -> LockAcquisition {
        let token = Uuid::new_v4().to_string();
        let ttl = Duration::from_secs(self.config.ttl_secs);

        for attempt in 0..self.config.max_retries {
            match self.store.set_nx_ex(key, &token, ttl).await {
                Ok(true) => {
                    debug!("Lock acquired: {} (attempt {})", key, attempt + 1);
                    return LockAcquisition::Acquired(self.guard(key, token, true));
                }
                Ok(false) => {
                    // Retry case: the key may already hold our token.
                    if let Ok(Some(current)) = self.store.get(key).await {
                        if current == token {
                            debug!("Lock already held by us: {}", key);
                            return LockAcquisition::Acquired(self.guard(key, token, true));
                        }
                    }
                }
                Err(StoreError::Unavailable(e)) => {
                    warn!(
                        "Store unavailable for lock {}, failing open without mutual exclusion: {}",
                        key, e
                    );
                    return LockAcquisition::Degraded(self.guard(key, token, false));
                }
                Err(e) => {
                    warn!("Store error acquiring lock {}: {}", key, e);
                }
            }

            if attempt + 1 < self.config.max_retries {
                let delay = self.backoff_delay(attempt + 1);
                debug!(
                    "Lock attempt {} failed for {}, retrying in {:?}",
                    attempt + 1,
                    key,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        warn!(
            "Failed to acquire lock after {} attempts: {}",
            self.config.max_retries, key
        );
        LockAcquisition::Contended
    }

    fn guard(&self, key: &str, token: String, real: bool) -> LockGuard {
        LockGuard {
            store: self.store.clone(),
            key: key.to_string(),
            token,
            real,
            released: false,
        }
    }

    // Exponential backoff with jitter. Contending acquirers race, there
    // is no fairness queue.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_delay_ms * 2u64.saturating_pow(attempt);
        let jitter = rand::thread_rng().gen_range(0..=self.config.retry_delay_ms);
        Duration::from_millis(base + jitter)
    }

    /// Run `op` under the account lock, always releasing afterward.
    ///
    /// Surfaces `LockContended` when the lock could not be acquired;
    /// the caller decides whether to retry or abort.
    pub async fn with_account_lock<T, F, Fut>(
        &self,
        account_id: &str,
        operation_name: &str,
        op: F,
    ) -> crate::error::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        info!(
            "Acquiring lock for account {} ({})",
            account_id, operation_name
        );
        let started = std::time::Instant::now();

        let guard = match self.acquire(account_id).await {
            LockAcquisition::Acquired(g) => g,
            LockAcquisition::Degraded(g) => g,
            LockAcquisition::Contended => {
                warn!(
                    "Could not lock account {} ({})",
                    account_id, operation_name
                );
                return Err(crate::error::GuardrailError::LockContended {
                    key: Self::lock_key(account_id),
                    attempts: self.config.max_retries,
                });
            }
        };

        let result = op().await;

        let released = guard.release().await;
        if released {
            info!(
                "Lock released for account {} after {:?} ({})",
                account_id,
                started.elapsed(),
                operation_name
            );
        }
        Ok(result)
    }

    /// Inspect the lock key for an account
    pub async fn get_lock_info(&self, account_id: &str) -> LockInfo {
        let key = Self::lock_key(account_id);
        let owner_token = self.store.get(&key).await.ok().flatten();
        let ttl_secs = self.store.ttl(&key).await.ok().flatten();
        LockInfo {
            locked: owner_token.is_some(),
            key,
            owner_token,
            ttl_secs,
        }
    }

    /// Force unlock an account (admin operation, bypasses ownership)
    pub async fn force_unlock(&self, account_id: &str) -> bool {
        let key = Self::lock_key(account_id);
        match self.store.del(&key).await {
            Ok(removed) => {
                info!("Force unlocked account {}, removed: {}", account_id, removed);
                removed
            }
            Err(e) => {
                warn!("Failed to force unlock account {}: {}", account_id, e);
                false
            }
        }
    }
}
