//! Service wiring and admin surface
//!
//! Constructs the coordination store and every manager explicitly so a
//! process owns exactly one instance of each. Nothing here is a global;
//! tests wire the same struct against an in-memory store.

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::connection::{ConnectionManager, ConnectionStats};
use crate::coordination::{
    AccountLockManager, CircuitBreakerRegistry, CircuitBreakerStats, LockInfo, OrphanReport,
    RegistryStats, RollbackManager, RollbackSummary, TaskRegistry, TransactionInfo,
};
use crate::error::Result;
use crate::store::{CoordinationStore, RedisStore};
use crate::supervisor::AlertManager;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// All coordination services for one worker process
pub struct CoreServices {
    pub config: AppConfig,
    pub store: Arc<dyn CoordinationStore>,
    pub locks: Arc<AccountLockManager>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub rollbacks: Arc<RollbackManager>,
    pub registry: Arc<TaskRegistry>,
    pub alerts: Arc<AlertManager>,
    pub connections: ConnectionManager,
}

impl CoreServices {
    /// Connect the store and build every manager.
    pub async fn init(config: AppConfig) -> Result<Self> {
        let url = config
            .store
            .redis_url
            .clone()
            .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());
        let store: Arc<dyn CoordinationStore> = Arc::new(RedisStore::connect(&url).await?);
        info!("Coordination store connected");
        Ok(Self::with_store(config, store))
    }

    /// Wire managers onto an existing store. Used by tests and by
    /// callers that manage their own store connection.
    pub fn with_store(config: AppConfig, store: Arc<dyn CoordinationStore>) -> Self {
        let locks = Arc::new(AccountLockManager::new(store.clone(), config.lock.clone()));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
        let rollbacks = Arc::new(RollbackManager::new(config.rollback.clone()));
        let registry = Arc::new(TaskRegistry::new(store.clone(), config.registry.clone()));
        let alerts = Arc::new(AlertManager::new(store.clone(), config.alerts.clone()));
        let connections = ConnectionManager::new(config.connections.clone());

        Self {
            config,
            store,
            locks,
            breakers,
            rollbacks,
            registry,
            alerts,
            connections,
        }
    }

    /// Start background work: worker heartbeat and the startup orphan
    /// sweep. Orphans found at startup raise critical alerts.
    pub async fn start(&self) -> Vec<OrphanReport> {
        let orphans = self.registry.start().await;
        for report in &orphans {
            self.alerts
                .orphaned_task(&report.task, report.age_secs)
                .await;
        }
        if !orphans.is_empty() {
            warn!("Recovered {} orphaned task(s) at startup", orphans.len());
        }
        orphans
    }

    /// Graceful shutdown: drain tracked tasks, then tear down
    /// client connections.
    pub async fn close(&self) {
        self.registry.shutdown().await;

        let stats = self.connections.connection_stats().await;
        for user_id in stats.connected_users {
            self.connections
                .disconnect(&user_id, "server shutting down")
                .await;
        }
        info!("Core services closed");
    }

    // Admin surface. Thin delegates so operators reach every manager
    // through one place.

    pub async fn force_unlock(&self, account_id: &str) -> bool {
        self.locks.force_unlock(account_id).await
    }

    pub async fn get_lock_info(&self, account_id: &str) -> LockInfo {
        self.locks.get_lock_info(account_id).await
    }

    pub async fn reset_circuit_breaker(&self, name: &str) -> bool {
        self.breakers.reset(name).await
    }

    pub async fn get_all_circuit_stats(&self) -> Vec<CircuitBreakerStats> {
        self.breakers.all_stats().await
    }

    pub async fn force_rollback(&self, transaction_id: &str) -> Option<RollbackSummary> {
        self.rollbacks.force_rollback(transaction_id).await
    }

    pub async fn get_active_transactions(&self) -> Vec<TransactionInfo> {
        self.rollbacks.active_transactions().await
    }

    pub async fn get_shutdown_stats(&self) -> RegistryStats {
        self.registry.stats().await
    }

    pub async fn get_connection_stats(&self) -> ConnectionStats {
        self.connections.connection_stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn wires_every_manager_against_one_store() {
        let store = Arc::new(MemoryStore::new());
        let services = CoreServices::with_store(AppConfig::default(), store);

        let acquired = services.locks.acquire("acct-1").await;
        assert!(acquired.is_acquired());
        let info = services.get_lock_info("acct-1").await;
        assert!(info.locked);

        assert!(services.force_unlock("acct-1").await);
        assert!(!services.get_lock_info("acct-1").await.locked);
    }

    #[tokio::test]
    async fn admin_surface_reaches_breakers_and_transactions() {
        let store = Arc::new(MemoryStore::new());
        let services = CoreServices::with_store(AppConfig::default(), store);

        let _ = services
            .breakers
            .execute("broker_api", async { Ok::<_, crate::error::GuardrailError>(1u32) })
            .await;
        let stats = services.get_all_circuit_stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].name, "broker_api");

        assert!(services.get_active_transactions().await.is_empty());
        assert!(services.force_rollback("missing").await.is_none());
    }
}
