//! Rollback Manager for Failed Trading Operations
//!
//! A unit of work opens a transaction context, registers compensation
//! steps as it makes side effects, and runs normally. Nothing executes
//! on success; on failure the registered steps run in ascending
//! order-key order (database rollback before broker-order cancellation
//! before notifications), each with its own retry budget. The original
//! error is always returned after compensation, whatever the
//! compensation outcome.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RollbackConfig;
use crate::error::Result;

/// Kinds of compensation actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackAction {
    DatabaseRollback,
    BrokerOrderCancel,
    CustomCleanup,
    NotificationSend,
}

impl std::fmt::Display for RollbackAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackAction::DatabaseRollback => write!(f, "database_rollback"),
            RollbackAction::BrokerOrderCancel => write!(f, "broker_order_cancel"),
            RollbackAction::CustomCleanup => write!(f, "custom_cleanup"),
            RollbackAction::NotificationSend => write!(f, "notification_send"),
        }
    }
}

/// Async compensation callback; returns true on success
pub type StepCallback = Box<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// A single registered compensation step
pub struct RollbackStep {
    pub action: RollbackAction,
    pub description: String,
    callback: StepCallback,
    /// Lower order keys execute first
    pub order_key: i32,
    pub max_retries: u32,
    pub executed: bool,
    pub success: bool,
}

struct ContextInner {
    transaction_id: String,
    operation_type: String,
    correlation_id: Option<String>,
    started_at: DateTime<Utc>,
    steps: Vec<RollbackStep>,
    completed: bool,
    success: bool,
    error_message: Option<String>,
}

/// Handle for registering compensation steps inside a running transaction
#[derive(Clone)]
pub struct TransactionHandle {
    inner: Arc<Mutex<ContextInner>>,
    default_max_retries: u32,
}

impl TransactionHandle {
    /// Transaction id, usable for `force_rollback`
    pub async fn transaction_id(&self) -> String {
        self.inner.lock().await.transaction_id.clone()
    }

    /// Register a compensation step to run if the transaction fails
    pub async fn add_step<F, Fut>(
        &self,
        action: RollbackAction,
        description: &str,
        order_key: i32,
        max_retries: Option<u32>,
        callback: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let step = RollbackStep {
            action,
            description: description.to_string(),
            callback: Box::new(move || Box::pin(callback())),
            order_key,
            max_retries: max_retries.unwrap_or(self.default_max_retries),
            executed: false,
            success: false,
        };

        let mut inner = self.inner.lock().await;
        debug!(
            "Added rollback step to {}: {} (order {})",
            inner.transaction_id, description, order_key
        );
        inner.steps.push(step);
    }

    /// Register a broker-order cancellation (runs after database rollback)
    pub async fn add_broker_order_cancel<F, Fut>(&self, order_id: &str, cancel: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.add_step(
            RollbackAction::BrokerOrderCancel,
            &format!("Cancel broker order: {}", order_id),
            1,
            None,
            cancel,
        )
        .await;
    }

    /// Register an operator notification (runs last)
    pub async fn add_notification<F, Fut>(&self, description: &str, notify: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.add_step(RollbackAction::NotificationSend, description, 99, None, notify)
            .await;
    }
}

/// Aggregated outcome of a compensation run
#[derive(Debug, Clone, Serialize)]
pub struct RollbackSummary {
    pub transaction_id: String,
    pub total_steps: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Snapshot of a still-open transaction (admin surface)
#[derive(Debug, Clone, Serialize)]
pub struct TransactionInfo {
    pub transaction_id: String,
    pub operation_type: String,
    pub correlation_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub age_secs: i64,
    pub rollback_steps: usize,
    pub completed: bool,
    pub success: bool,
}

/// Manages transactional units of work and their compensation
pub struct RollbackManager {
    config: RollbackConfig,
    active: RwLock<HashMap<String, Arc<Mutex<ContextInner>>>>,
}

impl RollbackManager {
    pub fn new(config: RollbackConfig) -> Self {
        Self {
            config,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Run `op` as a transactional unit of work.
    ///
    /// On `Ok` the context is discarded without executing any step. On
    /// `Err` every registered step runs in ascending order-key order and
    /// the original error is returned afterward.
    pub async fn run<T, F, Fut>(
        &self,
        operation_type: &str,
        transaction_id: Option<String>,
        correlation_id: Option<String>,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce(TransactionHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let transaction_id = transaction_id
            .unwrap_or_else(|| format!("{}_{}", operation_type, Uuid::new_v4().simple()));

        let inner = Arc::new(Mutex::new(ContextInner {
            transaction_id: transaction_id.clone(),
            operation_type: operation_type.to_string(),
            correlation_id,
            started_at: Utc::now(),
            steps: Vec::new(),
            completed: false,
            success: false,
            error_message: None,
        }));

        self.active
            .write()
            .await
            .insert(transaction_id.clone(), inner.clone());

        info!(
            "Started transaction context: {} [{}]",
            operation_type, transaction_id
        );

        let handle = TransactionHandle {
            inner: inner.clone(),
            default_max_retries: self.config.default_max_retries,
        };

        let result = op(handle).await;

        match &result {
            Ok(_) => {
                let mut ctx = inner.lock().await;
                ctx.completed = true;
                ctx.success = true;
                info!(
                    "Transaction completed successfully: {} [{}]",
                    operation_type, transaction_id
                );
            }
            Err(e) => {
                {
                    let mut ctx = inner.lock().await;
                    ctx.completed = true;
                    ctx.success = false;
                    ctx.error_message = Some(e.to_string());
                }
                error!(
                    "Transaction failed: {} [{}] - {}",
                    operation_type, transaction_id, e
                );
                self.execute_rollback(&inner).await;
            }
        }

        self.active.write().await.remove(&transaction_id);
        result
    }

    /// Execute the registered steps of a context, ascending order key.
    ///
    /// Idempotent per step: anything already executed successfully is
    /// skipped, so a `force_rollback` racing the normal failure path
    /// never compensates twice.
    async fn execute_rollback(&self, inner: &Arc<Mutex<ContextInner>>) -> RollbackSummary {
        let mut ctx = inner.lock().await;
        let transaction_id = ctx.transaction_id.clone();

        if ctx.steps.is_empty() {
            info!("No rollback steps to execute for {}", transaction_id);
            return RollbackSummary {
                transaction_id,
                total_steps: 0,
                succeeded: 0,
                failed: 0,
                errors: Vec::new(),
            };
        }

        warn!(
            "Executing rollback for {} with {} step(s)",
            transaction_id,
            ctx.steps.len()
        );

        let mut order: Vec<usize> = (0..ctx.steps.len()).collect();
        order.sort_by_key(|&i| ctx.steps[i].order_key);

        let mut errors = Vec::new();
        let mut succeeded = 0usize;

        for i in order {
            let step = &ctx.steps[i];
            if step.executed && step.success {
                debug!("Skipping already-compensated step: {}", step.description);
                succeeded += 1;
                continue;
            }

            info!("Executing rollback step: {}", step.description);
            let max_retries = step.max_retries.max(1);
            let mut success = false;

            for attempt in 0..max_retries {
                success = (step.callback)().await;
                if success {
                    break;
                }
                if attempt + 1 < max_retries {
                    warn!(
                        "Rollback step attempt {} failed, retrying: {}",
                        attempt + 1,
                        step.description
                    );
                    tokio::time::sleep(Duration::from_millis(
                        self.config.retry_backoff_ms * (attempt as u64 + 1),
                    ))
                    .await;
                }
            }

            let step = &mut ctx.steps[i];
            step.executed = true;
            step.success = success;

            if success {
                succeeded += 1;
                info!("Rollback step completed: {}", step.description);
            } else {
                let msg = format!(
                    "Rollback step failed after {} attempt(s): {}",
                    max_retries, step.description
                );
                error!("{}", msg);
                errors.push(msg);
            }
        }

        let summary = RollbackSummary {
            transaction_id: transaction_id.clone(),
            total_steps: ctx.steps.len(),
            succeeded,
            failed: errors.len(),
            errors,
        };

        if summary.failed > 0 {
            error!(
                "Rollback completed with errors for {}: {}/{} steps successful",
                transaction_id, summary.succeeded, summary.total_steps
            );
        } else {
            info!(
                "Rollback completed for {}: {}/{} steps successful",
                transaction_id, summary.succeeded, summary.total_steps
            );
        }

        summary
    }

    /// Force compensation of a still-open transaction (admin operation).
    ///
    /// Used for stuck operations. Steps that already compensated are
    /// skipped, so this is safe to race against the normal failure path.
    pub async fn force_rollback(&self, transaction_id: &str) -> Option<RollbackSummary> {
        let inner = {
            let active = self.active.read().await;
            active.get(transaction_id).cloned()
        };

        let inner = match inner {
            Some(inner) => inner,
            None => {
                warn!(
                    "Cannot force rollback, transaction not found: {}",
                    transaction_id
                );
                return None;
            }
        };

        warn!("Force rolling back transaction: {}", transaction_id);
        {
            let mut ctx = inner.lock().await;
            ctx.completed = true;
            ctx.success = false;
            ctx.error_message = Some("Force rollback requested".to_string());
        }

        Some(self.execute_rollback(&inner).await)
    }

    /// Snapshot of open transactions
    pub async fn active_transactions(&self) -> Vec<TransactionInfo> {
        let active = self.active.read().await;
        let mut out = Vec::with_capacity(active.len());
        for ctx in active.values() {
            let ctx = ctx.lock().await;
            out.push(TransactionInfo {
                transaction_id: ctx.transaction_id.clone(),
                operation_type: ctx.operation_type.clone(),
                correlation_id: ctx.correlation_id.clone(),
                started_at: ctx.started_at,
                age_secs: Utc::now()
                    .signed_duration_since(ctx.started_at)
                    .num_seconds(),
                rollback_steps: ctx.steps.len(),
                completed: ctx.completed,
                success: ctx.success,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GuardrailError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn manager() -> RollbackManager {
        RollbackManager::new(RollbackConfig {
            default_max_retries: 3,
            retry_backoff_ms: 1,
        })
    }

    #[tokio::test]
    async fn success_runs_no_steps() {
        let mgr = manager();
        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = ran.clone();

        let result: Result<u32> = mgr
            .run("order_entry", None, None, |txn| async move {
                txn.add_step(RollbackAction::CustomCleanup, "cleanup", 0, None, move || {
                    let ran = ran2.clone();
                    async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        true
                    }
                })
                .await;
                Ok(42)
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(mgr.active_transactions().await.is_empty());
    }

    #[tokio::test]
    async fn failure_runs_steps_in_order_key_order() {
        let mgr = manager();
        let sequence = Arc::new(Mutex::new(Vec::new()));

        let seq = sequence.clone();
        let result: Result<()> = mgr
            .run("strategy_execution", None, None, |txn| {
                let seq = seq.clone();
                async move {
                    for (order_key, label) in [(5, "notify"), (1, "db"), (3, "cancel")] {
                        let seq = seq.clone();
                        txn.add_step(
                            RollbackAction::CustomCleanup,
                            label,
                            order_key,
                            None,
                            move || {
                                let seq = seq.clone();
                                async move {
                                    seq.lock().await.push(order_key);
                                    true
                                }
                            },
                        )
                        .await;
                    }
                    Err(GuardrailError::Internal("order submit failed".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(*sequence.lock().await, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn failing_step_retries_then_reports() {
        let mgr = manager();
        let attempts = Arc::new(AtomicU32::new(0));

        let attempts2 = attempts.clone();
        let result: Result<()> = mgr
            .run("order_entry", None, None, |txn| {
                let attempts2 = attempts2.clone();
                async move {
                    txn.add_step(
                        RollbackAction::BrokerOrderCancel,
                        "cancel order",
                        0,
                        Some(3),
                        move || {
                            let attempts = attempts2.clone();
                            async move {
                                attempts.fetch_add(1, Ordering::SeqCst);
                                false
                            }
                        },
                    )
                    .await;
                    Err(GuardrailError::Internal("boom".into()))
                }
            })
            .await;

        // Original error surfaces even though compensation failed.
        assert!(matches!(result, Err(GuardrailError::Internal(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn force_rollback_is_idempotent() {
        let mgr = Arc::new(manager());
        let ran = Arc::new(AtomicU32::new(0));

        let mgr2 = mgr.clone();
        let ran2 = ran.clone();
        let result: Result<()> = mgr
            .run(
                "hung_operation",
                Some("txn-1".to_string()),
                None,
                |txn| async move {
                    let ran = ran2.clone();
                    txn.add_step(RollbackAction::CustomCleanup, "undo", 0, None, move || {
                        let ran = ran.clone();
                        async move {
                            ran.fetch_add(1, Ordering::SeqCst);
                            true
                        }
                    })
                    .await;

                    // Admin forces compensation while the operation hangs.
                    let first = mgr2.force_rollback("txn-1").await.unwrap();
                    assert_eq!(first.succeeded, 1);
                    let second = mgr2.force_rollback("txn-1").await.unwrap();
                    assert_eq!(second.succeeded, 1);

                    Err(GuardrailError::Internal("gave up".into()))
                },
            )
            .await;

        assert!(result.is_err());
        // Step ran exactly once across force rollbacks and the failure path.
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_transaction_force_rollback_returns_none() {
        let mgr = manager();
        assert!(mgr.force_rollback("missing").await.is_none());
    }
}
