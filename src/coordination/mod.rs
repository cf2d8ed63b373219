//! Coordination Layer for Multi-Worker Trading Operation
//!
//! Everything that makes concurrent, failure-prone trading operations
//! safe across independent workers:
//! - Distributed per-account locking
//! - Circuit breakers around flaky downstream calls
//! - Ordered rollback/compensation for partial failures
//! - Task tracking, worker heartbeats and orphan recovery

pub mod breaker;
pub mod lock;
pub mod registry;
pub mod rollback;

pub use breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState};
pub use lock::{AccountLockManager, LockAcquisition, LockGuard, LockInfo};
pub use registry::{OrphanReport, RegistryStats, TaskGuard, TaskRegistry, WorkerTask};
pub use rollback::{
    RollbackAction, RollbackManager, RollbackSummary, TransactionHandle, TransactionInfo,
};
