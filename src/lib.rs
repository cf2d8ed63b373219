pub mod config;
pub mod connection;
pub mod coordination;
pub mod error;
pub mod services;
pub mod store;
pub mod supervisor;

pub use config::AppConfig;
pub use connection::{ClientHandle, ConnectionManager, Envelope};
pub use coordination::{
    AccountLockManager, CircuitBreaker, CircuitBreakerRegistry, CircuitState, LockAcquisition,
    LockGuard, RollbackManager, TaskRegistry, TransactionHandle,
};
pub use error::{GuardrailError, Result};
pub use services::CoreServices;
pub use store::{CoordinationStore, MemoryStore, RedisStore, StoreError};
pub use supervisor::{AlertManager, AlertSeverity, AlertType};
