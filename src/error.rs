use thiserror::Error;

use crate::store::StoreError;

/// Main error type for the coordination core
#[derive(Error, Debug)]
pub enum GuardrailError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Coordination store errors
    #[error("Coordination store error: {0}")]
    Store(#[from] StoreError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Locking errors
    #[error("Lock contended: {key} still held after {attempts} attempts")]
    LockContended { key: String, attempts: u32 },

    // Circuit breaker errors
    #[error("Circuit breaker open: {name}, retry in {retry_in_secs}s")]
    CircuitOpen { name: String, retry_in_secs: u64 },

    #[error("Operation timed out after {elapsed_ms}ms")]
    OperationTimeout { elapsed_ms: u64 },

    // Lifecycle errors
    #[error("Worker is shutting down, new work rejected")]
    ShuttingDown,

    // Connection errors
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for GuardrailError
pub type Result<T> = std::result::Result<T, GuardrailError>;
