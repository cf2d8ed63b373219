use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub rollback: RollbackConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub connections: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL; empty disables persistence (memory-only mode)
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    5
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock TTL in seconds (key expiry while held)
    pub ttl_secs: u64,
    /// Initial delay between acquisition attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Maximum acquisition attempts before reporting contention
    pub max_retries: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            retry_delay_ms: 100,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures within the sliding window to open the circuit
    pub failure_threshold: u32,
    /// Seconds to wait after the last failure before probing recovery
    pub recovery_timeout_secs: u64,
    /// Timeout applied to calls while half-open, in seconds
    pub half_open_call_timeout_secs: u64,
    /// Consecutive half-open successes needed to close
    pub success_threshold: u32,
    /// Size of the sliding outcome window
    pub sliding_window_size: usize,
    /// Minimum observed calls before the circuit may open
    pub min_requests: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            half_open_call_timeout_secs: 30,
            success_threshold: 2,
            sliding_window_size: 10,
            min_requests: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Default retry budget per compensation step
    pub default_max_retries: u32,
    /// Base backoff between step retries in milliseconds
    pub retry_backoff_ms: u64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            retry_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Interval between worker heartbeats in seconds
    pub heartbeat_interval_secs: u64,
    /// TTL of the worker heartbeat key in seconds
    pub heartbeat_ttl_secs: u64,
    /// TTL of mirrored task records in seconds
    pub task_ttl_secs: u64,
    /// Minimum age before a heartbeat-less task counts as orphaned
    pub orphan_grace_secs: u64,
    /// Maximum time to wait for active tasks during shutdown
    pub drain_timeout_secs: u64,
    /// Poll interval while draining, in milliseconds
    pub drain_poll_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            heartbeat_ttl_secs: 60,
            task_ttl_secs: 300,
            orphan_grace_secs: 120,
            drain_timeout_secs: 30,
            drain_poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Fallback rate-limit window for alert types without a specific one
    pub default_rate_limit_secs: u64,
    /// Days to keep persisted alerts and counters
    pub retention_days: u64,
    /// Length cap of the recent-alerts list
    pub recent_alerts_cap: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            default_rate_limit_secs: 60,
            retention_days: 7,
            recent_alerts_cap: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Interval between outbound pings per connection, in seconds
    pub heartbeat_interval_secs: u64,
    /// Consecutive missed heartbeats before forced disconnect
    pub max_missed: u32,
    /// Age of last activity before the stale sweep disconnects, in seconds
    pub stale_max_age_secs: u64,
    /// WebSocket listen address for the worker binary
    #[serde(default)]
    pub listen_addr: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            max_missed: 3,
            stale_max_age_secs: 3600,
            listen_addr: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (overridden by RUST_LOG)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file plus GUARDRAIL_* env overrides
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix("GUARDRAIL").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.lock.ttl_secs, 30);
        assert_eq!(cfg.lock.max_retries, 3);
        assert_eq!(cfg.breaker.sliding_window_size, 10);
        assert_eq!(cfg.breaker.min_requests, 3);
        assert_eq!(cfg.registry.task_ttl_secs, 300);
        assert_eq!(cfg.registry.heartbeat_ttl_secs, 60);
        assert_eq!(cfg.registry.orphan_grace_secs, 120);
        assert_eq!(cfg.alerts.recent_alerts_cap, 100);
        assert_eq!(cfg.connections.max_missed, 3);
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let cfg = AppConfig::load(Path::new("does-not-exist.toml")).unwrap();
        assert_eq!(cfg.lock.ttl_secs, 30);
        assert!(cfg.store.redis_url.is_none());
    }
}
