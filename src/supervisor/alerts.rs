//! Alert Manager for Trading System Monitoring
//!
//! Deduplicated, rate-limited fault reporting. Delivered alerts are
//! logged at a severity-mapped level and persisted to the coordination
//! store for dashboards; persistence is best-effort, so a store outage
//! only drops the dashboard copy, never the log line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AlertConfig;
use crate::store::CoordinationStore;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Types of alerts raised by the coordination core and its callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    WorkerCrash,
    WorkerMemoryHigh,
    TradingFailure,
    StrategyFailure,
    CircuitBreakerOpen,
    DatabaseError,
    StoreUnavailable,
    WebhookFailure,
    OrderExecutionFailed,
    RollbackFailure,
    SystemOverload,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::WorkerCrash => "worker_crash",
            AlertType::WorkerMemoryHigh => "worker_memory_high",
            AlertType::TradingFailure => "trading_failure",
            AlertType::StrategyFailure => "strategy_failure",
            AlertType::CircuitBreakerOpen => "circuit_breaker_open",
            AlertType::DatabaseError => "database_error",
            AlertType::StoreUnavailable => "store_unavailable",
            AlertType::WebhookFailure => "webhook_failure",
            AlertType::OrderExecutionFailed => "order_execution_failed",
            AlertType::RollbackFailure => "rollback_failure",
            AlertType::SystemOverload => "system_overload",
        }
    }

    /// Type-specific rate-limit window; None falls back to the
    /// configured default
    pub fn rate_limit_secs(&self) -> Option<u64> {
        match self {
            AlertType::WorkerMemoryHigh => Some(300),
            AlertType::TradingFailure => Some(30),
            AlertType::CircuitBreakerOpen => Some(300),
            AlertType::StoreUnavailable => Some(300),
            AlertType::WebhookFailure => Some(30),
            AlertType::OrderExecutionFailed => Some(30),
            AlertType::SystemOverload => Some(300),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A system alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub context_data: serde_json::Value,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    pub resolved: bool,
}

/// Result of a send attempt
#[derive(Debug, Clone)]
pub enum AlertOutcome {
    Delivered(Alert),
    /// Duplicate inside the rate-limit window, dropped
    Suppressed,
}

impl AlertOutcome {
    pub fn delivered(&self) -> Option<&Alert> {
        match self {
            AlertOutcome::Delivered(a) => Some(a),
            AlertOutcome::Suppressed => None,
        }
    }
}

#[derive(Debug)]
struct RateLimitState {
    last_sent: DateTime<Utc>,
    suppressed_count: u32,
}

/// Alert statistics (admin surface)
#[derive(Debug, Clone, Serialize)]
pub struct AlertStats {
    pub active_alerts: usize,
    pub severity_breakdown: HashMap<String, usize>,
    pub type_breakdown: HashMap<String, usize>,
    pub rate_limited_keys: usize,
}

/// Manages system alerts with rate limiting and store persistence
pub struct AlertManager {
    config: AlertConfig,
    store: Arc<dyn CoordinationStore>,
    active: RwLock<HashMap<String, Alert>>,
    rate_limits: RwLock<HashMap<String, RateLimitState>>,
    event_tx: tokio::sync::broadcast::Sender<Alert>,
}

impl AlertManager {
    pub fn new(store: Arc<dyn CoordinationStore>, config: AlertConfig) -> Self {
        let (event_tx, _) = tokio::sync::broadcast::channel(64);
        Self {
            config,
            store,
            active: RwLock::new(HashMap::new()),
            rate_limits: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    /// Subscribe to delivered alerts (in-process consumers)
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Alert> {
        self.event_tx.subscribe()
    }

    /// Send an alert, applying per-(type, id) rate limiting.
    pub async fn send_alert(
        &self,
        alert_type: AlertType,
        severity: AlertSeverity,
        title: &str,
        message: &str,
        context_data: serde_json::Value,
        alert_id: Option<String>,
    ) -> AlertOutcome {
        if self.is_rate_limited(alert_type, alert_id.as_deref()).await {
            debug!("Alert rate limited: {}", alert_type);
            return AlertOutcome::Suppressed;
        }

        let alert_id = alert_id
            .unwrap_or_else(|| format!("{}_{}", alert_type, Uuid::new_v4().simple()));
        let alert = Alert {
            alert_id: alert_id.clone(),
            alert_type,
            severity,
            title: title.to_string(),
            message: message.to_string(),
            context_data,
            correlation_id: None,
            timestamp: Utc::now(),
            acknowledged: false,
            resolved: false,
        };

        self.active.write().await.insert(alert_id, alert.clone());

        self.log_alert(&alert);
        self.persist_alert(&alert, true).await;
        let _ = self.event_tx.send(alert.clone());

        AlertOutcome::Delivered(alert)
    }

    async fn is_rate_limited(&self, alert_type: AlertType, alert_id: Option<&str>) -> bool {
        let key = match alert_id {
            Some(id) => format!("{}:{}", alert_type, id),
            None => alert_type.as_str().to_string(),
        };
        let window = alert_type
            .rate_limit_secs()
            .unwrap_or(self.config.default_rate_limit_secs)
            .max(1);
        let now = Utc::now();

        let mut limits = self.rate_limits.write().await;
        if let Some(state) = limits.get_mut(&key) {
            let elapsed = now.signed_duration_since(state.last_sent).num_seconds();
            if (elapsed as u64) < window && elapsed >= 0 {
                state.suppressed_count += 1;
                return true;
            }
            state.last_sent = now;
            state.suppressed_count = 0;
        } else {
            limits.insert(
                key,
                RateLimitState {
                    last_sent: now,
                    suppressed_count: 0,
                },
            );
        }
        false
    }

    fn log_alert(&self, alert: &Alert) {
        let line = format!(
            "ALERT [{}] {}: {} - {}",
            alert.severity.as_str().to_uppercase(),
            alert.alert_type,
            alert.title,
            alert.message
        );
        match alert.severity {
            AlertSeverity::Low => info!("{}", line),
            AlertSeverity::Medium => warn!("{}", line),
            AlertSeverity::High => error!("{}", line),
            AlertSeverity::Critical => error!("CRITICAL {}", line),
        }
    }

    // Persist the alert record, the recent list, and the daily counters.
    // Counters increment only on first delivery, not on state updates.
    async fn persist_alert(&self, alert: &Alert, count: bool) {
        let payload = match serde_json::to_string(alert) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to encode alert {}: {}", alert.alert_id, e);
                return;
            }
        };

        let retention = Duration::from_secs(self.config.retention_days * 24 * 3600);
        let alert_key = format!("alert:{}", alert.alert_id);
        if let Err(e) = self.store.set_ex(&alert_key, &payload, retention).await {
            warn!("Failed to persist alert {}: {}", alert.alert_id, e);
            return;
        }

        if count {
            let _ = self
                .store
                .lpush_trim("recent_alerts", &alert.alert_id, self.config.recent_alerts_cap)
                .await;

            let today = alert.timestamp.format("%Y-%m-%d");
            for counter_key in [
                format!("alert_count:type:{}:{}", alert.alert_type, today),
                format!("alert_count:severity:{}:{}", alert.severity, today),
            ] {
                if self.store.incr(&counter_key).await.is_ok() {
                    let _ = self.store.expire(&counter_key, retention).await;
                }
            }
        }

        debug!("Persisted alert {}", alert.alert_id);
    }

    /// Acknowledge an alert
    pub async fn acknowledge(&self, alert_id: &str, by: &str) -> bool {
        let updated = {
            let mut active = self.active.write().await;
            match active.get_mut(alert_id) {
                Some(alert) => {
                    alert.acknowledged = true;
                    Some(alert.clone())
                }
                None => None,
            }
        };

        match updated {
            Some(alert) => {
                info!("Alert acknowledged: {} by {}", alert_id, by);
                self.persist_alert(&alert, false).await;
                true
            }
            None => false,
        }
    }

    /// Resolve an alert, removing it from the active set
    pub async fn resolve(&self, alert_id: &str, by: &str) -> bool {
        let resolved = {
            let mut active = self.active.write().await;
            match active.remove(alert_id) {
                Some(mut alert) => {
                    alert.resolved = true;
                    alert.acknowledged = true;
                    Some(alert)
                }
                None => None,
            }
        };

        match resolved {
            Some(alert) => {
                info!("Alert resolved: {} by {}", alert_id, by);
                self.persist_alert(&alert, false).await;
                true
            }
            None => false,
        }
    }

    /// Active alerts, newest first, optionally filtered by severity
    pub async fn active_alerts(&self, severity: Option<AlertSeverity>) -> Vec<Alert> {
        let active = self.active.read().await;
        let mut alerts: Vec<Alert> = active
            .values()
            .filter(|a| severity.map_or(true, |s| a.severity == s))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        alerts
    }

    pub async fn stats(&self) -> AlertStats {
        let active = self.active.read().await;
        let mut severity_breakdown: HashMap<String, usize> = HashMap::new();
        let mut type_breakdown: HashMap<String, usize> = HashMap::new();
        for alert in active.values() {
            *severity_breakdown
                .entry(alert.severity.as_str().to_string())
                .or_insert(0) += 1;
            *type_breakdown
                .entry(alert.alert_type.as_str().to_string())
                .or_insert(0) += 1;
        }
        AlertStats {
            active_alerts: active.len(),
            severity_breakdown,
            type_breakdown,
            rate_limited_keys: self.rate_limits.read().await.len(),
        }
    }

    /// Suppressed counts per rate-limit key (observability helper)
    pub async fn suppressed_counts(&self) -> HashMap<String, u32> {
        let limits = self.rate_limits.read().await;
        limits
            .iter()
            .filter(|(_, s)| s.suppressed_count > 0)
            .map(|(k, s)| (k.clone(), s.suppressed_count))
            .collect()
    }

    // Common trading-system alerts, mirrored across call sites.

    pub async fn trading_failure(&self, strategy_id: &str, account_id: &str, error: &str) {
        self.send_alert(
            AlertType::TradingFailure,
            AlertSeverity::High,
            "Trading Operation Failed",
            &format!(
                "Strategy {} failed on account {}: {}",
                strategy_id, account_id, error
            ),
            serde_json::json!({
                "strategy_id": strategy_id,
                "account_id": account_id,
                "error": error,
            }),
            None,
        )
        .await;
    }

    pub async fn circuit_breaker_opened(&self, name: &str, failure_ratio: f64) {
        self.send_alert(
            AlertType::CircuitBreakerOpen,
            AlertSeverity::High,
            "Circuit Breaker Opened",
            &format!(
                "Circuit breaker '{}' opened at failure ratio {:.2}",
                name, failure_ratio
            ),
            serde_json::json!({ "circuit_name": name, "failure_ratio": failure_ratio }),
            Some(format!("circuit_breaker_open_{}", name)),
        )
        .await;
    }

    pub async fn rollback_failure(&self, transaction_id: &str, operation_type: &str, error: &str) {
        self.send_alert(
            AlertType::RollbackFailure,
            AlertSeverity::Critical,
            "Transaction Rollback Failed",
            &format!(
                "Failed to roll back {} transaction {}: {}",
                operation_type, transaction_id, error
            ),
            serde_json::json!({
                "transaction_id": transaction_id,
                "operation_type": operation_type,
                "error": error,
            }),
            None,
        )
        .await;
    }

    pub async fn orphaned_task(&self, task: &crate::coordination::WorkerTask, age_secs: i64) {
        self.send_alert(
            AlertType::WorkerCrash,
            AlertSeverity::Critical,
            "Orphaned Task Detected",
            &format!(
                "Task {} [{}] from worker {} orphaned after {}s",
                task.task_type, task.task_id, task.worker_id, age_secs
            ),
            serde_json::json!({
                "task_id": task.task_id,
                "worker_id": task.worker_id,
                "age_secs": age_secs,
            }),
            Some(format!("worker_crash_{}", task.worker_id)),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager(store: Arc<MemoryStore>) -> AlertManager {
        AlertManager::new(store, AlertConfig::default())
    }

    #[tokio::test]
    async fn duplicate_within_window_is_suppressed() {
        let store = Arc::new(MemoryStore::new());
        let alerts = manager(store);

        let first = alerts
            .send_alert(
                AlertType::TradingFailure,
                AlertSeverity::High,
                "Failed",
                "first",
                serde_json::Value::Null,
                None,
            )
            .await;
        assert!(first.delivered().is_some());

        let second = alerts
            .send_alert(
                AlertType::TradingFailure,
                AlertSeverity::High,
                "Failed",
                "second",
                serde_json::Value::Null,
                None,
            )
            .await;
        assert!(matches!(second, AlertOutcome::Suppressed));
        assert_eq!(alerts.suppressed_counts().await.len(), 1);
    }

    #[tokio::test]
    async fn distinct_alert_ids_rate_limit_independently() {
        let store = Arc::new(MemoryStore::new());
        let alerts = manager(store);

        let a = alerts
            .send_alert(
                AlertType::StrategyFailure,
                AlertSeverity::Medium,
                "Strategy failed",
                "s1",
                serde_json::Value::Null,
                Some("strategy_failure_s1".into()),
            )
            .await;
        let b = alerts
            .send_alert(
                AlertType::StrategyFailure,
                AlertSeverity::Medium,
                "Strategy failed",
                "s2",
                serde_json::Value::Null,
                Some("strategy_failure_s2".into()),
            )
            .await;
        assert!(a.delivered().is_some());
        assert!(b.delivered().is_some());
    }

    #[tokio::test]
    async fn delivered_alert_is_persisted_with_counters() {
        let store = Arc::new(MemoryStore::new());
        let alerts = manager(store.clone());

        let outcome = alerts
            .send_alert(
                AlertType::OrderExecutionFailed,
                AlertSeverity::High,
                "Order failed",
                "rejected by broker",
                serde_json::json!({"order_id": "o-1"}),
                Some("order_failed_o1".into()),
            )
            .await;
        let alert = outcome.delivered().unwrap();

        let stored = store
            .get(&format!("alert:{}", alert.alert_id))
            .await
            .unwrap()
            .unwrap();
        let decoded: Alert = serde_json::from_str(&stored).unwrap();
        assert_eq!(decoded.alert_id, "order_failed_o1");

        let recent = store.list("recent_alerts").await;
        assert_eq!(recent, vec!["order_failed_o1".to_string()]);

        let today = Utc::now().format("%Y-%m-%d");
        let counter = store
            .get(&format!("alert_count:type:order_execution_failed:{}", today))
            .await
            .unwrap();
        assert_eq!(counter.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn resolve_removes_from_active_set() {
        let store = Arc::new(MemoryStore::new());
        let alerts = manager(store);

        let outcome = alerts
            .send_alert(
                AlertType::DatabaseError,
                AlertSeverity::Medium,
                "DB down",
                "connection refused",
                serde_json::Value::Null,
                Some("db-1".into()),
            )
            .await;
        assert!(outcome.delivered().is_some());

        assert!(alerts.acknowledge("db-1", "oncall").await);
        assert_eq!(alerts.active_alerts(None).await.len(), 1);

        assert!(alerts.resolve("db-1", "oncall").await);
        assert!(alerts.active_alerts(None).await.is_empty());
        assert!(!alerts.resolve("db-1", "oncall").await);
    }
}
