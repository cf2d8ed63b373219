//! Per-Operation Circuit Breaker
//!
//! Isolates repeatedly failing downstream calls (a strategy, a broker
//! API) behind a named breaker with sliding-window failure statistics.
//! Breaker state is process-local: each worker fails fast on its own
//! view of a downstream, there is no cross-worker consensus.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::error::{GuardrailError, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls pass through
    Closed,
    /// Failure ratio exceeded - calls rejected
    Open,
    /// Recovery probe - limited calls with a bounded timeout
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    /// Most-recent call outcomes, true = success
    window: VecDeque<bool>,
    consecutive_half_open_successes: u32,
    total_requests: u64,
    blocked_requests: u64,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    state_changed_at: DateTime<Utc>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            consecutive_half_open_successes: 0,
            total_requests: 0,
            blocked_requests: 0,
            last_failure_at: None,
            last_success_at: None,
            state_changed_at: Utc::now(),
        }
    }

    fn failure_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }

    fn push_outcome(&mut self, ok: bool, window_size: usize) {
        if self.window.len() == window_size {
            self.window.pop_front();
        }
        self.window.push_back(ok);
    }
}

/// Circuit breaker for one named downstream operation
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying the open -> half-open timer
    pub async fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().await;
        self.maybe_probe(&mut inner);
        inner.state
    }

    /// Execute `op` under this breaker.
    ///
    /// Rejected immediately with `CircuitOpen` while open; half-open
    /// calls run under the configured timeout and a timeout counts as a
    /// failure.
    pub async fn call<T, Fut>(&self, op: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let half_open = {
            let mut inner = self.inner.lock().await;
            inner.total_requests += 1;
            self.maybe_probe(&mut inner);

            if inner.state == CircuitState::Open {
                inner.blocked_requests += 1;
                let retry_in = self.secs_until_recovery(&inner);
                warn!("Circuit breaker OPEN for {}, blocking call", self.name);
                return Err(GuardrailError::CircuitOpen {
                    name: self.name.clone(),
                    retry_in_secs: retry_in,
                });
            }
            inner.state == CircuitState::HalfOpen
        };

        let result = if half_open {
            let timeout = Duration::from_secs(self.config.half_open_call_timeout_secs);
            let started = std::time::Instant::now();
            match tokio::time::timeout(timeout, op).await {
                Ok(result) => result,
                Err(_) => Err(GuardrailError::OperationTimeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }),
            }
        } else {
            op.await
        };

        match result {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure(&e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Record a successful call outcome
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_success_at = Some(Utc::now());
        inner.push_outcome(true, self.config.sliding_window_size);

        if inner.state == CircuitState::HalfOpen {
            inner.consecutive_half_open_successes += 1;
            if inner.consecutive_half_open_successes >= self.config.success_threshold {
                self.close(&mut inner);
            }
        }
    }

    /// Record a failed call outcome
    pub async fn record_failure(&self, reason: &str) {
        let mut inner = self.inner.lock().await;
        inner.last_failure_at = Some(Utc::now());
        inner.push_outcome(false, self.config.sliding_window_size);
        inner.consecutive_half_open_successes = 0;

        warn!("Circuit breaker {} recorded failure: {}", self.name, reason);

        // Any half-open failure reopens immediately.
        if inner.state == CircuitState::HalfOpen {
            self.open(&mut inner);
            return;
        }

        if inner.state == CircuitState::Closed && self.should_open(&inner) {
            self.open(&mut inner);
        }
    }

    fn should_open(&self, inner: &BreakerInner) -> bool {
        if inner.window.len() < self.config.min_requests {
            return false;
        }
        let threshold =
            self.config.failure_threshold as f64 / self.config.sliding_window_size as f64;
        inner.failure_ratio() >= threshold
    }

    fn open(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            warn!("Opening circuit breaker for {}", self.name);
            inner.state = CircuitState::Open;
            inner.state_changed_at = Utc::now();
        }
    }

    fn close(&self, inner: &mut BreakerInner) {
        info!("Closing circuit breaker for {} - downstream recovered", self.name);
        inner.state = CircuitState::Closed;
        inner.state_changed_at = Utc::now();
        inner.consecutive_half_open_successes = 0;
        inner.window.clear();
    }

    // Open -> HalfOpen once the recovery timeout elapsed since the last failure.
    fn maybe_probe(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = match inner.last_failure_at {
            Some(at) => Utc::now().signed_duration_since(at).num_seconds().max(0) as u64,
            None => return,
        };
        if elapsed >= self.config.recovery_timeout_secs {
            info!("Circuit breaker {} entering HALF-OPEN probe", self.name);
            inner.state = CircuitState::HalfOpen;
            inner.state_changed_at = Utc::now();
            inner.consecutive_half_open_successes = 0;
        }
    }

    fn secs_until_recovery(&self, inner: &BreakerInner) -> u64 {
        match inner.last_failure_at {
            Some(at) => {
                let elapsed = Utc::now().signed_duration_since(at).num_seconds().max(0) as u64;
                self.config.recovery_timeout_secs.saturating_sub(elapsed)
            }
            None => 0,
        }
    }

    /// Force closed and clear the window (admin operation)
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        self.close(&mut inner);
        info!("Manually reset circuit breaker: {}", self.name);
    }

    /// Statistics snapshot for dashboards
    pub async fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock().await;
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_ratio: inner.failure_ratio(),
            window_len: inner.window.len(),
            total_requests: inner.total_requests,
            blocked_requests: inner.blocked_requests,
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
            state_changed_at: inner.state_changed_at,
        }
    }
}

/// Statistics for a single breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_ratio: f64,
    pub window_len: usize,
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub state_changed_at: DateTime<Utc>,
}

/// Lazily-created breakers keyed by name (strategy id, service name)
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: BreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
        }
    }

    /// Get or create the breaker for `name`
    pub async fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(cb) = breakers.get(name) {
                return cb.clone();
            }
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("Created circuit breaker for {}", name);
                Arc::new(CircuitBreaker::new(name, self.default_config.clone()))
            })
            .clone()
    }

    /// Execute `op` through the named breaker
    pub async fn execute<T, Fut>(&self, name: &str, op: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.breaker(name).await.call(op).await
    }

    /// Manually reset a breaker (admin). Returns false when unknown.
    pub async fn reset(&self, name: &str) -> bool {
        let breakers = self.breakers.read().await;
        match breakers.get(name) {
            Some(cb) => {
                cb.reset().await;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, name: &str) -> bool {
        self.breakers.write().await.remove(name).is_some()
    }

    pub async fn stats(&self, name: &str) -> Option<CircuitBreakerStats> {
        let breakers = self.breakers.read().await;
        match breakers.get(name) {
            Some(cb) => Some(cb.stats().await),
            None => None,
        }
    }

    pub async fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(breakers.len());
        for cb in breakers {
            stats.push(cb.stats().await);
        }
        stats
    }
}
