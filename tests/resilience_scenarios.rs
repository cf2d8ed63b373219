//! End-to-end coordination scenarios against an in-memory store.

use async_trait::async_trait;
use chrono::Utc;
use guardrail::config::{AppConfig, BreakerConfig, ConnectionConfig, LockConfig, RegistryConfig};
use guardrail::connection::{ClientHandle, ConnectionManager, Envelope};
use guardrail::coordination::{
    AccountLockManager, CircuitBreaker, CircuitState, RollbackAction, RollbackManager,
    TaskRegistry, WorkerTask,
};
use guardrail::error::GuardrailError;
use guardrail::services::CoreServices;
use guardrail::store::{CoordinationStore, MemoryStore};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

fn lock_manager(store: Arc<MemoryStore>) -> AccountLockManager {
    AccountLockManager::new(
        store,
        LockConfig {
            ttl_secs: 5,
            retry_delay_ms: 10,
            max_retries: 2,
        },
    )
}

#[tokio::test]
async fn concurrent_workers_get_exactly_one_lock() {
    let store = Arc::new(MemoryStore::new());
    let worker_a = lock_manager(store.clone());
    let worker_b = lock_manager(store.clone());

    let (a, b) = tokio::join!(worker_a.acquire("42"), worker_b.acquire("42"));

    let acquired = [a.is_acquired(), b.is_acquired()];
    assert_eq!(acquired.iter().filter(|ok| **ok).count(), 1);

    // The loser can acquire once the winner releases.
    let guard = a.into_guard().or(b.into_guard()).unwrap();
    assert!(guard.release().await);
    assert!(worker_b.acquire("42").await.is_acquired());
}

#[tokio::test]
async fn breaker_opens_after_three_straight_failures() {
    let breaker = CircuitBreaker::new(
        "broker_api",
        BreakerConfig {
            failure_threshold: 3,
            sliding_window_size: 5,
            min_requests: 3,
            ..BreakerConfig::default()
        },
    );

    for _ in 0..3 {
        let result: Result<(), _> = breaker
            .call(async { Err(GuardrailError::Internal("broker down".into())) })
            .await;
        assert!(result.is_err());
    }

    assert_eq!(breaker.state().await, CircuitState::Open);
    let blocked: Result<(), _> = breaker.call(async { Ok(()) }).await;
    assert!(matches!(blocked, Err(GuardrailError::CircuitOpen { .. })));
}

#[tokio::test]
async fn compensation_runs_in_order_key_order() {
    let manager = RollbackManager::new(Default::default());
    let executed: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let result: Result<(), GuardrailError> = manager
        .run("order_placement", None, None, |txn| {
            let executed = executed.clone();
            async move {
                for (label, order) in [("db rollback", 0), ("cancel order", 1), ("notify", 99)] {
                    let log = executed.clone();
                    txn.add_step(
                        RollbackAction::CustomCleanup,
                        label,
                        order,
                        None,
                        move || {
                            let log = log.clone();
                            async move {
                                log.lock().await.push(label);
                                true
                            }
                        },
                    )
                    .await;
                }
                Err(GuardrailError::Internal("broker rejected order".into()))
            }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(
        *executed.lock().await,
        vec!["db rollback", "cancel order", "notify"]
    );
}

#[tokio::test]
async fn surviving_worker_reclaims_orphaned_task() {
    let store = Arc::new(MemoryStore::new());
    let config = RegistryConfig {
        orphan_grace_secs: 120,
        ..RegistryConfig::default()
    };

    // A task record from a worker that crashed five minutes ago and
    // whose heartbeat key has expired.
    let task = WorkerTask {
        task_id: "T1".to_string(),
        task_type: "order_placement".to_string(),
        correlation_id: None,
        started_at: Utc::now() - chrono::Duration::seconds(300),
        worker_id: "worker_w1".to_string(),
        context_data: serde_json::Value::Null,
    };
    store
        .set_ex(
            "active_task:worker_w1:T1",
            &serde_json::to_string(&task).unwrap(),
            Duration::from_secs(300),
        )
        .await
        .unwrap();

    let survivor = TaskRegistry::new(store.clone(), config);
    let orphans = survivor.sweep_orphans().await;

    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].task.task_id, "T1");
    assert!(orphans[0].age_secs >= 300);
    assert!(store.get("active_task:worker_w1:T1").await.unwrap().is_none());

    // Exactly once: a second sweep finds nothing.
    assert!(survivor.sweep_orphans().await.is_empty());
}

struct SilentHandle;

#[async_trait]
impl ClientHandle for SilentHandle {
    async fn send(&self, _envelope: &Envelope) -> anyhow::Result<()> {
        // Accepts everything, never acks.
        Ok(())
    }

    async fn close(&self, _reason: &str) {}
}

#[tokio::test(start_paused = true)]
async fn missed_heartbeats_force_disconnect() {
    let manager = ConnectionManager::new(ConnectionConfig {
        heartbeat_interval_secs: 1,
        max_missed: 3,
        ..ConnectionConfig::default()
    });

    assert!(manager.connect(Arc::new(SilentHandle), "u1", &[]).await.is_some());
    assert!(manager.is_connected("u1").await);

    // Three silent intervals plus the verdict tick.
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(!manager.is_connected("u1").await);
    let stats = manager.connection_stats().await;
    assert_eq!(stats.total_connections, 0);
    assert!(manager.user_stats("u1").await.is_none());
}

async fn ws_identify(url: &str, user_id: &str) -> WebSocketStream<MaybeTlsStream<TcpStream>> {
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.expect("connect");
    let identify = serde_json::json!({
        "type": "identify",
        "data": { "user_id": user_id, "channels": [] }
    });
    socket
        .send(Message::Text(identify.to_string()))
        .await
        .expect("identify");
    socket
}

#[tokio::test]
async fn reconnect_survives_old_socket_teardown() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let manager = ConnectionManager::new(ConnectionConfig {
        heartbeat_interval_secs: 3600,
        ..ConnectionConfig::default()
    });
    tokio::spawn(guardrail::connection::ws::serve_on(listener, manager.clone()));

    let url = format!("ws://{}", addr);
    let mut first = ws_identify(&url, "u1").await;
    for _ in 0..200 {
        if manager.is_connected("u1").await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(manager.is_connected("u1").await);

    // Reconnect as the same user; the server closes the first socket.
    let _second = ws_identify(&url, "u1").await;
    while let Some(frame) = first.next().await {
        if matches!(frame, Ok(Message::Close(_)) | Err(_)) {
            break;
        }
    }

    // The first socket's teardown must not deregister the replacement.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(manager.is_connected("u1").await);
    assert_eq!(manager.connection_stats().await.total_connections, 1);
}

#[tokio::test]
async fn worker_drain_rejects_new_work() {
    let store = Arc::new(MemoryStore::new());
    let services = CoreServices::with_store(AppConfig::default(), store);

    let guard = services
        .registry
        .track("order_placement", None, None, serde_json::Value::Null)
        .await
        .unwrap();
    guard.complete().await;

    services.close().await;

    let rejected = services
        .registry
        .track("order_placement", None, None, serde_json::Value::Null)
        .await;
    assert!(matches!(rejected, Err(GuardrailError::ShuttingDown)));
}
