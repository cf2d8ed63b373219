//! Connection manager with channel subscriptions and heartbeat supervision
//!
//! Tracks one active connection per user, fan-out over named channels, and
//! a per-connection heartbeat monitor. Transports implement [`ClientHandle`]
//! so the manager stays transport-agnostic (WebSocket in production, stub
//! handles in tests).
//!
//! Send failures are never hard errors. A failed send means the peer is
//! gone, so the connection is deregistered and the caller sees `false` or
//! a reduced delivery count.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::connection::envelope::{Envelope, TYPE_PING};

/// Transport side of a client connection
#[async_trait]
pub trait ClientHandle: Send + Sync {
    /// Deliver an envelope to the peer. An error means the peer is gone.
    async fn send(&self, envelope: &Envelope) -> anyhow::Result<()>;

    /// Close the underlying transport. Best effort.
    async fn close(&self, reason: &str);
}

struct Connection {
    conn_id: u64,
    handle: Arc<dyn ClientHandle>,
    channels: HashSet<String>,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    last_ack: DateTime<Utc>,
    last_ping_at: Option<DateTime<Utc>>,
    missed_heartbeats: u32,
    messages_sent: u64,
    messages_received: u64,
    monitor: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    connections: HashMap<String, Connection>,
    // channel -> subscribed users, empty channels pruned
    channel_subscriptions: HashMap<String, HashSet<String>>,
}

/// Aggregate connection statistics
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub total_channels: usize,
    pub total_subscriptions: usize,
    pub connected_users: Vec<String>,
}

/// Per-user connection statistics
#[derive(Debug, Clone, Serialize)]
pub struct UserConnectionStats {
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub channels: Vec<String>,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub missed_heartbeats: u32,
}

/// Manages client connections, subscriptions and heartbeats
#[derive(Clone)]
pub struct ConnectionManager {
    config: ConnectionConfig,
    state: Arc<RwLock<State>>,
    next_conn_id: Arc<AtomicU64>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(State::default())),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a connection for `user_id`, superseding any existing one.
    ///
    /// Subscribes the initial channels, confirms with a
    /// `connection_established` envelope and starts the heartbeat monitor.
    /// Returns the connection id on success, `None` when the confirmation
    /// cannot be delivered. Transports hold the id and tear down with
    /// [`disconnect_if`](Self::disconnect_if) so a superseded socket
    /// cannot deregister its replacement.
    pub async fn connect(
        &self,
        handle: Arc<dyn ClientHandle>,
        user_id: &str,
        channels: &[String],
    ) -> Option<u64> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();

        // Supersede check, removal and insert under one write lock so
        // concurrent connects for the same user cannot both register.
        let prior = {
            let mut state = self.state.write().await;
            let prior = Self::remove_entry(&mut state, user_id);
            for channel in channels {
                state
                    .channel_subscriptions
                    .entry(channel.clone())
                    .or_default()
                    .insert(user_id.to_string());
            }
            state.connections.insert(
                user_id.to_string(),
                Connection {
                    conn_id,
                    handle: handle.clone(),
                    channels: channels.iter().cloned().collect(),
                    connected_at: now,
                    last_activity: now,
                    last_ack: now,
                    last_ping_at: None,
                    missed_heartbeats: 0,
                    messages_sent: 0,
                    messages_received: 0,
                    monitor: None,
                },
            );
            prior
        };

        if let Some(prior) = prior {
            prior.handle.close("superseded by new connection").await;
            if let Some(monitor) = prior.monitor {
                monitor.abort();
            }
            info!("User {} superseded by new connection", user_id);
        }

        let established = Envelope::connection_established(user_id, channels);
        if handle.send(&established).await.is_err() {
            warn!("Connection confirmation failed for user {}", user_id);
            self.disconnect_if(user_id, conn_id, "confirmation send failed")
                .await;
            return None;
        }
        {
            let mut state = self.state.write().await;
            if let Some(conn) = state.connections.get_mut(user_id) {
                if conn.conn_id == conn_id {
                    conn.messages_sent += 1;
                }
            }
        }

        let monitor = tokio::spawn(self.clone().monitor_heartbeats(user_id.to_string(), conn_id));
        let mut state = self.state.write().await;
        match state.connections.get_mut(user_id) {
            Some(conn) if conn.conn_id == conn_id => conn.monitor = Some(monitor),
            // Superseded between confirmation and registration
            _ => monitor.abort(),
        }

        info!("User {} connected ({} channels)", user_id, channels.len());
        Some(conn_id)
    }

    /// Deregister whatever connection `user_id` currently has.
    pub async fn disconnect(&self, user_id: &str, reason: &str) -> bool {
        self.deregister(user_id, None, reason).await
    }

    /// Deregister only while `conn_id` still owns the registration.
    /// Teardown of a superseded transport becomes a no-op.
    pub async fn disconnect_if(&self, user_id: &str, conn_id: u64, reason: &str) -> bool {
        self.deregister(user_id, Some(conn_id), reason).await
    }

    async fn deregister(&self, user_id: &str, expected: Option<u64>, reason: &str) -> bool {
        let conn = {
            let mut state = self.state.write().await;
            let owned = state
                .connections
                .get(user_id)
                .map_or(false, |c| expected.map_or(true, |id| c.conn_id == id));
            if !owned {
                return false;
            }
            match Self::remove_entry(&mut state, user_id) {
                Some(c) => c,
                None => return false,
            }
        };

        conn.handle.close(reason).await;
        // Abort last: when the monitor itself disconnects, state removal
        // and transport close have already happened.
        if let Some(monitor) = conn.monitor {
            monitor.abort();
        }

        info!("User {} disconnected: {}", user_id, reason);
        true
    }

    // Caller holds the write lock.
    fn remove_entry(state: &mut State, user_id: &str) -> Option<Connection> {
        let conn = state.connections.remove(user_id)?;
        for channel in &conn.channels {
            if let Some(subs) = state.channel_subscriptions.get_mut(channel) {
                subs.remove(user_id);
                if subs.is_empty() {
                    state.channel_subscriptions.remove(channel);
                }
            }
        }
        Some(conn)
    }

    /// Subscribe a connected user to a channel.
    pub async fn subscribe(&self, user_id: &str, channel: &str) -> bool {
        let mut state = self.state.write().await;
        if !state.connections.contains_key(user_id) {
            return false;
        }
        state
            .channel_subscriptions
            .entry(channel.to_string())
            .or_default()
            .insert(user_id.to_string());
        if let Some(conn) = state.connections.get_mut(user_id) {
            conn.channels.insert(channel.to_string());
        }
        debug!("User {} subscribed to {}", user_id, channel);
        true
    }

    /// Unsubscribe a user from a channel, pruning the channel when empty.
    pub async fn unsubscribe(&self, user_id: &str, channel: &str) -> bool {
        let mut state = self.state.write().await;
        if let Some(subs) = state.channel_subscriptions.get_mut(channel) {
            subs.remove(user_id);
            if subs.is_empty() {
                state.channel_subscriptions.remove(channel);
            }
        }
        match state.connections.get_mut(user_id) {
            Some(conn) => {
                conn.channels.remove(channel);
                true
            }
            None => false,
        }
    }

    /// Send an envelope to one user. A failed send deregisters the
    /// connection and returns false.
    pub async fn send_to_user(&self, user_id: &str, envelope: &Envelope) -> bool {
        let (handle, conn_id) = {
            let state = self.state.read().await;
            match state.connections.get(user_id) {
                Some(conn) => (conn.handle.clone(), conn.conn_id),
                None => {
                    debug!("User {} not connected, envelope dropped", user_id);
                    return false;
                }
            }
        };

        match handle.send(envelope).await {
            Ok(()) => {
                let mut state = self.state.write().await;
                if let Some(conn) = state.connections.get_mut(user_id) {
                    if conn.conn_id == conn_id {
                        conn.messages_sent += 1;
                    }
                }
                true
            }
            Err(e) => {
                debug!("Send to user {} failed: {}", user_id, e);
                self.disconnect_if(user_id, conn_id, "send failed").await;
                false
            }
        }
    }

    /// Broadcast to a channel's subscribers. Returns the delivered count;
    /// failed receivers are deregistered by the send path.
    pub async fn broadcast_to_channel(
        &self,
        channel: &str,
        envelope: &Envelope,
        exclude_user: Option<&str>,
    ) -> usize {
        let subscribers: Vec<String> = {
            let state = self.state.read().await;
            match state.channel_subscriptions.get(channel) {
                Some(subs) => subs
                    .iter()
                    .filter(|u| exclude_user != Some(u.as_str()))
                    .cloned()
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for user_id in &subscribers {
            if self.send_to_user(user_id, envelope).await {
                delivered += 1;
            }
        }

        debug!(
            "Broadcast to {}: {}/{} delivered",
            channel,
            delivered,
            subscribers.len()
        );
        delivered
    }

    /// Broadcast to every connected user.
    pub async fn broadcast_to_all(
        &self,
        envelope: &Envelope,
        exclude_user: Option<&str>,
    ) -> usize {
        let users: Vec<String> = {
            let state = self.state.read().await;
            state
                .connections
                .keys()
                .filter(|u| exclude_user != Some(u.as_str()))
                .cloned()
                .collect()
        };

        let mut delivered = 0;
        for user_id in &users {
            if self.send_to_user(user_id, envelope).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Process an inbound envelope. Heartbeat traffic is consumed here;
    /// application envelopes are handed back to the caller for routing.
    pub async fn handle_inbound(&self, user_id: &str, envelope: Envelope) -> Option<Envelope> {
        let is_ack = envelope.is_heartbeat_ack();
        {
            let mut state = self.state.write().await;
            let conn = state.connections.get_mut(user_id)?;
            conn.last_activity = Utc::now();
            conn.messages_received += 1;
            if is_ack {
                conn.last_ack = Utc::now();
                conn.missed_heartbeats = 0;
            }
        }

        if is_ack {
            if envelope.kind == TYPE_PING {
                self.send_to_user(user_id, &Envelope::pong()).await;
            }
            return None;
        }
        Some(envelope)
    }

    // One monitor task per connection. Sends a ping every interval and
    // counts intervals where no ack arrived since the previous ping.
    async fn monitor_heartbeats(self, user_id: String, conn_id: u64) {
        let interval = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let verdict = {
                let mut state = self.state.write().await;
                let conn = match state.connections.get_mut(&user_id) {
                    Some(c) if c.conn_id == conn_id => c,
                    _ => return,
                };
                if let Some(pinged_at) = conn.last_ping_at {
                    if conn.last_ack < pinged_at {
                        conn.missed_heartbeats += 1;
                        warn!(
                            "Missed heartbeat for user {}: {}/{}",
                            user_id, conn.missed_heartbeats, self.config.max_missed
                        );
                    }
                }
                if conn.missed_heartbeats >= self.config.max_missed {
                    None
                } else {
                    conn.last_ping_at = Some(Utc::now());
                    Some(conn.handle.clone())
                }
            };

            match verdict {
                None => {
                    self.disconnect_if(&user_id, conn_id, "heartbeat timeout").await;
                    return;
                }
                Some(handle) => {
                    if handle.send(&Envelope::ping()).await.is_err() {
                        self.disconnect_if(&user_id, conn_id, "ping send failed").await;
                        return;
                    }
                }
            }
        }
    }

    /// Disconnect connections whose last activity is older than the
    /// configured maximum age. Returns the number swept.
    pub async fn sweep_stale(&self) -> usize {
        let max_age = chrono::Duration::seconds(self.config.stale_max_age_secs as i64);
        let cutoff = Utc::now() - max_age;
        let stale: Vec<(String, u64)> = {
            let state = self.state.read().await;
            state
                .connections
                .iter()
                .filter(|(_, c)| c.last_activity < cutoff)
                .map(|(u, c)| (u.clone(), c.conn_id))
                .collect()
        };

        for (user_id, conn_id) in &stale {
            self.disconnect_if(user_id, *conn_id, "stale connection").await;
        }
        if !stale.is_empty() {
            info!("Swept {} stale connection(s)", stale.len());
        }
        stale.len()
    }

    pub async fn is_connected(&self, user_id: &str) -> bool {
        self.state.read().await.connections.contains_key(user_id)
    }

    pub async fn user_channels(&self, user_id: &str) -> Vec<String> {
        let state = self.state.read().await;
        state
            .connections
            .get(user_id)
            .map(|c| {
                let mut channels: Vec<String> = c.channels.iter().cloned().collect();
                channels.sort();
                channels
            })
            .unwrap_or_default()
    }

    pub async fn connection_stats(&self) -> ConnectionStats {
        let state = self.state.read().await;
        let mut connected_users: Vec<String> = state.connections.keys().cloned().collect();
        connected_users.sort();
        ConnectionStats {
            total_connections: state.connections.len(),
            total_channels: state.channel_subscriptions.len(),
            total_subscriptions: state
                .channel_subscriptions
                .values()
                .map(|subs| subs.len())
                .sum(),
            connected_users,
        }
    }

    pub async fn user_stats(&self, user_id: &str) -> Option<UserConnectionStats> {
        let state = self.state.read().await;
        let conn = state.connections.get(user_id)?;
        let mut channels: Vec<String> = conn.channels.iter().cloned().collect();
        channels.sort();
        Some(UserConnectionStats {
            user_id: user_id.to_string(),
            connected_at: conn.connected_at,
            last_activity: conn.last_activity,
            channels,
            messages_sent: conn.messages_sent,
            messages_received: conn.messages_received,
            missed_heartbeats: conn.missed_heartbeats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    struct StubHandle {
        sent: Mutex<Vec<Envelope>>,
        fail_sends: AtomicBool,
        closed: Mutex<Option<String>>,
    }

    impl StubHandle {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail_sends: AtomicBool::new(false),
                closed: Mutex::new(None),
            })
        }

        async fn sent_kinds(&self) -> Vec<String> {
            self.sent.lock().await.iter().map(|e| e.kind.clone()).collect()
        }
    }

    #[async_trait]
    impl ClientHandle for StubHandle {
        async fn send(&self, envelope: &Envelope) -> anyhow::Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                anyhow::bail!("peer gone");
            }
            self.sent.lock().await.push(envelope.clone());
            Ok(())
        }

        async fn close(&self, reason: &str) {
            *self.closed.lock().await = Some(reason.to_string());
        }
    }

    fn manager() -> ConnectionManager {
        ConnectionManager::new(ConnectionConfig {
            // Long interval so monitors stay quiet during tests
            heartbeat_interval_secs: 3600,
            ..ConnectionConfig::default()
        })
    }

    #[tokio::test]
    async fn connect_confirms_and_subscribes() {
        let mgr = manager();
        let handle = StubHandle::new();

        let ok = mgr
            .connect(handle.clone(), "u1", &["alerts".to_string()])
            .await;
        assert!(ok.is_some());
        assert!(mgr.is_connected("u1").await);
        assert_eq!(mgr.user_channels("u1").await, vec!["alerts".to_string()]);
        assert_eq!(
            handle.sent_kinds().await,
            vec!["connection_established".to_string()]
        );
    }

    #[tokio::test]
    async fn second_connection_replaces_first() {
        let mgr = manager();
        let first = StubHandle::new();
        let second = StubHandle::new();

        assert!(mgr.connect(first.clone(), "u1", &[]).await.is_some());
        assert!(mgr.connect(second.clone(), "u1", &[]).await.is_some());

        assert!(mgr.is_connected("u1").await);
        assert_eq!(
            first.closed.lock().await.as_deref(),
            Some("superseded by new connection")
        );
        let stats = mgr.connection_stats().await;
        assert_eq!(stats.total_connections, 1);
    }

    #[tokio::test]
    async fn superseded_teardown_keeps_replacement() {
        let mgr = manager();
        let first = StubHandle::new();
        let second = StubHandle::new();

        let old_id = mgr.connect(first.clone(), "u1", &[]).await.unwrap();
        let new_id = mgr.connect(second.clone(), "u1", &[]).await.unwrap();
        assert_ne!(old_id, new_id);

        // The superseded transport tears down after its reader exits.
        assert!(!mgr.disconnect_if("u1", old_id, "socket closed").await);
        assert!(mgr.is_connected("u1").await);
        assert!(second.closed.lock().await.is_none());

        assert!(mgr.disconnect_if("u1", new_id, "socket closed").await);
        assert!(!mgr.is_connected("u1").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_connects_leave_one_registration() {
        let mgr = manager();
        let a = StubHandle::new();
        let b = StubHandle::new();

        let t1 = tokio::spawn({
            let mgr = mgr.clone();
            let handle = a.clone();
            async move { mgr.connect(handle, "u1", &[]).await }
        });
        let t2 = tokio::spawn({
            let mgr = mgr.clone();
            let handle = b.clone();
            async move { mgr.connect(handle, "u1", &[]).await }
        });
        assert!(t1.await.unwrap().is_some());
        assert!(t2.await.unwrap().is_some());

        assert_eq!(mgr.connection_stats().await.total_connections, 1);
        // Exactly one registration survived; the other handle was closed.
        let a_closed = a.closed.lock().await.is_some();
        let b_closed = b.closed.lock().await.is_some();
        assert!(a_closed != b_closed);
    }

    #[tokio::test]
    async fn failed_send_disconnects() {
        let mgr = manager();
        let handle = StubHandle::new();
        assert!(mgr.connect(handle.clone(), "u1", &[]).await.is_some());

        handle.fail_sends.store(true, Ordering::SeqCst);
        let delivered = mgr
            .send_to_user("u1", &Envelope::new("notice", serde_json::Value::Null))
            .await;
        assert!(!delivered);
        assert!(!mgr.is_connected("u1").await);
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_and_counts_delivered() {
        let mgr = manager();
        let a = StubHandle::new();
        let b = StubHandle::new();
        assert!(mgr.connect(a.clone(), "a", &["room".to_string()]).await.is_some());
        assert!(mgr.connect(b.clone(), "b", &["room".to_string()]).await.is_some());

        let env = Envelope::new("chat_message", serde_json::json!({"text": "hi"}));
        let delivered = mgr.broadcast_to_channel("room", &env, Some("a")).await;
        assert_eq!(delivered, 1);
        assert!(b.sent_kinds().await.contains(&"chat_message".to_string()));
        assert!(!a.sent_kinds().await.contains(&"chat_message".to_string()));

        let everyone = Envelope::new("system_notice", serde_json::Value::Null);
        assert_eq!(mgr.broadcast_to_all(&everyone, None).await, 2);
    }

    #[tokio::test]
    async fn inbound_ping_gets_pong_and_resets_missed() {
        let mgr = manager();
        let handle = StubHandle::new();
        assert!(mgr.connect(handle.clone(), "u1", &[]).await.is_some());

        {
            let mut state = mgr.state.write().await;
            state.connections.get_mut("u1").unwrap().missed_heartbeats = 2;
        }

        let routed = mgr.handle_inbound("u1", Envelope::ping()).await;
        assert!(routed.is_none());
        assert!(handle.sent_kinds().await.contains(&"pong".to_string()));
        assert_eq!(mgr.user_stats("u1").await.unwrap().missed_heartbeats, 0);

        let routed = mgr
            .handle_inbound("u1", Envelope::new("chat_message", serde_json::Value::Null))
            .await;
        assert_eq!(routed.unwrap().kind, "chat_message");
    }

    #[tokio::test]
    async fn unsubscribe_prunes_empty_channel() {
        let mgr = manager();
        let handle = StubHandle::new();
        assert!(mgr.connect(handle, "u1", &["room".to_string()]).await.is_some());

        assert!(mgr.unsubscribe("u1", "room").await);
        assert!(mgr.user_channels("u1").await.is_empty());
        assert_eq!(mgr.connection_stats().await.total_channels, 0);
    }

    #[tokio::test]
    async fn sweep_disconnects_idle_connections() {
        let mgr = ConnectionManager::new(ConnectionConfig {
            heartbeat_interval_secs: 3600,
            stale_max_age_secs: 60,
            ..ConnectionConfig::default()
        });
        let handle = StubHandle::new();
        assert!(mgr.connect(handle, "u1", &[]).await.is_some());

        {
            let mut state = mgr.state.write().await;
            state.connections.get_mut("u1").unwrap().last_activity =
                Utc::now() - chrono::Duration::seconds(120);
        }

        assert_eq!(mgr.sweep_stale().await, 1);
        assert!(!mgr.is_connected("u1").await);
    }
}
