//! Connection Gateway
//!
//! Owns every live browser connection: accepts WebSocket upgrades,
//! parses inbound messages and routes them to the presence registry or
//! broadcast fanout, and tears connections down on close or error.
//!
//! Each connection gets a bounded outbound queue. The socket task is
//! the only writer to the underlying sink; everything else (fanout,
//! dispatch replies) enqueues through the handle. A connection whose
//! queue is full when a broadcast arrives is dropped rather than
//! allowed to stall the fanout loop.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use peerquiz_core::{ClientMessage, CoreError, ServerMessage};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fanout::Fanout;
use crate::presence::PresenceRegistry;
use crate::state::AppState;

/// Opaque identity of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why an enqueue onto a connection's outbound queue failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// Queue at capacity: slow consumer.
    QueueFull,
    /// The socket task has already gone away.
    Closed,
}

/// Handle to one live connection, shared between the socket task, the
/// registry, and in-flight broadcasts.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnId,
    tx: mpsc::Sender<String>,
    close_tx: watch::Sender<bool>,
    username: RwLock<Option<String>>,
    topic: RwLock<Option<String>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn username(&self) -> Option<String> {
        self.username.read().expect("username lock poisoned").clone()
    }

    fn set_username(&self, username: &str) {
        *self.username.write().expect("username lock poisoned") = Some(username.to_string());
    }

    pub fn topic(&self) -> Option<String> {
        self.topic.read().expect("topic lock poisoned").clone()
    }

    fn set_topic(&self, topic: &str) {
        *self.topic.write().expect("topic lock poisoned") = Some(topic.to_string());
    }

    /// Push an already-serialized payload onto the outbound queue
    /// without waiting. Fanout is fire-and-forget.
    pub fn enqueue(&self, payload: String) -> Result<(), EnqueueError> {
        self.tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Serialize and enqueue a message addressed to this connection only.
    pub fn enqueue_message(&self, message: &ServerMessage) -> Result<(), EnqueueError> {
        match serde_json::to_string(message) {
            Ok(payload) => self.enqueue(payload),
            Err(e) => {
                warn!(conn_id = %self.id, error = %e, "failed to serialize outbound message");
                Ok(())
            }
        }
    }

    /// Ask the socket task to wind the connection down.
    pub fn request_close(&self) {
        let _ = self.close_tx.send(true);
    }
}

/// Gateway traffic counters.
#[derive(Debug, Default)]
pub struct GatewayCounters {
    pub accepted: AtomicU64,
    pub closed: AtomicU64,
    pub messages_in: AtomicU64,
    pub malformed: AtomicU64,
    pub slow_drops: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct GatewayCountersSnapshot {
    pub accepted: u64,
    pub closed: u64,
    pub messages_in: u64,
    pub malformed: u64,
    pub slow_drops: u64,
}

impl GatewayCounters {
    pub fn snapshot(&self) -> GatewayCountersSnapshot {
        GatewayCountersSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            slow_drops: self.slow_drops.load(Ordering::Relaxed),
        }
    }
}

/// Registry of live connections plus the inbound message router.
pub struct Gateway {
    connections: DashMap<ConnId, Arc<ConnectionHandle>>,
    presence: Arc<PresenceRegistry>,
    queue_depth: usize,
    counters: GatewayCounters,
}

impl Gateway {
    pub fn new(presence: Arc<PresenceRegistry>, queue_depth: usize) -> Self {
        Self {
            connections: DashMap::new(),
            presence,
            queue_depth,
            counters: GatewayCounters::default(),
        }
    }

    /// Create and register a connection handle. The caller (the socket
    /// task) keeps the receiving halves.
    pub fn register(&self) -> (Arc<ConnectionHandle>, mpsc::Receiver<String>, watch::Receiver<bool>) {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let (close_tx, close_rx) = watch::channel(false);
        let handle = Arc::new(ConnectionHandle {
            id: ConnId::new(),
            tx,
            close_tx,
            username: RwLock::new(None),
            topic: RwLock::new(None),
        });
        self.connections.insert(handle.id, Arc::clone(&handle));
        (handle, rx, close_rx)
    }

    /// Greet a freshly registered connection: `connected`, then the
    /// current presence snapshot.
    pub fn accept(&self, handle: &ConnectionHandle) {
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        let _ = handle.enqueue_message(&ServerMessage::Connected {
            client_count: self.connections.len(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        let users = self.presence.snapshot();
        let count = users.len();
        let _ = handle.enqueue_message(&ServerMessage::PresenceSnapshot { users, count });
    }

    /// Parse one inbound text frame and route it. Malformed input gets
    /// exactly one structured error reply; the connection stays open.
    pub fn dispatch(&self, fanout: &Fanout, handle: &ConnectionHandle, text: &str) {
        self.counters.messages_in.fetch_add(1, Ordering::Relaxed);

        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                let err = CoreError::from(e);
                debug!(conn_id = %handle.id(), error = %err, "rejecting client message");
                let _ = handle.enqueue_message(&ServerMessage::error(err.to_string()));
                return;
            }
        };

        debug!(conn_id = %handle.id(), kind = message.kind(), "dispatching client message");

        match message {
            ClientMessage::Identify { username } => {
                // Re-identifying releases the previous identity, otherwise
                // its connection set never empties and the entry can never
                // expire.
                if let Some(previous) = handle.username() {
                    if previous != username {
                        self.presence.unbind(&previous, handle.id());
                    }
                }
                handle.set_username(&username);
                if self.presence.bind(&username, handle.id()) {
                    info!(conn_id = %handle.id(), username = %username, "user online");
                    fanout.publish(&ServerMessage::user_online(&username), None, None);
                }
            }
            ClientMessage::Heartbeat { username } => {
                let identity = username.or_else(|| handle.username());
                if let Some(identity) = identity {
                    self.presence.touch(&identity);
                }
                let _ = handle.enqueue_message(&ServerMessage::pong());
            }
            ClientMessage::Subscribe { topic } => {
                handle.set_topic(&topic);
            }
            ClientMessage::AnswerSubmitted {
                username,
                question_id,
                answer_value,
            } => {
                // Activity implies liveness: a submission counts as a touch.
                self.presence.touch(&username);
                let update = ServerMessage::RealtimeUpdate {
                    event: "answer_submitted".to_string(),
                    data: json!({
                        "username": username,
                        "question_id": question_id,
                        "answer_value": answer_value,
                    }),
                    table: "answers".to_string(),
                    timestamp: chrono::Utc::now(),
                };
                fanout.publish(&update, Some(&question_id), Some(handle.id()));
            }
            ClientMessage::VoteCast {
                voter_username,
                target_username,
                question_id,
                vote_type,
            } => {
                self.presence.touch(&voter_username);
                let update = ServerMessage::RealtimeUpdate {
                    event: "vote_cast".to_string(),
                    data: json!({
                        "voter_username": voter_username,
                        "target_username": target_username,
                        "question_id": question_id,
                        "vote_type": vote_type,
                    }),
                    table: "votes".to_string(),
                    timestamp: chrono::Utc::now(),
                };
                fanout.publish(&update, Some(&question_id), Some(handle.id()));
            }
        }
    }

    /// Remove a connection from the registry and its presence entry.
    /// Idempotent; safe to call from the socket task's teardown path
    /// while a broadcast is still enumerating a stale snapshot.
    pub fn close(&self, handle: &ConnectionHandle) {
        if self.connections.remove(&handle.id()).is_some() {
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
            if let Some(username) = handle.username() {
                self.presence.unbind(&username, handle.id());
            }
            info!(conn_id = %handle.id(), "connection closed");
        }
    }

    /// Flag a slow consumer for closure without blocking the caller.
    pub fn drop_slow(&self, handle: &ConnectionHandle) {
        self.counters.slow_drops.fetch_add(1, Ordering::Relaxed);
        warn!(conn_id = %handle.id(), "outbound queue full, dropping connection");
        handle.request_close();
    }

    /// Snapshot of live handles for a broadcast. Iterating a copy
    /// avoids mutation-during-iteration when connections close while a
    /// publish is in progress.
    pub fn snapshot_handles(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn counters(&self) -> &GatewayCounters {
        &self.counters
    }

    /// Ask every live connection to close, then wait (bounded) for the
    /// socket tasks to drain the registry. Used during shutdown.
    pub async fn drain(&self, deadline: Duration) {
        for handle in self.snapshot_handles() {
            handle.request_close();
        }
        let poll = Duration::from_millis(50);
        let mut waited = Duration::ZERO;
        while self.connection_count() > 0 && waited < deadline {
            tokio::time::sleep(poll).await;
            waited += poll;
        }
    }
}

/// WebSocket upgrade endpoint.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Runs for the lifetime of one WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (handle, mut rx, mut close_rx) = state.gateway.register();
    state.gateway.accept(&handle);
    info!(conn_id = %handle.id(), "client connected");

    // Inbound frames are handled on their own task so a slow outbound
    // sink never delays dispatch.
    let recv_state = state.clone();
    let recv_handle = Arc::clone(&handle);
    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    recv_state
                        .gateway
                        .dispatch(&recv_state.fanout, &recv_handle, &text);
                }
                Ok(Message::Binary(_)) => {
                    let _ = recv_handle
                        .enqueue_message(&ServerMessage::error("binary frames are not supported"));
                }
                Ok(Message::Close(_)) => {
                    debug!(conn_id = %recv_handle.id(), "client sent close frame");
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Err(e) => {
                    warn!(conn_id = %recv_handle.id(), error = %e, "receive error");
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            queued = rx.recv() => {
                match queued {
                    Some(payload) => {
                        if sender.send(Message::Text(payload)).await.is_err() {
                            // Half-closed socket: stop writing, fail safe.
                            break;
                        }
                    }
                    None => break,
                }
            }
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    break;
                }
            }
            _ = &mut recv_task => break,
        }
    }

    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "closing".into(),
        })))
        .await;
    recv_task.abort();
    state.gateway.close(&handle);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_gateway() -> (Arc<Gateway>, Arc<Fanout>) {
        let presence = Arc::new(PresenceRegistry::new());
        let gateway = Arc::new(Gateway::new(presence, 8));
        let fanout = Arc::new(Fanout::new(Arc::clone(&gateway)));
        (gateway, fanout)
    }

    fn recv_kind(rx: &mut mpsc::Receiver<String>) -> String {
        let payload = rx.try_recv().expect("expected a queued message");
        let value: serde_json::Value = serde_json::from_str(&payload).expect("valid json");
        value["type"].as_str().expect("type field").to_string()
    }

    #[tokio::test]
    async fn test_accept_sends_connected_then_snapshot() {
        let (gateway, _fanout) = test_gateway();
        let (handle, mut rx, _close) = gateway.register();
        gateway.accept(&handle);

        assert_eq!(recv_kind(&mut rx), "connected");
        assert_eq!(recv_kind(&mut rx), "presence_snapshot");
    }

    #[tokio::test]
    async fn test_malformed_message_one_error_reply_stays_open() {
        let (gateway, fanout) = test_gateway();
        let (handle, mut rx, _close) = gateway.register();

        gateway.dispatch(&fanout, &handle, "not json");

        assert_eq!(recv_kind(&mut rx), "error");
        assert!(rx.try_recv().is_err(), "exactly one reply expected");
        assert_eq!(gateway.connection_count(), 1);
        assert_eq!(gateway.counters().snapshot().malformed, 1);
    }

    #[tokio::test]
    async fn test_identify_broadcasts_online_to_all() {
        let (gateway, fanout) = test_gateway();
        let (alice, mut alice_rx, _c1) = gateway.register();
        let (_bob, mut bob_rx, _c2) = gateway.register();

        gateway.dispatch(
            &fanout,
            &alice,
            r#"{"type":"identify","username":"Apple_Lion"}"#,
        );

        assert_eq!(recv_kind(&mut alice_rx), "user_online");
        assert_eq!(recv_kind(&mut bob_rx), "user_online");
        assert_eq!(alice.username().as_deref(), Some("Apple_Lion"));
    }

    #[tokio::test]
    async fn test_second_tab_does_not_reannounce() {
        let (gateway, fanout) = test_gateway();
        let (tab1, mut rx1, _c1) = gateway.register();
        let (tab2, mut rx2, _c2) = gateway.register();

        gateway.dispatch(&fanout, &tab1, r#"{"type":"identify","username":"A"}"#);
        assert_eq!(recv_kind(&mut rx1), "user_online");
        assert_eq!(recv_kind(&mut rx2), "user_online");

        gateway.dispatch(&fanout, &tab2, r#"{"type":"identify","username":"A"}"#);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reidentify_releases_previous_identity() {
        let (gateway, fanout) = test_gateway();
        let (handle, _rx, _close) = gateway.register();

        gateway.dispatch(&fanout, &handle, r#"{"type":"identify","username":"Old_Name"}"#);
        gateway.dispatch(&fanout, &handle, r#"{"type":"identify","username":"New_Name"}"#);
        assert_eq!(handle.username().as_deref(), Some("New_Name"));

        gateway.close(&handle);
        tokio::time::advance(Duration::from_secs(3600)).await;

        // Both identities expire once the connection is gone; neither
        // lingers as a ghost.
        let offline = gateway.presence.expire_stale(Duration::from_secs(45));
        assert_eq!(
            offline,
            vec!["New_Name".to_string(), "Old_Name".to_string()]
        );
        assert!(gateway.presence.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_replies_pong_and_touches() {
        let (gateway, fanout) = test_gateway();
        let (handle, mut rx, _close) = gateway.register();

        gateway.dispatch(&fanout, &handle, r#"{"type":"identify","username":"A"}"#);
        let _ = recv_kind(&mut rx); // user_online

        gateway.dispatch(&fanout, &handle, r#"{"type":"heartbeat"}"#);
        assert_eq!(recv_kind(&mut rx), "pong");
    }

    #[tokio::test]
    async fn test_answer_submitted_excludes_sender() {
        let (gateway, fanout) = test_gateway();
        let (sender_conn, mut sender_rx, _c1) = gateway.register();
        let (_peer, mut peer_rx, _c2) = gateway.register();

        gateway.dispatch(
            &fanout,
            &sender_conn,
            r#"{"type":"answer_submitted","username":"A","question_id":"U1-L2-Q01","answer_value":3}"#,
        );

        assert_eq!(recv_kind(&mut peer_rx), "realtime_update");
        assert!(sender_rx.try_recv().is_err(), "sender must be excluded");
    }

    #[tokio::test]
    async fn test_subscribe_sets_topic_filter() {
        let (gateway, fanout) = test_gateway();
        let (handle, _rx, _close) = gateway.register();
        gateway.dispatch(&fanout, &handle, r#"{"type":"subscribe","topic":"U1-L2-Q01"}"#);
        assert_eq!(handle.topic().as_deref(), Some("U1-L2-Q01"));
    }

    #[tokio::test]
    async fn test_close_unbinds_presence_and_is_idempotent() {
        let (gateway, fanout) = test_gateway();
        let (handle, _rx, _close) = gateway.register();
        gateway.dispatch(&fanout, &handle, r#"{"type":"identify","username":"A"}"#);

        gateway.close(&handle);
        gateway.close(&handle);
        assert_eq!(gateway.connection_count(), 0);
        assert_eq!(gateway.counters().snapshot().closed, 1);
    }

    #[tokio::test]
    async fn test_enqueue_reports_full_queue() {
        let presence = Arc::new(PresenceRegistry::new());
        let gateway = Gateway::new(presence, 2);
        let (handle, _rx, _close) = gateway.register();

        assert!(handle.enqueue("a".to_string()).is_ok());
        assert!(handle.enqueue("b".to_string()).is_ok());
        assert_eq!(
            handle.enqueue("c".to_string()),
            Err(EnqueueError::QueueFull)
        );
    }
}
