//! The node session bus (§4.1): one authenticated WebSocket session per
//! online node, request/response correlation keyed by `requestId`, and
//! admin-observer fan-out. Shape grounded in
//! `original_source/go-backend/pkg/ws.go`; the session-registry-as-shared-map
//! idiom is grounded in `examples/manhpham90vn-tunnel/server`, which uses
//! `dashmap` for the same purpose.

pub mod wire;

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use wire::{InboundCorrelated, NodeResponse, OutboundCommand};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

struct NodeSession {
    generation: u64,
    secret: String,
    outbox: mpsc::UnboundedSender<Message>,
}

struct AdminSession {
    outbox: mpsc::UnboundedSender<Message>,
}

/// Process-wide node session bus. Cheap to clone (wraps `Arc`-free `DashMap`s
/// behind `Arc` internally via the handle types); held once in `AppState`.
#[derive(Clone)]
pub struct NodeBus {
    sessions: std::sync::Arc<DashMap<i64, NodeSession>>,
    admins: std::sync::Arc<DashMap<SocketAddr, AdminSession>>,
    pending: std::sync::Arc<DashMap<Uuid, oneshot::Sender<NodeResponse>>>,
    generation_seq: std::sync::Arc<AtomicU64>,
}

impl Default for NodeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeBus {
    pub fn new() -> Self {
        Self {
            sessions: std::sync::Arc::new(DashMap::new()),
            admins: std::sync::Arc::new(DashMap::new()),
            pending: std::sync::Arc::new(DashMap::new()),
            generation_seq: std::sync::Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_online(&self, node_id: i64) -> bool {
        self.sessions.contains_key(&node_id)
    }

    /// Registers a freshly-authenticated node session, closing out any prior
    /// session for the same id first (last-writer-wins, §4.1).
    fn register_node(&self, node_id: i64, secret: String, outbox: mpsc::UnboundedSender<Message>) -> u64 {
        let generation = self.generation_seq.fetch_add(1, Ordering::SeqCst);
        self.sessions.insert(
            node_id,
            NodeSession {
                generation,
                secret,
                outbox,
            },
        );
        generation
    }

    /// Removes the session only if it still points to the same connection
    /// (compare-and-remove by generation), so a superseded reader does not
    /// clobber the new session on exit. Returns whether removal happened,
    /// i.e. whether `on-offline` should fire.
    fn unregister_node(&self, node_id: i64, generation: u64) -> bool {
        let removed = self
            .sessions
            .remove_if(&node_id, |_, session| session.generation == generation);
        removed.is_some()
    }

    /// Sends a command to `node_id` and awaits its response, timing out
    /// after 10s. Returns the node-offline response immediately if the node
    /// has no registered session.
    pub async fn send_msg(
        &self,
        node_id: i64,
        command_type: &str,
        data: serde_json::Value,
    ) -> NodeResponse {
        let Some(session) = self.sessions.get(&node_id) else {
            return NodeResponse::offline();
        };

        let request_id = Uuid::new_v4();
        let command = OutboundCommand {
            type_: command_type,
            data,
            request_id,
        };
        let payload = match serde_json::to_string(&command) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialize outbound node command");
                return NodeResponse {
                    message: "encode error".to_string(),
                    data: serde_json::Value::Null,
                };
            }
        };
        let frame = if session.secret.is_empty() {
            payload
        } else {
            crate::crypto::wrap_encrypted(&session.secret, &payload, chrono::Utc::now().timestamp_millis())
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        if session.outbox.send(Message::Text(frame)).is_err() {
            self.pending.remove(&request_id);
            return NodeResponse::offline();
        }
        drop(session);

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) | Err(_) => {
                self.pending.remove(&request_id);
                NodeResponse::timeout()
            }
        }
    }

    /// Re-broadcasts a node-originated frame to every admin observer,
    /// wrapped with the originating node id so a dashboard watching several
    /// nodes can attribute it (§4.1 "tagged with the node id").
    fn broadcast_to_admins(&self, node_id: i64, raw: &str) {
        let data = serde_json::from_str::<serde_json::Value>(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        let wrapped = serde_json::json!({
            "id": node_id.to_string(),
            "type": "info",
            "data": data,
        });
        let Ok(payload) = serde_json::to_string(&wrapped) else {
            return;
        };
        self.admins.retain(|_, admin| {
            admin.outbox.send(Message::Text(payload.clone())).is_ok()
        });
    }

    /// Dispatches one inbound text frame from a node's reader task:
    /// correlated responses are delivered to the waiting caller; telemetry
    /// (`memory_usage` substring) is acked and re-broadcast to admins.
    fn handle_node_message(&self, node_id: i64, raw: &str) -> Option<Message> {
        if raw.contains("memory_usage") {
            self.broadcast_to_admins(node_id, raw);
            return Some(Message::Text(r#"{"type":"call"}"#.to_string()));
        }

        if let Ok(inbound) = serde_json::from_str::<InboundCorrelated>(raw) {
            if let Some(request_id) = inbound.request_id {
                if let Some((_, sender)) = self.pending.remove(&request_id) {
                    let message = inbound
                        .message
                        .filter(|m| !m.is_empty())
                        .unwrap_or_else(|| "OK".to_string());
                    let response = NodeResponse {
                        message,
                        data: inbound.data,
                    };
                    let _ = sender.send(response);
                    return None;
                }
            }
        }

        self.broadcast_to_admins(node_id, raw);
        None
    }

    pub async fn run_node_session(
        &self,
        node_id: i64,
        secret: String,
        socket: WebSocket,
        on_online: impl FnOnce(i64) + Send + 'static,
        on_offline: impl FnOnce(i64) + Send + 'static,
    ) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let generation = self.register_node(node_id, secret.clone(), tx);
        on_online(node_id);
        info!(node_id, generation, "node session established");

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(message)) = stream.next().await {
            let Message::Text(raw) = message else {
                continue;
            };
            let decrypted = crate::crypto::decrypt_if_needed(&raw, &secret);
            if let Some(reply) = self.handle_node_message(node_id, &decrypted) {
                // best-effort ack; dropped sends do not fail the session
                let _ = self
                    .sessions
                    .get(&node_id)
                    .map(|s| s.outbox.send(reply));
            }
        }

        writer.abort();
        if self.unregister_node(node_id, generation) {
            on_offline(node_id);
            info!(node_id, "node session closed");
        }
    }

    pub fn register_admin(&self, addr: SocketAddr) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.admins.insert(addr, AdminSession { outbox: tx });
        rx
    }

    pub fn unregister_admin(&self, addr: SocketAddr) {
        self.admins.remove(&addr);
    }
}

/// Drains an admin observer's outbound queue into its socket sink until the
/// channel closes or the write fails.
pub async fn pump_admin_outbox(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
}
