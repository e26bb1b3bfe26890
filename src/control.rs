//! Control-plane service: one WebSocket session per worker.
//!
//! Workers connect to `/control/stream`, receive a `server_hello`, then
//! announce themselves with `hello` and push periodic `status` frames. The
//! router sends `unload_model` commands and broadcast `ping`s. STATUS
//! ingestion is the only writer of the cluster state; READY residencies are
//! forwarded to the placement notifier so gate waiters can unblock.

use crate::cluster::{ClusterState, ModelResidency, ModelState};
use crate::protocol::{
    CommandAck, NodeHello, NodeMessage, NodeStatus, Ping, ServerHello, ServerMessage, UnloadModel,
};
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Narrow capability the control service holds into the placement engine.
///
/// Breaks the cycle between the two: the control service notifies on every
/// residency refresh, the placement engine decides what READY means.
pub trait ModelStateNotifier: Send + Sync {
    fn notify_model_state(&self, node_id: &str, model_id: &str, state: ModelState);
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("node session not available: {0}")]
    Unavailable(String),
}

/// Outbound half of a session. The mpsc channel feeds a single writer task,
/// which serializes concurrent sends (pings racing unload commands).
struct Session {
    epoch: u64,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

pub struct ControlService {
    cluster: Arc<ClusterState>,
    notifier: Arc<dyn ModelStateNotifier>,
    sessions: RwLock<HashMap<String, Session>>,
    epochs: AtomicU64,
    server_version: String,
}

impl ControlService {
    pub fn new(cluster: Arc<ClusterState>, notifier: Arc<dyn ModelStateNotifier>) -> Self {
        Self {
            cluster,
            notifier,
            sessions: RwLock::new(HashMap::new()),
            epochs: AtomicU64::new(1),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Route serving the worker stream endpoint.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/control/stream", any(stream_handler))
            .with_state(self)
    }

    /// Send an unload command to `node_id`. Fails immediately when no live
    /// session exists; the ACK arrives asynchronously on the stream and is
    /// only logged, the next STATUS being authoritative.
    pub fn send_unload(
        &self,
        node_id: &str,
        request_id: &str,
        model_id: &str,
    ) -> Result<(), ControlError> {
        let tx = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .get(node_id)
                .map(|s| s.tx.clone())
                .ok_or_else(|| ControlError::Unavailable(node_id.to_string()))?
        };

        tx.send(ServerMessage::UnloadModel(UnloadModel {
            request_id: request_id.to_string(),
            model_id: model_id.to_string(),
        }))
        .map_err(|_| ControlError::Unavailable(node_id.to_string()))
    }

    /// Enqueue a PING to every live session. The sender set is copied under
    /// the read lock; actual frame writes happen on each session's writer
    /// task, so no lock is held across a network send.
    pub fn broadcast_ping(&self) {
        let txs: Vec<_> = {
            let sessions = self.sessions.read().unwrap();
            sessions.values().map(|s| s.tx.clone()).collect()
        };

        let ping = ServerMessage::Ping(Ping {
            ts_unix_ms: unix_ms_now(),
        });
        for tx in txs {
            let _ = tx.send(ping.clone());
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn connected_nodes(&self) -> Vec<String> {
        let mut out: Vec<_> = self.sessions.read().unwrap().keys().cloned().collect();
        out.sort();
        out
    }

    /// Record `tx` as the authoritative session for `node_id`, replacing any
    /// prior entry. Returns the epoch used to match the later detach.
    fn attach(&self, node_id: &str, tx: mpsc::UnboundedSender<ServerMessage>) -> u64 {
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.sessions.write().unwrap();
        if sessions.contains_key(node_id) {
            warn!(
                node_id,
                "node re-attached; previous session replaced (duplicate node ids?)"
            );
        }
        sessions.insert(node_id.to_string(), Session { epoch, tx });
        epoch
    }

    /// Remove the session only if it still matches `epoch`. A rapid
    /// reconnect may have registered a newer session under the same id.
    fn detach(&self, node_id: &str, epoch: u64) {
        let mut sessions = self.sessions.write().unwrap();
        if sessions.get(node_id).map(|s| s.epoch) == Some(epoch) {
            sessions.remove(node_id);
        }
    }

    fn ingest_hello(&self, hello: &NodeHello) {
        self.cluster.upsert_node_hello(
            &hello.node_id,
            &hello.version,
            &hello.engine_base_url,
            &hello.data_plane_url,
        );
        info!(
            node_id = %hello.node_id,
            version = %hello.version,
            engine = %hello.engine_base_url,
            data_plane = %hello.data_plane_url,
            "node hello"
        );
    }

    fn ingest_status(&self, node_id: &str, status: &NodeStatus) {
        let now = SystemTime::now();
        let mut models = HashMap::with_capacity(status.models.len());

        for m in &status.models {
            models.insert(
                m.model_id.clone(),
                ModelResidency {
                    model_id: m.model_id.clone(),
                    state: m.state,
                    loaded_since: unix_ms_to_time(m.loaded_since_unix_ms),
                    last_seen: now,
                },
            );

            // READY signals unblock requests waiting on the model gate.
            self.notifier.notify_model_state(node_id, &m.model_id, m.state);
        }

        debug!(
            node_id,
            ram_available = status.ram_available_bytes,
            inflight = status.inflight_requests,
            models = status.models.len(),
            "node status"
        );
        self.cluster.update_node_status(
            node_id,
            status.ram_total_bytes,
            status.ram_available_bytes,
            status.inflight_requests,
            models,
        );
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

        // Writer task: the only place frames are written on this session.
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(error = %e, "failed to encode server frame");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        let _ = tx.send(ServerMessage::ServerHello(ServerHello {
            server_version: self.server_version.clone(),
        }));

        let mut node_id: Option<String> = None;
        let mut epoch = 0u64;

        while let Some(frame) = ws_rx.next().await {
            let text = match frame {
                Ok(Message::Text(t)) => t,
                Ok(Message::Close(_)) | Err(_) => break,
                // Transport-level ping/pong/binary carry no protocol meaning.
                Ok(_) => continue,
            };

            let msg = match serde_json::from_str::<NodeMessage>(&text) {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "undecodable node frame, ignoring");
                    continue;
                }
            };

            match msg {
                NodeMessage::Hello(hello) => {
                    self.ingest_hello(&hello);
                    epoch = self.attach(&hello.node_id, tx.clone());
                    node_id = Some(hello.node_id);
                }
                NodeMessage::Status(status) => {
                    let Some(ref id) = node_id else {
                        // Protocol violation: a session is only usable after
                        // its hello established the node identity.
                        warn!("status received before hello, closing stream");
                        break;
                    };
                    self.ingest_status(id, &status);
                }
                NodeMessage::Ack(ack) => {
                    log_ack(&ack);
                }
                NodeMessage::Unknown => {}
            }
        }

        if let Some(ref id) = node_id {
            debug!(node_id = %id, "control session closed");
            self.detach(id, epoch);
        }
        writer.abort();
    }
}

fn log_ack(ack: &CommandAck) {
    if ack.ok {
        info!(request_id = %ack.request_id, "node ack ok");
    } else {
        warn!(request_id = %ack.request_id, error = %ack.error, "node ack failed");
    }
}

async fn stream_handler(
    State(service): State<Arc<ControlService>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| service.handle_socket(socket))
}

fn unix_ms_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn unix_ms_to_time(ms: i64) -> Option<SystemTime> {
    if ms <= 0 {
        return None;
    }
    Some(UNIX_EPOCH + std::time::Duration::from_millis(ms as u64))
}
