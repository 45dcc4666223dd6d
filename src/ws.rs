//! WebSocket fan-out: upgrade handling, the tracked client set, and the
//! heartbeat sweep.
//!
//! The dashboard is public, so anonymous upgrades are accepted; identity
//! is attached where a session exists. Dead peers are force-terminated,
//! never gracefully closed — a dead peer will not ack a close frame and
//! the socket would leak.

use crate::metrics::PipelineMetrics;
use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Per-client send buffer; a peer that cannot drain this is terminated
/// rather than allowed to stall fan-out.
const SEND_BUFFER: usize = 256;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum Identity {
    Authenticated(String),
    Anonymous(Uuid),
}

impl Identity {
    fn label(&self) -> String {
        match self {
            Self::Authenticated(user) => format!("user:{user}"),
            Self::Anonymous(id) => format!("anon:{id}"),
        }
    }
}

pub struct ClientHandle {
    pub identity: Identity,
    pub is_alive: Arc<AtomicBool>,
    pub tx: mpsc::Sender<Message>,
    pub cancel: CancellationToken,
}

pub struct ClientRegistry {
    clients: DashMap<Uuid, ClientHandle>,
    metrics: Arc<PipelineMetrics>,
}

impl ClientRegistry {
    pub fn new(metrics: Arc<PipelineMetrics>) -> Arc<Self> {
        Arc::new(Self { clients: DashMap::new(), metrics })
    }

    pub fn insert(&self, id: Uuid, handle: ClientHandle) {
        PipelineMetrics::incr(&self.metrics.ws_connected);
        self.clients.insert(id, handle);
    }

    pub fn remove(&self, id: Uuid) {
        self.clients.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Force-terminate one client: cancel its loop and forget it.
    pub fn terminate(&self, id: Uuid) {
        if let Some((_, handle)) = self.clients.remove(&id) {
            handle.cancel.cancel();
            PipelineMetrics::incr(&self.metrics.ws_terminated);
        }
    }

    /// Queue the same already-serialized frame to every open client.
    /// A client whose buffer is full or closed is terminated; the loop
    /// continues for the rest. Returns the delivery count.
    pub fn broadcast_text(&self, frame: &str) -> usize {
        let mut delivered = 0;
        let mut broken = Vec::new();
        for entry in self.clients.iter() {
            match entry.tx.try_send(Message::Text(frame.to_string())) {
                Ok(()) => delivered += 1,
                Err(_) => broken.push(*entry.key()),
            }
        }
        for id in broken {
            debug!(client = %id, "send buffer overflow, terminating");
            self.terminate(id);
        }
        delivered
    }

    /// One heartbeat round: clients that never ponged since the last
    /// round are terminated; the rest are pinged with the flag lowered.
    pub fn heartbeat_sweep(&self) {
        let mut dead = Vec::new();
        for entry in self.clients.iter() {
            if !entry.is_alive.swap(false, Ordering::Relaxed) {
                dead.push(*entry.key());
                continue;
            }
            if entry.tx.try_send(Message::Ping(Vec::new())).is_err() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            debug!(client = %id, "heartbeat timeout, terminating");
            self.terminate(id);
        }
    }
}

// ── Upgrade handlers ─────────────────────────────────────────────────

/// Public dashboard socket: session identity when present, anonymous
/// otherwise.
pub async fn upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match state.sessions.identity(&headers) {
        Some(session) => Identity::Authenticated(session.user_id),
        None => Identity::Anonymous(Uuid::new_v4()),
    };
    ws.on_upgrade(move |socket| client_loop(state, socket, identity))
}

/// Reserved admin socket: anonymous upgrades are rejected before the
/// handshake completes.
pub async fn upgrade_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    match state.sessions.identity(&headers) {
        Some(session) => {
            let identity = Identity::Authenticated(session.user_id);
            ws.on_upgrade(move |socket| client_loop(state, socket, identity))
        }
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

#[derive(Serialize)]
struct FeedFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    items: &'a [crate::model::ThreatFeedItem],
}

pub fn feed_frame(items: &[crate::model::ThreatFeedItem]) -> String {
    serde_json::to_string(&FeedFrame { kind: "threat-feed", items })
        .unwrap_or_else(|_| r#"{"type":"threat-feed","items":[]}"#.to_string())
}

async fn client_loop(state: AppState, mut socket: WebSocket, identity: Identity) {
    let id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<Message>(SEND_BUFFER);
    let cancel = state.shutdown.child_token();
    let is_alive = Arc::new(AtomicBool::new(true));
    state.registry.insert(
        id,
        ClientHandle {
            identity: identity.clone(),
            is_alive: is_alive.clone(),
            tx,
            cancel: cancel.clone(),
        },
    );
    info!(client = %id, identity = %identity.label(), total = state.registry.len(), "ws client connected");

    // New clients get context immediately, not at the next feed ingest.
    let snapshot = feed_frame(&state.feed.active());
    if socket.send(Message::Text(snapshot)).await.is_err() {
        state.registry.remove(id);
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            queued = rx.recv() => match queued {
                Some(msg) => {
                    if socket.send(msg).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Pong(_))) => is_alive.store(true, Ordering::Relaxed),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(client = %id, error = %e, "ws receive error");
                    break;
                }
                // No client → server messages are defined; drop them.
                Some(Ok(_)) => {}
            },
        }
    }

    state.registry.remove(id);
    info!(client = %id, total = state.registry.len(), "ws client disconnected");
}

/// Heartbeat monitor: a peer missing two consecutive rounds is gone
/// within 60 s, with no per-client timer.
pub async fn heartbeat(registry: Arc<ClientRegistry>, cancel: CancellationToken) {
    let mut iv = tokio::time::interval(HEARTBEAT_INTERVAL);
    iv.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = iv.tick() => registry.heartbeat_sweep(),
        }
    }
}

/// Relays threat-feed broadcasts from the bus to every socket.
pub async fn feed_forwarder(
    bus: Arc<crate::bus::EventBus>,
    registry: Arc<ClientRegistry>,
    cancel: CancellationToken,
) {
    let mut rx = bus.subscribe_threat_feed();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            recv = rx.recv() => match recv {
                Ok(items) => {
                    let frame = feed_frame(&items);
                    registry.broadcast_text(&frame);
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return,
            },
        }
    }
}
