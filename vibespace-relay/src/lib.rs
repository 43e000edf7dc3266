use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
    time::Instant,
};

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade, ws::Message},
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{debug, error, info, warn};
use vibespace_core::{
    ControlMessage, MAX_ENDPOINTS, MAX_RELAY_MESSAGE_BYTES, PeerId, RelayFrame,
    decode_frame, encode_frame, validate_peer_id,
};

#[derive(Debug)]
struct Endpoint {
    tx: mpsc::UnboundedSender<Message>,
    /// Endpoints this one has exchanged frames with; told on departure.
    contacts: HashSet<PeerId>,
}

#[derive(Debug, Default)]
struct RelayState {
    endpoints: HashMap<PeerId, Endpoint>,
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<RelayState>>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RelayState::default())),
        }
    }

    pub async fn endpoint_count(&self) -> usize {
        self.inner.read().await.endpoints.len()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn consume(&mut self, amount: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

enum Route {
    Delivered,
    Unavailable,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "relay listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler(State(state): State<AppState>) -> impl IntoResponse {
    let endpoints = state.endpoint_count().await;
    Json(serde_json::json!({"ok": true, "endpoints": endpoints}))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_frame_size(MAX_RELAY_MESSAGE_BYTES)
        .on_upgrade(move |socket| async move {
            if let Err(err) = handle_socket(state, socket).await {
                warn!("socket session ended with error: {}", err);
            }
        })
}

async fn handle_socket(
    state: AppState,
    socket: axum::extract::ws::WebSocket,
) -> Result<(), String> {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Split sockets only flush queued Pongs when the write half sends, so the
    // write half pings on its own schedule to keep proxies from idling us out.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let first_message = ws_receiver
        .next()
        .await
        .ok_or_else(|| "client disconnected before claim".to_owned())
        .and_then(|result| result.map_err(|err| err.to_string()))?;

    let peer_id = parse_claim_message(&first_message)?;
    claim_endpoint(&state, &peer_id, outbound_tx.clone()).await?;
    send_control(
        &outbound_tx,
        ControlMessage::Claimed {
            peer_id: peer_id.clone(),
        },
    );

    info!(peer = %peer_id, "endpoint claimed");

    let mut rate_limiter = TokenBucket::new(256.0, 128.0);

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!("websocket receive error: {}", err);
                break;
            }
        };

        match message {
            Message::Binary(data) => {
                if data.len() > MAX_RELAY_MESSAGE_BYTES {
                    warn!(peer = %peer_id, "dropping oversized frame");
                    continue;
                }

                let frame = match decode_frame(&data) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(peer = %peer_id, "failed to decode frame: {}", err);
                        continue;
                    }
                };

                let (from, to, link) = match &frame {
                    RelayFrame::Control(ControlMessage::Signal(signal)) => {
                        (&signal.from, &signal.to, signal.kind.link_id())
                    }
                    RelayFrame::Data(data) => (&data.from, &data.to, data.link),
                    RelayFrame::Control(_) => {
                        warn!(peer = %peer_id, "unexpected control message after claim");
                        continue;
                    }
                };

                if *from != peer_id {
                    warn!(peer = %peer_id, claimed = %from, "sender id mismatch");
                    continue;
                }

                if !rate_limiter.consume(1.0) {
                    warn!(peer = %peer_id, "rate limit exceeded");
                    continue;
                }

                match forward_frame(&state, &peer_id, to, Message::Binary(data.clone())).await {
                    Route::Delivered => {}
                    Route::Unavailable => {
                        debug!(peer = %peer_id, target = %to, "target not claimed");
                        send_control(
                            &outbound_tx,
                            ControlMessage::Unavailable {
                                peer_id: to.clone(),
                                link,
                            },
                        );
                    }
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Text(_) => {}
        }
    }

    release_endpoint(&state, &peer_id).await;
    send_task.abort();
    info!(peer = %peer_id, "endpoint released");
    Ok(())
}

fn parse_claim_message(message: &Message) -> Result<PeerId, String> {
    let data = match message {
        Message::Binary(data) => data,
        _ => return Err("first message must be binary claim frame".to_owned()),
    };

    let frame = decode_frame(data).map_err(|err| format!("invalid claim frame: {}", err))?;
    match frame {
        RelayFrame::Control(ControlMessage::Claim { peer_id }) => {
            validate_peer_id(&peer_id).map_err(|err| err.to_string())?;
            Ok(peer_id)
        }
        _ => Err("first control message must be Claim".to_owned()),
    }
}

async fn claim_endpoint(
    state: &AppState,
    peer_id: &PeerId,
    tx: mpsc::UnboundedSender<Message>,
) -> Result<(), String> {
    let mut relay = state.inner.write().await;
    if relay.endpoints.contains_key(peer_id) {
        drop(relay);
        send_control(
            &tx,
            ControlMessage::IdTaken {
                peer_id: peer_id.clone(),
            },
        );
        return Err(format!("id {} already claimed", peer_id));
    }
    if relay.endpoints.len() >= MAX_ENDPOINTS {
        drop(relay);
        send_control(
            &tx,
            ControlMessage::Error {
                message: format!("relay is full (max {})", MAX_ENDPOINTS),
            },
        );
        return Err(format!("relay is full (max {})", MAX_ENDPOINTS));
    }
    relay.endpoints.insert(
        peer_id.clone(),
        Endpoint {
            tx,
            contacts: HashSet::new(),
        },
    );
    Ok(())
}

async fn release_endpoint(state: &AppState, peer_id: &PeerId) {
    let mut relay = state.inner.write().await;
    let Some(endpoint) = relay.endpoints.remove(peer_id) else {
        return;
    };

    let mut recipients = Vec::new();
    for contact in endpoint.contacts {
        if let Some(other) = relay.endpoints.get_mut(&contact) {
            other.contacts.remove(peer_id);
            recipients.push(other.tx.clone());
        }
    }
    drop(relay);

    broadcast_control(
        recipients,
        ControlMessage::Departed {
            peer_id: peer_id.clone(),
        },
    );
}

async fn forward_frame(state: &AppState, from: &PeerId, to: &PeerId, message: Message) -> Route {
    let mut relay = state.inner.write().await;
    let Some(target) = relay.endpoints.get_mut(to) else {
        return Route::Unavailable;
    };
    target.contacts.insert(from.clone());
    let target_tx = target.tx.clone();
    if let Some(source) = relay.endpoints.get_mut(from) {
        source.contacts.insert(to.clone());
    }
    drop(relay);

    if target_tx.send(message).is_err() {
        return Route::Unavailable;
    }
    Route::Delivered
}

fn send_control(tx: &mpsc::UnboundedSender<Message>, control: ControlMessage) {
    broadcast_control(vec![tx.clone()], control);
}

fn broadcast_control(recipients: Vec<mpsc::UnboundedSender<Message>>, control: ControlMessage) {
    let frame = match encode_frame(&RelayFrame::Control(control)) {
        Ok(frame) => frame,
        Err(err) => {
            error!("failed to serialize control message: {}", err);
            return;
        }
    };

    for tx in recipients {
        let _ = tx.send(Message::Binary(frame.clone().into()));
    }
}
