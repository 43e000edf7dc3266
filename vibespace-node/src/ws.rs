//! [`Transport`] over the rendezvous relay.
//!
//! The relay only knows claimed identifiers. Links and call legs are agreed
//! end to end with `Signal` control frames; payloads travel as data frames
//! addressed by link id.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;
use vibespace_core::{
    ControlMessage, DataFrame, LinkId, PeerId, RelayFrame, Signal, SignalKind, decode_frame,
    encode_frame,
};

use crate::media::{MediaStream, RemoteStream};
use crate::transport::{CallId, ConnectionId, Direction, Transport, TransportError, TransportEvent};

const MAX_CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);
const CLAIM_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_BASE_MS: u64 = 200;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug)]
struct LinkEntry {
    peer: PeerId,
    open: bool,
}

#[derive(Debug)]
struct CallEntry {
    peer: PeerId,
    /// Stream id offered by the caller, known only on the answering side.
    offered: Option<String>,
}

#[derive(Debug, Default)]
struct LinkTable {
    links: HashMap<LinkId, LinkEntry>,
    calls: HashMap<LinkId, CallEntry>,
}

#[derive(Debug, Clone)]
struct Shared {
    local: PeerId,
    table: Arc<Mutex<LinkTable>>,
    outgoing: mpsc::UnboundedSender<RelayFrame>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, LinkTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal(&self, to: &str, kind: SignalKind) -> Result<(), TransportError> {
        self.outgoing
            .send(RelayFrame::Control(ControlMessage::Signal(Signal {
                from: self.local.clone(),
                to: to.to_owned(),
                kind,
            })))
            .map_err(|_| TransportError::Disconnected)
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

pub struct WsTransport {
    shared: Shared,
    send_task: JoinHandle<()>,
    receive_task: JoinHandle<()>,
}

impl WsTransport {
    /// Connect to the relay at `relay_url` and claim `peer_id`.
    pub async fn bind(
        relay_url: &str,
        peer_id: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        Url::parse(relay_url)
            .map_err(|err| TransportError::Relay(format!("invalid relay url: {err}")))?;

        let ws_stream = connect_with_retry(relay_url).await?;
        let (mut write_half, mut read_half) = ws_stream.split();

        let claim = encode_frame(&RelayFrame::Control(ControlMessage::Claim {
            peer_id: peer_id.to_owned(),
        }))
        .map_err(|err| TransportError::Relay(err.to_string()))?;
        write_half
            .send(Message::Binary(claim.into()))
            .await
            .map_err(|err| TransportError::Relay(format!("claim send failed: {err}")))?;

        match timeout(CLAIM_TIMEOUT, await_claim(&mut read_half, peer_id)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TransportError::Relay(format!(
                    "no claim response after {:?}",
                    CLAIM_TIMEOUT
                )));
            }
        }
        info!(peer = %peer_id, relay_url = %relay_url, "claimed relay endpoint");

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel::<RelayFrame>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let shared = Shared {
            local: peer_id.to_owned(),
            table: Arc::new(Mutex::new(LinkTable::default())),
            outgoing: outgoing_tx,
            events: events_tx,
        };

        let send_task = tokio::spawn(network_send_task(write_half, outgoing_rx));
        let receive_task = tokio::spawn(network_receive_task(read_half, shared.clone()));

        Ok((
            Self {
                shared,
                send_task,
                receive_task,
            },
            events_rx,
        ))
    }
}

async fn connect_with_retry(relay_url: &str) -> Result<WsStream, TransportError> {
    let mut attempt: u32 = 1;
    loop {
        info!(
            attempt,
            max_attempts = MAX_CONNECT_ATTEMPTS,
            relay_url = %relay_url,
            "connecting"
        );

        let failure = match timeout(CONNECT_TIMEOUT, connect_async(relay_url)).await {
            Ok(Ok((stream, _))) => return Ok(stream),
            Ok(Err(err)) => format!("connect failed: {err}"),
            Err(_) => format!("connect timed out after {:?}", CONNECT_TIMEOUT),
        };
        error!(attempt, relay_url = %relay_url, "{failure}");
        if attempt >= MAX_CONNECT_ATTEMPTS {
            return Err(TransportError::Relay(failure));
        }

        let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        attempt += 1;
    }
}

async fn await_claim(
    read_half: &mut futures::stream::SplitStream<WsStream>,
    peer_id: &str,
) -> Result<(), TransportError> {
    while let Some(next) = read_half.next().await {
        let message = next.map_err(|err| TransportError::Relay(format!("read failed: {err}")))?;
        let Message::Binary(data) = message else {
            continue;
        };
        match decode_frame(&data) {
            Ok(RelayFrame::Control(ControlMessage::Claimed { .. })) => return Ok(()),
            Ok(RelayFrame::Control(ControlMessage::IdTaken { .. })) => {
                return Err(TransportError::IdTaken(peer_id.to_owned()));
            }
            Ok(RelayFrame::Control(ControlMessage::Error { message })) => {
                return Err(TransportError::Relay(message));
            }
            Ok(other) => debug!("ignoring frame before claim: {:?}", other),
            Err(err) => warn!("decode frame failed: {}", err),
        }
    }
    Err(TransportError::Disconnected)
}

async fn network_send_task(
    mut ws_write: futures::stream::SplitSink<WsStream, Message>,
    mut outgoing_rx: mpsc::UnboundedReceiver<RelayFrame>,
) {
    while let Some(frame) = outgoing_rx.recv().await {
        match encode_frame(&frame) {
            Ok(bytes) => {
                if ws_write.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!("failed to encode outgoing frame: {}", err),
        }
    }
}

async fn network_receive_task(mut ws_read: futures::stream::SplitStream<WsStream>, shared: Shared) {
    while let Some(next) = ws_read.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                warn!("relay read failed: {}", err);
                break;
            }
        };

        let Message::Binary(data) = message else {
            continue;
        };
        match decode_frame(&data) {
            Ok(RelayFrame::Data(frame)) => handle_data(&shared, frame),
            Ok(RelayFrame::Control(control)) => handle_control(&shared, control),
            Err(err) => warn!("decode frame failed: {}", err),
        }
    }

    info!(peer = %shared.local, "relay connection ended");
    let table = std::mem::take(&mut *shared.table());
    for (link, entry) in table.links {
        shared.emit(TransportEvent::Closed {
            conn: ConnectionId(link),
            peer: entry.peer,
        });
    }
    for (call, entry) in table.calls {
        shared.emit(TransportEvent::CallClosed {
            call: CallId(call),
            peer: entry.peer,
        });
    }
}

fn handle_data(shared: &Shared, frame: DataFrame) {
    let accepted = shared
        .table()
        .links
        .get(&frame.link)
        .is_some_and(|entry| entry.open && entry.peer == frame.from);
    if !accepted {
        debug!(peer = %frame.from, link = frame.link, "data on unknown link");
        return;
    }
    shared.emit(TransportEvent::Data {
        conn: ConnectionId(frame.link),
        peer: frame.from,
        payload: frame.payload,
    });
}

fn handle_control(shared: &Shared, control: ControlMessage) {
    match control {
        ControlMessage::Signal(signal) => handle_signal(shared, signal),
        ControlMessage::Unavailable { peer_id, link } => {
            let mut table = shared.table();
            if table.links.remove(&link).is_some() {
                drop(table);
                shared.emit(TransportEvent::Failed {
                    conn: ConnectionId(link),
                    peer: peer_id.clone(),
                    error: TransportError::PeerUnavailable(peer_id),
                });
            } else if table.calls.remove(&link).is_some() {
                drop(table);
                shared.emit(TransportEvent::CallFailed {
                    call: CallId(link),
                    peer: peer_id.clone(),
                    error: TransportError::PeerUnavailable(peer_id),
                });
            }
        }
        ControlMessage::Departed { peer_id } => {
            let mut table = shared.table();
            let links = table
                .links
                .iter()
                .filter(|(_, entry)| entry.peer == peer_id)
                .map(|(link, _)| *link)
                .collect::<Vec<_>>();
            let calls = table
                .calls
                .iter()
                .filter(|(_, entry)| entry.peer == peer_id)
                .map(|(call, _)| *call)
                .collect::<Vec<_>>();
            for link in &links {
                table.links.remove(link);
            }
            for call in &calls {
                table.calls.remove(call);
            }
            drop(table);

            debug!(peer = %peer_id, "peer departed relay");
            for link in links {
                shared.emit(TransportEvent::Closed {
                    conn: ConnectionId(link),
                    peer: peer_id.clone(),
                });
            }
            for call in calls {
                shared.emit(TransportEvent::CallClosed {
                    call: CallId(call),
                    peer: peer_id.clone(),
                });
            }
        }
        ControlMessage::Error { message } => warn!("relay error: {}", message),
        ControlMessage::Claim { .. }
        | ControlMessage::Claimed { .. }
        | ControlMessage::IdTaken { .. } => {}
    }
}

fn handle_signal(shared: &Shared, signal: Signal) {
    if signal.to != shared.local {
        warn!(to = %signal.to, "signal addressed elsewhere");
        return;
    }
    let peer = signal.from;
    match signal.kind {
        SignalKind::Open { link } => {
            shared.table().links.insert(
                link,
                LinkEntry {
                    peer: peer.clone(),
                    open: true,
                },
            );
            if shared.signal(&peer, SignalKind::Accept { link }).is_err() {
                return;
            }
            shared.emit(TransportEvent::Opened {
                conn: ConnectionId(link),
                peer,
                direction: Direction::Inbound,
            });
        }
        SignalKind::Accept { link } => {
            let opened = match shared.table().links.get_mut(&link) {
                Some(entry) if entry.peer == peer && !entry.open => {
                    entry.open = true;
                    true
                }
                _ => false,
            };
            if opened {
                shared.emit(TransportEvent::Opened {
                    conn: ConnectionId(link),
                    peer,
                    direction: Direction::Outbound,
                });
            }
        }
        SignalKind::Close { link } => {
            if shared.table().links.remove(&link).is_some() {
                shared.emit(TransportEvent::Closed {
                    conn: ConnectionId(link),
                    peer,
                });
            }
        }
        SignalKind::Call { call, stream_id } => {
            shared.table().calls.insert(
                call,
                CallEntry {
                    peer: peer.clone(),
                    offered: Some(stream_id),
                },
            );
            shared.emit(TransportEvent::IncomingCall {
                call: CallId(call),
                peer,
            });
        }
        SignalKind::Answer { call, stream_id } => {
            if shared.table().calls.contains_key(&call) {
                shared.emit(TransportEvent::CallStream {
                    call: CallId(call),
                    peer: peer.clone(),
                    stream: RemoteStream {
                        peer,
                        stream_id,
                    },
                });
            }
        }
        SignalKind::HangUp { call } => {
            if shared.table().calls.remove(&call).is_some() {
                shared.emit(TransportEvent::CallClosed {
                    call: CallId(call),
                    peer,
                });
            }
        }
    }
}

impl Transport for WsTransport {
    fn local_id(&self) -> &str {
        &self.shared.local
    }

    fn connect(&self, peer: &str) -> ConnectionId {
        let link: LinkId = rand::random();
        self.shared.table().links.insert(
            link,
            LinkEntry {
                peer: peer.to_owned(),
                open: false,
            },
        );
        if let Err(error) = self.shared.signal(peer, SignalKind::Open { link }) {
            self.shared.table().links.remove(&link);
            self.shared.emit(TransportEvent::Failed {
                conn: ConnectionId(link),
                peer: peer.to_owned(),
                error,
            });
        }
        ConnectionId(link)
    }

    fn send(&self, conn: ConnectionId, payload: Vec<u8>) -> Result<(), TransportError> {
        let peer = match self.shared.table().links.get(&conn.0) {
            Some(entry) if entry.open => entry.peer.clone(),
            _ => return Err(TransportError::NotOpen(conn)),
        };
        self.shared
            .outgoing
            .send(RelayFrame::Data(DataFrame {
                from: self.shared.local.clone(),
                to: peer,
                link: conn.0,
                payload,
            }))
            .map_err(|_| TransportError::Disconnected)
    }

    fn close(&self, conn: ConnectionId) {
        let Some(entry) = self.shared.table().links.remove(&conn.0) else {
            return;
        };
        let _ = self.shared.signal(&entry.peer, SignalKind::Close { link: conn.0 });
        self.shared.emit(TransportEvent::Closed {
            conn,
            peer: entry.peer,
        });
    }

    fn call(&self, peer: &str, local: &MediaStream) -> CallId {
        let call: LinkId = rand::random();
        self.shared.table().calls.insert(
            call,
            CallEntry {
                peer: peer.to_owned(),
                offered: None,
            },
        );
        let kind = SignalKind::Call {
            call,
            stream_id: local.id().to_owned(),
        };
        if let Err(error) = self.shared.signal(peer, kind) {
            self.shared.table().calls.remove(&call);
            self.shared.emit(TransportEvent::CallFailed {
                call: CallId(call),
                peer: peer.to_owned(),
                error,
            });
        }
        CallId(call)
    }

    fn answer(&self, call: CallId, local: &MediaStream) -> Result<(), TransportError> {
        let (peer, offered) = match self.shared.table().calls.get(&call.0) {
            Some(CallEntry {
                peer,
                offered: Some(offered),
            }) => (peer.clone(), offered.clone()),
            _ => return Err(TransportError::UnknownCall(call)),
        };
        self.shared.signal(
            &peer,
            SignalKind::Answer {
                call: call.0,
                stream_id: local.id().to_owned(),
            },
        )?;
        self.shared.emit(TransportEvent::CallStream {
            call,
            peer: peer.clone(),
            stream: RemoteStream {
                peer,
                stream_id: offered,
            },
        });
        Ok(())
    }

    fn hang_up(&self, call: CallId) {
        let Some(entry) = self.shared.table().calls.remove(&call.0) else {
            return;
        };
        let _ = self
            .shared
            .signal(&entry.peer, SignalKind::HangUp { call: call.0 });
        self.shared.emit(TransportEvent::CallClosed {
            call,
            peer: entry.peer,
        });
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.send_task.abort();
        self.receive_task.abort();
    }
}
