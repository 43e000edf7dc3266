//! The mesh session: one task owning every piece of mesh state.
//!
//! Transport events, capture results, user commands and the two timers are
//! multiplexed in [`MeshSession::run`]. Everything the UI needs to know leaves
//! through the [`SessionUpdate`] channel.

use std::sync::Arc;
use std::time::Instant;

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, trace, warn};
use vibespace_core::{
    Channel, ChannelId, Message, MeshPayload, PeerId, PresenceRecord, decode_payload,
    encode_payload, now_unix_ms,
};

use crate::bootstrap::rendezvous_targets;
use crate::config::MeshConfig;
use crate::gossip;
use crate::media::{MediaConstraints, MediaDevices, MediaError, MediaStream, RemoteStream};
use crate::messaging::MessageLog;
use crate::presence::PresenceTracker;
use crate::registry::{Connection, ConnectionRegistry, Registration, Removal};
use crate::transport::{CallId, ConnectionId, Direction, Transport, TransportEvent};
use crate::voice::{VoiceCallHandle, VoiceCoordinator};

type CaptureResult = Result<MediaStream, MediaError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalProfile {
    pub peer_id: PeerId,
    pub display_name: String,
    pub avatar: String,
}

impl LocalProfile {
    pub fn new(peer_id: impl Into<PeerId>, display_name: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_name: display_name.into(),
            avatar: String::new(),
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = avatar.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    PresenceChanged(PresenceRecord),
    PresenceExpired(PeerId),
    MessageAppended {
        channel_id: ChannelId,
        message: Message,
    },
    VoiceReady,
    MediaUnavailable(String),
    CallStarted {
        peer: PeerId,
        initiated: bool,
    },
    RemoteStreamAdded(RemoteStream),
    CallEnded(PeerId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSnapshot {
    pub local: PresenceRecord,
    pub peers: Vec<PeerId>,
    pub presence: Vec<PresenceRecord>,
    pub calls: Vec<PeerId>,
    pub remote_streams: Vec<RemoteStream>,
}

#[derive(Debug)]
pub enum SessionCommand {
    SendMessage {
        channel_id: ChannelId,
        content: String,
    },
    JoinChannel(Channel),
    LeaveChannel,
    SetMuted(bool),
    SetSpeaking(bool),
    SetCamera(bool),
    Snapshot(oneshot::Sender<MeshSnapshot>),
    Shutdown,
}

pub struct MeshSession<T: Transport> {
    profile: LocalProfile,
    config: MeshConfig,
    transport: T,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    media: Arc<dyn MediaDevices>,
    capture_tx: mpsc::UnboundedSender<CaptureResult>,
    capture_rx: mpsc::UnboundedReceiver<CaptureResult>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    registry: ConnectionRegistry,
    presence: PresenceTracker,
    messages: MessageLog,
    voice: VoiceCoordinator,
    channel: Option<Channel>,
    speaking: bool,
}

impl<T: Transport> MeshSession<T> {
    pub fn new(
        profile: LocalProfile,
        config: MeshConfig,
        transport: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        media: Arc<dyn MediaDevices>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionUpdate>) {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let presence = PresenceTracker::new(config.stale_after);
        let registry = ConnectionRegistry::new(profile.peer_id.clone());
        (
            Self {
                profile,
                config,
                transport,
                events,
                media,
                capture_tx,
                capture_rx,
                updates: updates_tx,
                registry,
                presence,
                messages: MessageLog::new(),
                voice: VoiceCoordinator::new(),
                channel: None,
                speaking: false,
            },
            updates_rx,
        )
    }

    pub fn local_id(&self) -> &str {
        &self.profile.peer_id
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn messages(&self, channel_id: &str) -> &[Message] {
        self.messages.channel(channel_id)
    }

    pub fn voice(&self) -> &VoiceCoordinator {
        &self.voice
    }

    pub fn active_channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Dial every rendezvous id once. Unreachable ones simply fail later.
    pub fn bootstrap(&mut self) {
        let targets = rendezvous_targets(self.local_id(), &self.config.rendezvous, &self.registry);
        for target in targets {
            debug!(peer = %target, "dialing rendezvous");
            self.dial(&target);
        }
    }

    /// Dial `peer` unless it is us, already connected, or already being dialed.
    pub fn dial(&mut self, peer: &str) -> Option<ConnectionId> {
        if peer.is_empty() || peer == self.local_id() || self.registry.is_known(peer) {
            return None;
        }
        let conn = self.transport.connect(peer);
        self.registry.begin_dial(Connection::dialing(conn, peer.to_owned()));
        trace!(peer = %peer, %conn, "dialing");
        Some(conn)
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Opened {
                conn,
                peer,
                direction,
            } => self.on_opened(conn, peer, direction),
            TransportEvent::Data {
                conn,
                peer,
                payload,
            } => self.on_data(conn, &peer, &payload, now),
            TransportEvent::Closed { conn, peer } => self.on_closed(conn, &peer),
            TransportEvent::Failed { conn, peer, error } => {
                debug!(peer = %peer, %conn, "connection failed: {}", error);
                self.on_closed(conn, &peer);
            }
            TransportEvent::IncomingCall { call, peer } => self.on_incoming_call(call, &peer),
            TransportEvent::CallStream { call, peer, stream } => {
                if self.voice.attach(call, stream.clone()).is_some() {
                    debug!(peer = %peer, %call, "remote stream attached");
                    self.emit(SessionUpdate::RemoteStreamAdded(stream));
                }
            }
            TransportEvent::CallClosed { call, peer } => self.on_call_closed(call, &peer),
            TransportEvent::CallFailed { call, peer, error } => {
                debug!(peer = %peer, %call, "call failed: {}", error);
                self.on_call_closed(call, &peer);
            }
        }
    }

    pub fn handle_capture(&mut self, result: CaptureResult) {
        match result {
            Ok(stream) => {
                info!(stream = %stream.id(), "capture ready");
                if self.voice.capture_ready(stream) {
                    self.emit(SessionUpdate::VoiceReady);
                    self.reconcile_voice();
                }
                self.heartbeat();
            }
            Err(err) => {
                warn!("media acquisition failed: {}", err);
                self.voice.capture_failed();
                self.emit(SessionUpdate::MediaUnavailable(err.to_string()));
                if self.channel.as_ref().is_some_and(Channel::is_voice) {
                    self.channel = None;
                    self.heartbeat();
                }
            }
        }
    }

    /// Drain whatever is queued without waiting. Returns how many inputs ran.
    pub fn pump(&mut self, now: Instant) -> usize {
        let mut handled = 0;
        loop {
            if let Ok(event) = self.events.try_recv() {
                self.handle_transport_event(event, now);
            } else if let Ok(result) = self.capture_rx.try_recv() {
                self.handle_capture(result);
            } else {
                return handled;
            }
            handled += 1;
        }
    }

    /// Append locally and broadcast. Blank content or channel is ignored.
    pub fn send_message(&mut self, channel_id: &str, content: &str) -> Option<Message> {
        if channel_id.trim().is_empty() || content.trim().is_empty() {
            return None;
        }
        let message = self.messages.compose(
            &self.profile.display_name,
            &self.profile.avatar,
            content,
            now_unix_ms(),
        );
        self.messages.append(channel_id, message.clone());
        let delivered = self.broadcast(&MeshPayload::Msg {
            channel_id: channel_id.to_owned(),
            message: message.clone(),
        });
        debug!(channel = %channel_id, delivered, "message sent");
        self.emit(SessionUpdate::MessageAppended {
            channel_id: channel_id.to_owned(),
            message: message.clone(),
        });
        Some(message)
    }

    pub fn join_channel(&mut self, channel: Channel) {
        if self.channel.as_ref().is_some_and(|c| c.id == channel.id) {
            return;
        }
        self.end_voice();
        info!(channel = %channel.id, "joined channel");

        if channel.is_voice() {
            if self.voice.enter(&channel.id) {
                self.acquire_capture();
            } else if self.voice.local_stream().is_some() {
                self.emit(SessionUpdate::VoiceReady);
            }
        }
        self.channel = Some(channel);
        self.heartbeat();
        self.reconcile_voice();
    }

    pub fn leave_channel(&mut self) {
        if self.channel.take().is_none() {
            return;
        }
        self.end_voice();
        self.heartbeat();
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.voice.set_muted(muted);
        self.heartbeat();
    }

    pub fn set_speaking(&mut self, speaking: bool) {
        if self.speaking == speaking {
            return;
        }
        self.speaking = speaking;
        self.heartbeat();
    }

    pub fn set_camera(&mut self, on: bool) {
        self.voice.set_camera(on);
        self.heartbeat();
    }

    /// Broadcast our presence record. Returns how many peers received it.
    pub fn heartbeat(&mut self) -> usize {
        let payload = MeshPayload::Presence {
            payload: self.local_presence(),
        };
        self.broadcast(&payload)
    }

    /// Expire silent peers and tear down their calls.
    pub fn sweep(&mut self, now: Instant) -> Vec<PeerId> {
        let expired = self.presence.sweep(now);
        for peer in &expired {
            info!(peer = %peer, "presence expired");
            self.emit(SessionUpdate::PresenceExpired(peer.clone()));
            if let Some(handle) = self.voice.drop_peer(peer) {
                self.hang_up(handle);
            }
        }
        expired
    }

    pub fn local_presence(&self) -> PresenceRecord {
        PresenceRecord {
            peer_id: self.profile.peer_id.clone(),
            display_name: self.profile.display_name.clone(),
            avatar: self.profile.avatar.clone(),
            channel_id: self.channel.as_ref().map(|c| c.id.clone()),
            muted: self.voice.muted(),
            speaking: self.speaking,
            camera_on: self.voice.camera_on(),
            sent_at_ms: now_unix_ms(),
        }
    }

    /// Align call legs with who is in our voice channel right now.
    pub fn reconcile_voice(&mut self) {
        if !self.voice.is_ready() {
            return;
        }
        for handle in self.voice.departed(&self.presence) {
            debug!(peer = %handle.peer, "peer left voice channel");
            self.hang_up(handle);
        }

        let Some(stream) = self.voice.local_stream().cloned() else {
            return;
        };
        for peer in self.voice.calls_to_place(self.local_id(), &self.presence) {
            let call = self.transport.call(&peer, &stream);
            info!(peer = %peer, %call, "placing call");
            self.voice.track(&peer, call, true);
            self.emit(SessionUpdate::CallStarted {
                peer,
                initiated: true,
            });
        }
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        MeshSnapshot {
            local: self.local_presence(),
            peers: self.registry.peers(),
            presence: self.presence.records(),
            calls: self.voice.calls(),
            remote_streams: self.voice.remote_streams(),
        }
    }

    /// Hang up every call and close every link.
    pub fn shutdown(&mut self) {
        for handle in self.voice.leave() {
            self.transport.hang_up(handle.call);
        }
        for conn in self.registry.drain() {
            self.transport.close(conn);
        }
        info!(peer = %self.profile.peer_id, "session shut down");
    }

    pub fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SendMessage {
                channel_id,
                content,
            } => {
                self.send_message(&channel_id, &content);
            }
            SessionCommand::JoinChannel(channel) => self.join_channel(channel),
            SessionCommand::LeaveChannel => self.leave_channel(),
            SessionCommand::SetMuted(muted) => self.set_muted(muted),
            SessionCommand::SetSpeaking(speaking) => self.set_speaking(speaking),
            SessionCommand::SetCamera(on) => self.set_camera(on),
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Shutdown => self.shutdown(),
        }
    }

    /// Bootstrap, then serve inputs until shutdown or until the transport goes away.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(peer = %self.profile.peer_id, "mesh session starting");
        self.bootstrap();

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle_transport_event(event, Instant::now()),
                    None => {
                        warn!("transport event stream ended");
                        break;
                    }
                },
                Some(result) = self.capture_rx.recv() => self.handle_capture(result),
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                _ = heartbeat.tick() => {
                    self.heartbeat();
                }
                _ = sweep.tick() => {
                    self.sweep(Instant::now());
                }
            }
        }

        self.shutdown();
    }

    fn on_opened(&mut self, conn: ConnectionId, peer: PeerId, direction: Direction) {
        let registration = self
            .registry
            .register(Connection::opened(conn, peer.clone(), direction));

        let gossip = gossip::announcement(self.local_id(), &self.registry);
        self.send_to(conn, &gossip);

        match registration {
            Registration::Registered => {
                info!(peer = %peer, %conn, ?direction, "peer connected");
                let presence = MeshPayload::Presence {
                    payload: self.local_presence(),
                };
                self.send_to(conn, &presence);
                self.emit(SessionUpdate::PeerConnected(peer));
            }
            Registration::Unchanged => trace!(peer = %peer, %conn, "link already active"),
            Registration::Replaced(previous) => {
                debug!(peer = %peer, %conn, superseded = %previous.id(), "switching link");
                self.transport.close(previous.id());
                // The greeting may have been lost with the old link.
                let presence = MeshPayload::Presence {
                    payload: self.local_presence(),
                };
                self.send_to(conn, &presence);
            }
            Registration::Rejected(_) => {
                debug!(peer = %peer, %conn, "closing duplicate link");
                self.transport.close(conn);
            }
        }
    }

    fn on_data(&mut self, conn: ConnectionId, peer: &str, payload: &[u8], now: Instant) {
        let payload = match decode_payload(payload) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(peer = %peer, %conn, "ignoring payload: {}", err);
                return;
            }
        };

        match payload {
            MeshPayload::Gossip { peers } => {
                for fresh in gossip::discover(self.local_id(), &self.registry, &peers) {
                    debug!(peer = %fresh, via = %peer, "discovered peer");
                    self.dial(&fresh);
                }
            }
            MeshPayload::Presence { payload: record } => {
                if record.peer_id != peer || record.peer_id == self.profile.peer_id {
                    warn!(peer = %peer, claimed = %record.peer_id, "presence id mismatch");
                    return;
                }
                if self.presence.observe(record.clone(), now) {
                    self.emit(SessionUpdate::PresenceChanged(record));
                }
                self.reconcile_voice();
            }
            MeshPayload::Msg {
                channel_id,
                message,
            } => {
                self.messages.append(&channel_id, message.clone());
                self.emit(SessionUpdate::MessageAppended {
                    channel_id,
                    message,
                });
            }
        }
    }

    fn on_closed(&mut self, conn: ConnectionId, peer: &str) {
        match self.registry.unregister(conn, peer) {
            Removal::Active(_) => {
                info!(peer = %peer, %conn, "peer disconnected");
                self.presence.remove(peer);
                if let Some(handle) = self.voice.drop_peer(peer) {
                    self.hang_up(handle);
                }
                self.emit(SessionUpdate::PeerDisconnected(peer.to_owned()));
            }
            Removal::Dial(_) => trace!(peer = %peer, %conn, "dial dropped"),
            Removal::Ignored => {}
        }
    }

    fn on_incoming_call(&mut self, call: CallId, peer: &str) {
        let accepted = self.voice.accepts_call_from(self.local_id(), peer, &self.presence);
        let stream = match self.voice.local_stream() {
            Some(stream) if accepted => stream.clone(),
            _ => {
                debug!(peer = %peer, %call, "rejecting call");
                self.transport.hang_up(call);
                return;
            }
        };
        match self.transport.answer(call, &stream) {
            Ok(()) => {
                info!(peer = %peer, %call, "answered call");
                self.voice.track(peer, call, false);
                self.emit(SessionUpdate::CallStarted {
                    peer: peer.to_owned(),
                    initiated: false,
                });
            }
            Err(err) => debug!(peer = %peer, %call, "answer failed: {}", err),
        }
    }

    fn on_call_closed(&mut self, call: CallId, peer: &str) {
        if let Some(handle) = self.voice.remove_call(call) {
            debug!(peer = %peer, %call, "call closed");
            self.emit(SessionUpdate::CallEnded(handle.peer));
        }
    }

    fn end_voice(&mut self) {
        for handle in self.voice.leave() {
            self.hang_up(handle);
        }
    }

    fn hang_up(&mut self, handle: VoiceCallHandle) {
        self.transport.hang_up(handle.call);
        self.emit(SessionUpdate::CallEnded(handle.peer));
    }

    fn acquire_capture(&self) {
        let constraints = if self.config.capture_video {
            MediaConstraints::audio_video()
        } else {
            MediaConstraints::audio_only()
        };
        let acquisition = self.media.acquire(constraints);
        let tx = self.capture_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(acquisition.await);
        });
    }

    fn broadcast(&self, payload: &MeshPayload) -> usize {
        match encode_payload(payload) {
            Ok(bytes) => self.registry.broadcast(&self.transport, &bytes),
            Err(err) => {
                warn!("failed to encode payload: {}", err);
                0
            }
        }
    }

    fn send_to(&self, conn: ConnectionId, payload: &MeshPayload) {
        let bytes = match encode_payload(payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("failed to encode payload: {}", err);
                return;
            }
        };
        if let Err(err) = self.transport.send(conn, bytes) {
            debug!(%conn, "send failed: {}", err);
        }
    }

    fn emit(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }
}

/// Cloneable command side of a running session.
#[derive(Debug, Clone)]
pub struct MeshHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl MeshHandle {
    pub fn send_message(&self, channel_id: &str, content: &str) -> bool {
        self.send(SessionCommand::SendMessage {
            channel_id: channel_id.to_owned(),
            content: content.to_owned(),
        })
    }

    pub fn join_channel(&self, channel: Channel) -> bool {
        self.send(SessionCommand::JoinChannel(channel))
    }

    pub fn leave_channel(&self) -> bool {
        self.send(SessionCommand::LeaveChannel)
    }

    pub fn set_muted(&self, muted: bool) -> bool {
        self.send(SessionCommand::SetMuted(muted))
    }

    pub fn set_speaking(&self, speaking: bool) -> bool {
        self.send(SessionCommand::SetSpeaking(speaking))
    }

    pub fn set_camera(&self, on: bool) -> bool {
        self.send(SessionCommand::SetCamera(on))
    }

    pub async fn snapshot(&self) -> Option<MeshSnapshot> {
        let (tx, rx) = oneshot::channel();
        if !self.send(SessionCommand::Snapshot(tx)) {
            return None;
        }
        rx.await.ok()
    }

    pub fn shutdown(&self) -> bool {
        self.send(SessionCommand::Shutdown)
    }

    fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

/// Run `session` on the current runtime.
pub fn spawn_session<T>(session: MeshSession<T>) -> (MeshHandle, JoinHandle<()>)
where
    T: Transport + 'static,
{
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(session.run(commands_rx));
    (
        MeshHandle {
            commands: commands_tx,
        },
        task,
    )
}
