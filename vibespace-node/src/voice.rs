//! Voice channel membership, the local capture, and one call leg per peer.
//!
//! The smaller identifier of each pair places the call, so two peers that see
//! each other at the same moment never dial twice.

use std::collections::HashMap;

use vibespace_core::{ChannelId, PeerId, should_initiate};

use crate::media::{MediaStream, RemoteStream};
use crate::presence::PresenceTracker;
use crate::transport::CallId;

#[derive(Debug, Clone, Default)]
pub enum CaptureState {
    #[default]
    Idle,
    Acquiring,
    Ready(MediaStream),
}

#[derive(Debug, Clone)]
pub struct VoiceCallHandle {
    pub peer: PeerId,
    pub call: CallId,
    pub initiated: bool,
    pub remote: Option<RemoteStream>,
}

#[derive(Debug, Default)]
pub struct VoiceCoordinator {
    capture: CaptureState,
    calls: HashMap<PeerId, VoiceCallHandle>,
    channel: Option<ChannelId>,
    muted: bool,
    camera_on: bool,
}

impl VoiceCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a voice channel. Returns `true` when capture must be acquired.
    pub fn enter(&mut self, channel_id: &str) -> bool {
        self.channel = Some(channel_id.to_owned());
        if matches!(self.capture, CaptureState::Idle) {
            self.capture = CaptureState::Acquiring;
            return true;
        }
        false
    }

    /// Leave the voice channel, returning every call that must be hung up.
    /// The capture stays around for the next join.
    pub fn leave(&mut self) -> Vec<VoiceCallHandle> {
        self.channel = None;
        let mut handles = self.calls.drain().map(|(_, h)| h).collect::<Vec<_>>();
        handles.sort_by(|a, b| a.peer.cmp(&b.peer));
        handles
    }

    /// Install the acquired stream. Returns `true` if still in a voice channel.
    pub fn capture_ready(&mut self, stream: MediaStream) -> bool {
        stream.audio().set_enabled(!self.muted);
        if let Some(video) = stream.video() {
            video.set_enabled(self.camera_on);
        }
        self.capture = CaptureState::Ready(stream);
        self.channel.is_some()
    }

    /// Acquisition failed; voice stays off until the next `enter`.
    pub fn capture_failed(&mut self) {
        self.capture = CaptureState::Idle;
        self.channel = None;
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn capture(&self) -> &CaptureState {
        &self.capture
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        match &self.capture {
            CaptureState::Ready(stream) => Some(stream),
            _ => None,
        }
    }

    /// In a voice channel with capture available.
    pub fn is_ready(&self) -> bool {
        self.channel.is_some() && self.local_stream().is_some()
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(stream) = self.local_stream() {
            stream.audio().set_enabled(!muted);
        }
    }

    pub fn camera_on(&self) -> bool {
        self.camera_on
    }

    pub fn set_camera(&mut self, on: bool) {
        self.camera_on = on;
        if let Some(video) = self.local_stream().and_then(MediaStream::video) {
            video.set_enabled(on);
        }
    }

    /// Peers in our channel we should call now: no handle yet and we hold
    /// the smaller id.
    pub fn calls_to_place(&self, local: &str, presence: &PresenceTracker) -> Vec<PeerId> {
        let Some(channel) = self.channel.as_deref() else {
            return Vec::new();
        };
        if !self.is_ready() {
            return Vec::new();
        }
        presence
            .peers_in_channel(channel)
            .into_iter()
            .filter(|peer| peer != local)
            .filter(|peer| !self.calls.contains_key(peer))
            .filter(|peer| should_initiate(local, peer))
            .collect()
    }

    /// Whether an inbound call from `caller` should be answered: we are ready,
    /// the caller is reported in our channel, it is the side that places calls,
    /// and no leg to it exists yet.
    pub fn accepts_call_from(
        &self,
        local: &str,
        caller: &str,
        presence: &PresenceTracker,
    ) -> bool {
        let Some(channel) = self.channel.as_deref() else {
            return false;
        };
        self.is_ready()
            && !self.calls.contains_key(caller)
            && should_initiate(caller, local)
            && presence.get(caller).and_then(|r| r.channel_id.as_deref()) == Some(channel)
    }

    /// Remove handles whose peer is no longer reported in our channel.
    pub fn departed(&mut self, presence: &PresenceTracker) -> Vec<VoiceCallHandle> {
        let channel = self.channel.clone();
        let gone = self
            .calls
            .keys()
            .filter(|peer| {
                let reported = presence.get(peer).and_then(|r| r.channel_id.as_deref());
                channel.is_none() || reported != channel.as_deref()
            })
            .cloned()
            .collect::<Vec<_>>();
        let mut handles = gone
            .iter()
            .filter_map(|peer| self.calls.remove(peer))
            .collect::<Vec<_>>();
        handles.sort_by(|a, b| a.peer.cmp(&b.peer));
        handles
    }

    pub fn track(&mut self, peer: &str, call: CallId, initiated: bool) {
        self.calls.insert(
            peer.to_owned(),
            VoiceCallHandle {
                peer: peer.to_owned(),
                call,
                initiated,
                remote: None,
            },
        );
    }

    pub fn has_call(&self, peer: &str) -> bool {
        self.calls.contains_key(peer)
    }

    pub fn handle(&self, peer: &str) -> Option<&VoiceCallHandle> {
        self.calls.get(peer)
    }

    /// Fill the remote slot of `call`. Returns the peer it belongs to.
    pub fn attach(&mut self, call: CallId, stream: RemoteStream) -> Option<PeerId> {
        let handle = self.calls.values_mut().find(|h| h.call == call)?;
        handle.remote = Some(stream);
        Some(handle.peer.clone())
    }

    pub fn remove_call(&mut self, call: CallId) -> Option<VoiceCallHandle> {
        let peer = self
            .calls
            .values()
            .find(|h| h.call == call)
            .map(|h| h.peer.clone())?;
        self.calls.remove(&peer)
    }

    pub fn drop_peer(&mut self, peer: &str) -> Option<VoiceCallHandle> {
        self.calls.remove(peer)
    }

    pub fn calls(&self) -> Vec<PeerId> {
        let mut peers = self.calls.keys().cloned().collect::<Vec<_>>();
        peers.sort();
        peers
    }

    pub fn remote_streams(&self) -> Vec<RemoteStream> {
        let mut streams = self
            .calls
            .values()
            .filter_map(|h| h.remote.clone())
            .collect::<Vec<_>>();
        streams.sort_by(|a, b| a.peer.cmp(&b.peer));
        streams
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use vibespace_core::PresenceRecord;

    use super::*;

    fn in_channel(tracker: &mut PresenceTracker, peer: &str, channel: Option<&str>) {
        tracker.observe(
            PresenceRecord {
                peer_id: peer.to_owned(),
                display_name: peer.to_owned(),
                avatar: String::new(),
                channel_id: channel.map(str::to_owned),
                muted: false,
                speaking: false,
                camera_on: false,
                sent_at_ms: 0,
            },
            Instant::now(),
        );
    }

    fn ready_coordinator() -> VoiceCoordinator {
        let mut voice = VoiceCoordinator::new();
        assert!(voice.enter("voice-general"));
        assert!(voice.capture_ready(MediaStream::new("mic", false)));
        voice
    }

    #[test]
    fn only_smaller_id_places_the_call() {
        let mut tracker = PresenceTracker::new(Duration::from_secs(10));
        in_channel(&mut tracker, "alice-1", Some("voice-general"));
        in_channel(&mut tracker, "bob-2", Some("voice-general"));
        in_channel(&mut tracker, "carol-3", Some("gen-1"));

        let voice = ready_coordinator();
        assert_eq!(voice.calls_to_place("alice-1", &tracker), vec!["bob-2".to_owned()]);
        assert!(voice.calls_to_place("bob-2", &tracker).is_empty());
    }

    #[test]
    fn inbound_calls_need_a_smaller_caller_in_our_channel() {
        let mut tracker = PresenceTracker::new(Duration::from_secs(10));
        in_channel(&mut tracker, "alice-1", Some("voice-general"));
        in_channel(&mut tracker, "carol-3", Some("voice-general"));
        in_channel(&mut tracker, "amy-0", Some("gen-1"));

        let mut voice = ready_coordinator();
        assert!(voice.accepts_call_from("bob-2", "alice-1", &tracker));
        assert!(!voice.accepts_call_from("bob-2", "carol-3", &tracker));
        assert!(!voice.accepts_call_from("bob-2", "amy-0", &tracker));
        assert!(!voice.accepts_call_from("bob-2", "aaron-9", &tracker));

        voice.track("alice-1", CallId(4), false);
        assert!(!voice.accepts_call_from("bob-2", "alice-1", &tracker));

        let idle = VoiceCoordinator::new();
        assert!(!idle.accepts_call_from("bob-2", "alice-1", &tracker));
    }

    #[test]
    fn nothing_is_placed_before_capture() {
        let mut tracker = PresenceTracker::new(Duration::from_secs(10));
        in_channel(&mut tracker, "bob-2", Some("voice-general"));

        let mut voice = VoiceCoordinator::new();
        assert!(voice.enter("voice-general"));
        assert!(!voice.enter("voice-general"));
        assert!(voice.calls_to_place("alice-1", &tracker).is_empty());
    }

    #[test]
    fn mute_gates_the_shared_track() {
        let mut voice = VoiceCoordinator::new();
        voice.set_muted(true);
        voice.enter("voice-general");
        let stream = MediaStream::new("mic", true);
        voice.capture_ready(stream.clone());
        assert!(!stream.audio().is_enabled());
        assert!(stream.video().is_some_and(|v| !v.is_enabled()));

        voice.set_muted(false);
        voice.set_camera(true);
        assert!(stream.audio().is_enabled());
        assert!(stream.video().is_some_and(|v| v.is_enabled()));
    }

    #[test]
    fn leave_keeps_capture_and_returns_calls() {
        let mut voice = ready_coordinator();
        voice.track("bob-2", CallId(7), true);
        voice.attach(
            CallId(7),
            RemoteStream {
                peer: "bob-2".to_owned(),
                stream_id: "s".to_owned(),
            },
        );
        assert_eq!(voice.remote_streams().len(), 1);

        let ended = voice.leave();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].call, CallId(7));
        assert!(voice.remote_streams().is_empty());
        assert!(voice.local_stream().is_some());
        assert!(!voice.enter("voice-general"));
        assert!(voice.is_ready());
    }

    #[test]
    fn departed_peers_lose_their_handles() {
        let mut tracker = PresenceTracker::new(Duration::from_secs(10));
        in_channel(&mut tracker, "bob-2", Some("gen-1"));
        in_channel(&mut tracker, "carol-3", Some("voice-general"));

        let mut voice = ready_coordinator();
        voice.track("bob-2", CallId(1), true);
        voice.track("carol-3", CallId(2), true);
        voice.track("dave-4", CallId(3), false);

        let gone = voice
            .departed(&tracker)
            .into_iter()
            .map(|h| h.peer)
            .collect::<Vec<_>>();
        assert_eq!(gone, vec!["bob-2".to_owned(), "dave-4".to_owned()]);
        assert_eq!(voice.calls(), vec!["carol-3".to_owned()]);
    }

    #[test]
    fn capture_failure_leaves_voice() {
        let mut voice = VoiceCoordinator::new();
        voice.enter("voice-general");
        voice.capture_failed();
        assert!(voice.channel().is_none());
        assert!(matches!(voice.capture(), CaptureState::Idle));
        assert!(voice.enter("voice-general"));
    }
}
