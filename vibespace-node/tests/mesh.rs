use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use vibespace_core::{Channel, MeshPayload, PeerId, PresenceRecord, encode_payload};
use vibespace_node::{
    ConnectionId, Direction, MemoryNetwork, MemoryTransport, MeshConfig, MeshSession,
    SessionUpdate, SyntheticMedia, Transport, TransportError, TransportEvent,
    media::{MediaDevices, MediaError},
    session::LocalProfile,
};

const RENDEZVOUS: &str = "vibespace-rendezvous-1";

struct Node {
    session: MeshSession<MemoryTransport>,
    updates: mpsc::UnboundedReceiver<SessionUpdate>,
}

impl Node {
    fn id(&self) -> &str {
        self.session.local_id()
    }

    fn drain_updates(&mut self) -> Vec<SessionUpdate> {
        let mut out = Vec::new();
        while let Ok(update) = self.updates.try_recv() {
            out.push(update);
        }
        out
    }
}

fn config(rendezvous: &[&str]) -> MeshConfig {
    MeshConfig {
        rendezvous: rendezvous.iter().map(|id| (*id).to_owned()).collect(),
        ..MeshConfig::default()
    }
}

fn node_with(
    network: &MemoryNetwork,
    id: &str,
    rendezvous: &[&str],
    media: Arc<dyn MediaDevices>,
) -> Node {
    let (transport, events) = network.bind(id).unwrap();
    let (session, updates) = MeshSession::new(
        LocalProfile::new(id, id),
        config(rendezvous),
        transport,
        events,
        media,
    );
    Node { session, updates }
}

fn node(network: &MemoryNetwork, id: &str, rendezvous: &[&str]) -> Node {
    node_with(network, id, rendezvous, Arc::new(SyntheticMedia::granted()))
}

/// Pump every node until a few consecutive rounds find nothing to do.
async fn settle(nodes: &mut [&mut Node]) {
    let mut idle_rounds = 0;
    for _ in 0..1_000 {
        let now = Instant::now();
        let handled: usize = nodes.iter_mut().map(|n| n.session.pump(now)).sum();
        tokio::task::yield_now().await;
        if handled == 0 {
            idle_rounds += 1;
            if idle_rounds >= 5 {
                return;
            }
        } else {
            idle_rounds = 0;
        }
    }
    panic!("mesh did not settle");
}

fn voice_channel() -> Channel {
    Channel::voice("voice-general", "General Voice")
}

#[tokio::test]
async fn mesh_converges_for_sequential_joins() {
    let network = MemoryNetwork::new();
    let mut nodes = vec![node(&network, RENDEZVOUS, &[RENDEZVOUS])];
    for idx in 1..5 {
        let mut joiner = node(&network, &format!("peer-{idx}"), &[RENDEZVOUS]);
        joiner.session.bootstrap();
        nodes.push(joiner);
        let mut refs = nodes.iter_mut().collect::<Vec<_>>();
        settle(&mut refs).await;
    }

    for node in &nodes {
        assert_eq!(node.session.registry().len(), 4, "node {}", node.id());
        assert_eq!(node.session.presence().len(), 4, "node {}", node.id());
    }
}

#[tokio::test]
async fn mesh_converges_for_simultaneous_joins() {
    let network = MemoryNetwork::new();
    let mut nodes = vec![node(&network, RENDEZVOUS, &[RENDEZVOUS])];
    for id in ["e-5", "a-1", "d-4", "b-2"] {
        nodes.push(node(&network, id, &[RENDEZVOUS, "vibespace-rendezvous-2"]));
    }
    for node in nodes.iter_mut() {
        node.session.bootstrap();
    }
    let mut refs = nodes.iter_mut().collect::<Vec<_>>();
    settle(&mut refs).await;

    for node in &nodes {
        let mut expected = nodes
            .iter()
            .map(|n| n.id().to_owned())
            .filter(|id| id != node.id())
            .collect::<Vec<PeerId>>();
        expected.sort();
        assert_eq!(node.session.registry().peers(), expected);
    }
}

#[tokio::test]
async fn triangle_closes_after_one_gossip_round() {
    let network = MemoryNetwork::new();
    let mut b = node(&network, "b", &[]);
    let mut a = node(&network, "a", &["b"]);
    let mut c = node(&network, "c", &[]);

    a.session.bootstrap();
    settle(&mut [&mut a, &mut b, &mut c]).await;
    assert!(a.session.registry().has("b"));
    assert!(!a.session.registry().has("c"));

    c.session.dial("b");
    settle(&mut [&mut a, &mut b, &mut c]).await;

    assert!(a.session.registry().has("c"));
    assert!(c.session.registry().has("a"));
    assert_eq!(network.link_count(), 3);
    for node in [&a, &b, &c] {
        assert_eq!(node.session.registry().len(), 2);
    }
}

#[tokio::test]
async fn isolated_node_is_reached_through_shared_identifier() {
    let network = MemoryNetwork::new();
    let mut alice = node(
        &network,
        "alice-1",
        &[
            "vibespace-rendezvous-1",
            "vibespace-rendezvous-2",
            "vibespace-rendezvous-3",
        ],
    );
    alice.session.bootstrap();
    settle(&mut [&mut alice]).await;
    assert!(alice.session.registry().is_empty());
    assert!(!alice.session.registry().is_dialing("vibespace-rendezvous-1"));

    let mut bob = node(&network, "bob-2", &["vibespace-rendezvous-1", "alice-1"]);
    bob.session.bootstrap();
    settle(&mut [&mut alice, &mut bob]).await;
    assert!(alice.session.registry().has("bob-2"));

    bob.session.join_channel(Channel::text("gen-1", "gen-1"));
    assert!(bob.session.send_message("gen-1", "hello").is_some());
    settle(&mut [&mut alice, &mut bob]).await;

    let log = alice.session.messages("gen-1");
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].content, "hello");
    assert_eq!(log[0].author, "bob-2");
    assert!(alice.drain_updates().iter().any(|u| matches!(
        u,
        SessionUpdate::MessageAppended { channel_id, .. } if channel_id == "gen-1"
    )));
}

#[tokio::test]
async fn blank_messages_are_not_sent() {
    let network = MemoryNetwork::new();
    let mut alice = node(&network, "alice-1", &[]);
    let mut bob = node(&network, "bob-2", &["alice-1"]);
    bob.session.bootstrap();
    settle(&mut [&mut alice, &mut bob]).await;

    assert!(bob.session.send_message("gen-1", "   ").is_none());
    assert!(bob.session.send_message("", "hello").is_none());
    settle(&mut [&mut alice, &mut bob]).await;
    assert!(alice.session.messages("gen-1").is_empty());
    assert!(bob.session.messages("gen-1").is_empty());
}

#[tokio::test]
async fn broadcast_skips_closed_connection() {
    let network = MemoryNetwork::new();
    let mut hub = node(&network, "hub", &[]);
    let mut p1 = node(&network, "p1", &[]);
    let mut p2 = node(&network, "p2", &[]);
    let mut p3 = node(&network, "p3", &[]);
    for peer in ["p1", "p2", "p3"] {
        hub.session.dial(peer);
    }
    settle(&mut [&mut hub, &mut p1, &mut p2, &mut p3]).await;
    assert_eq!(hub.session.registry().len(), 3);

    let conn = hub.session.registry().get("p3").map(|c| c.id()).unwrap();
    hub.session.transport().close(conn);
    settle(&mut [&mut hub, &mut p1, &mut p2, &mut p3]).await;
    assert!(!hub.session.registry().has("p3"));

    hub.session.send_message("gen-1", "fan-out");
    settle(&mut [&mut hub, &mut p1, &mut p2, &mut p3]).await;

    assert_eq!(p1.session.messages("gen-1").len(), 1);
    assert_eq!(p2.session.messages("gen-1").len(), 1);
    assert!(p3.session.messages("gen-1").is_empty());
    assert_eq!(hub.session.messages("gen-1").len(), 1);
}

#[tokio::test]
async fn repeated_open_for_same_peer_registers_once() {
    let network = MemoryNetwork::new();
    let mut alice = node(&network, "alice-1", &[]);
    let mut bob = node(&network, "bob-2", &["alice-1"]);
    bob.session.bootstrap();
    settle(&mut [&mut alice, &mut bob]).await;
    alice.drain_updates();

    let active = alice.session.registry().get("bob-2").map(|c| c.id());
    alice.session.handle_transport_event(
        TransportEvent::Opened {
            conn: ConnectionId(9_999),
            peer: "bob-2".to_owned(),
            direction: Direction::Inbound,
        },
        Instant::now(),
    );
    assert_eq!(alice.session.registry().len(), 1);
    assert_eq!(alice.session.registry().get("bob-2").map(|c| c.id()), active);

    alice.session.handle_transport_event(
        TransportEvent::Closed {
            conn: ConnectionId(9_999),
            peer: "bob-2".to_owned(),
        },
        Instant::now(),
    );
    assert!(alice.session.registry().has("bob-2"));
    assert!(alice.drain_updates().is_empty());
}

#[tokio::test]
async fn crossing_dials_keep_a_single_link() {
    // Either dial may open first; both ends must settle on the same link.
    for smaller_dials_first in [true, false] {
        let network = MemoryNetwork::new();
        let mut a = node(&network, "a", &["b"]);
        let mut b = node(&network, "b", &["a"]);
        if smaller_dials_first {
            a.session.bootstrap();
            b.session.bootstrap();
        } else {
            b.session.bootstrap();
            a.session.bootstrap();
        }
        settle(&mut [&mut a, &mut b]).await;

        assert_eq!(network.link_count(), 1);
        let kept = a.session.registry().get("b").map(|c| c.id());
        assert!(kept.is_some());
        assert_eq!(b.session.registry().get("a").map(|c| c.id()), kept);
        assert!(a.session.presence().get("b").is_some());
        assert!(b.session.presence().get("a").is_some());
        assert_eq!(
            a.drain_updates()
                .iter()
                .filter(|u| matches!(u, SessionUpdate::PeerConnected(_)))
                .count(),
            1
        );
        b.drain_updates();

        a.session.send_message("gen-1", "hi");
        settle(&mut [&mut a, &mut b]).await;
        assert_eq!(b.session.messages("gen-1").len(), 1);

        a.session.transport().close(kept.unwrap());
        settle(&mut [&mut a, &mut b]).await;
        assert_eq!(network.link_count(), 0);
        assert!(!a.session.registry().has("b"));
        assert!(!b.session.registry().has("a"));
        assert!(a.drain_updates().contains(&SessionUpdate::PeerDisconnected("b".to_owned())));
        assert!(b.drain_updates().contains(&SessionUpdate::PeerDisconnected("a".to_owned())));
    }
}

#[tokio::test]
async fn spoofed_and_malformed_payloads_are_ignored() {
    let network = MemoryNetwork::new();
    let mut alice = node(&network, "alice-1", &[]);
    let mut bob = node(&network, "bob-2", &["alice-1"]);
    bob.session.bootstrap();
    settle(&mut [&mut alice, &mut bob]).await;
    let conn = alice.session.registry().get("bob-2").map(|c| c.id()).unwrap();

    let forged = encode_payload(&MeshPayload::Presence {
        payload: PresenceRecord {
            peer_id: "carol-3".to_owned(),
            display_name: "carol".to_owned(),
            avatar: String::new(),
            channel_id: None,
            muted: false,
            speaking: false,
            camera_on: false,
            sent_at_ms: 0,
        },
    })
    .unwrap();
    for payload in [forged, b"{not json".to_vec(), br#"{"type":"TYPING"}"#.to_vec()] {
        alice.session.handle_transport_event(
            TransportEvent::Data {
                conn,
                peer: "bob-2".to_owned(),
                payload,
            },
            Instant::now(),
        );
    }
    assert!(alice.session.presence().get("carol-3").is_none());
    assert_eq!(alice.session.presence().len(), 1);
}

#[tokio::test]
async fn silent_peer_expires_but_refreshed_peer_stays() {
    let network = MemoryNetwork::new();
    let mut alice = node(&network, "alice-1", &[]);
    let mut bob = node(&network, "bob-2", &["alice-1"]);
    bob.session.bootstrap();
    settle(&mut [&mut alice, &mut bob]).await;
    alice.drain_updates();

    let start = Instant::now();
    for step in 1..=6 {
        bob.session.heartbeat();
        let now = start + Duration::from_millis(2_500 * step);
        alice.session.pump(now);
        assert!(alice.session.sweep(now).is_empty());
    }

    let later = start + Duration::from_millis(2_500 * 6) + Duration::from_secs(11);
    assert_eq!(alice.session.sweep(later), vec!["bob-2".to_owned()]);
    assert!(
        alice
            .drain_updates()
            .contains(&SessionUpdate::PresenceExpired("bob-2".to_owned()))
    );
}

async fn voice_pair(
    alice_media: Arc<dyn MediaDevices>,
    bob_media: Arc<dyn MediaDevices>,
) -> (MemoryNetwork, Node, Node) {
    let network = MemoryNetwork::new();
    let mut alice = node_with(&network, "alice-1", &[], alice_media);
    let mut bob = node_with(&network, "bob-2", &["alice-1"], bob_media);
    bob.session.bootstrap();
    settle(&mut [&mut alice, &mut bob]).await;

    bob.session.join_channel(voice_channel());
    alice.session.join_channel(voice_channel());
    settle(&mut [&mut alice, &mut bob]).await;
    (network, alice, bob)
}

#[tokio::test]
async fn smaller_id_always_places_the_call() {
    for _ in 0..3 {
        let granted: Arc<dyn MediaDevices> = Arc::new(SyntheticMedia::granted());
        let (_network, mut alice, mut bob) = voice_pair(granted.clone(), granted).await;

        let from_alice = alice.session.voice().handle("bob-2").cloned().unwrap();
        let from_bob = bob.session.voice().handle("alice-1").cloned().unwrap();
        assert!(from_alice.initiated);
        assert!(!from_bob.initiated);
        assert_eq!(from_alice.call, from_bob.call);
        assert!(from_alice.remote.is_some());
        assert!(from_bob.remote.is_some());

        assert!(alice.drain_updates().iter().all(|u| !matches!(
            u,
            SessionUpdate::CallStarted { initiated: false, .. }
        )));
        assert!(bob.drain_updates().iter().all(|u| !matches!(
            u,
            SessionUpdate::CallStarted { initiated: true, .. }
        )));
    }
}

#[tokio::test]
async fn leaving_voice_hangs_up_but_keeps_capture() {
    let granted: Arc<dyn MediaDevices> = Arc::new(SyntheticMedia::granted());
    let (_network, mut alice, mut bob) = voice_pair(granted.clone(), granted).await;
    let capture = bob.session.voice().local_stream().map(|s| s.id().to_owned());

    bob.session.join_channel(Channel::text("general", "general"));
    settle(&mut [&mut alice, &mut bob]).await;
    assert!(bob.session.voice().calls().is_empty());
    assert!(alice.session.voice().calls().is_empty());
    assert!(bob.session.voice().remote_streams().is_empty());
    assert_eq!(
        bob.session.voice().local_stream().map(|s| s.id().to_owned()),
        capture
    );

    bob.session.join_channel(voice_channel());
    settle(&mut [&mut alice, &mut bob]).await;
    assert_eq!(alice.session.voice().calls(), vec!["bob-2".to_owned()]);
}

#[tokio::test]
async fn mute_reaches_track_and_presence() {
    let granted: Arc<dyn MediaDevices> = Arc::new(SyntheticMedia::granted());
    let (_network, mut alice, mut bob) = voice_pair(granted.clone(), granted).await;

    bob.session.set_muted(true);
    settle(&mut [&mut alice, &mut bob]).await;
    let track_enabled = bob
        .session
        .voice()
        .local_stream()
        .map(|s| s.audio().is_enabled());
    assert_eq!(track_enabled, Some(false));
    assert_eq!(
        alice.session.presence().get("bob-2").map(|r| r.muted),
        Some(true)
    );
}

#[tokio::test]
async fn refused_capture_reports_and_leaves_voice() {
    let granted: Arc<dyn MediaDevices> = Arc::new(SyntheticMedia::granted());
    let refusing: Arc<dyn MediaDevices> =
        Arc::new(SyntheticMedia::refusing(MediaError::PermissionDenied));
    let (_network, mut alice, mut bob) = voice_pair(granted, refusing).await;

    assert!(
        bob.drain_updates()
            .contains(&SessionUpdate::MediaUnavailable(
                MediaError::PermissionDenied.to_string()
            ))
    );
    assert!(bob.session.active_channel().is_none());
    assert!(bob.session.voice().calls().is_empty());
    assert!(alice.session.voice().calls().is_empty());
    assert_eq!(
        alice
            .session
            .presence()
            .get("bob-2")
            .and_then(|r| r.channel_id.clone()),
        None
    );
}

#[tokio::test]
async fn disconnect_clears_presence_and_calls() {
    let granted: Arc<dyn MediaDevices> = Arc::new(SyntheticMedia::granted());
    let (network, mut alice, bob) = voice_pair(granted.clone(), granted).await;
    alice.drain_updates();

    drop(bob);
    assert!(!network.is_bound("bob-2"));
    settle(&mut [&mut alice]).await;

    assert!(alice.session.registry().is_empty());
    assert!(alice.session.presence().is_empty());
    assert!(alice.session.voice().calls().is_empty());
    let updates = alice.drain_updates();
    assert!(updates.contains(&SessionUpdate::PeerDisconnected("bob-2".to_owned())));
    assert!(updates.contains(&SessionUpdate::CallEnded("bob-2".to_owned())));
}

#[tokio::test]
async fn call_error_cleans_up_like_close() {
    let granted: Arc<dyn MediaDevices> = Arc::new(SyntheticMedia::granted());
    let (_network, mut alice, _bob) = voice_pair(granted.clone(), granted).await;
    alice.drain_updates();
    let call = alice.session.voice().handle("bob-2").map(|h| h.call).unwrap();

    alice.session.handle_transport_event(
        TransportEvent::CallFailed {
            call,
            peer: "bob-2".to_owned(),
            error: TransportError::Disconnected,
        },
        Instant::now(),
    );

    assert!(alice.session.voice().handle("bob-2").is_none());
    assert!(alice.session.voice().remote_streams().is_empty());
    assert!(alice.session.registry().has("bob-2"));
    assert_eq!(
        alice.drain_updates(),
        vec![SessionUpdate::CallEnded("bob-2".to_owned())]
    );
}

#[tokio::test]
async fn connection_error_cleans_up_like_close() {
    let granted: Arc<dyn MediaDevices> = Arc::new(SyntheticMedia::granted());
    let (_network, mut alice, _bob) = voice_pair(granted.clone(), granted).await;
    alice.drain_updates();
    let conn = alice.session.registry().get("bob-2").map(|c| c.id()).unwrap();

    alice.session.handle_transport_event(
        TransportEvent::Failed {
            conn,
            peer: "bob-2".to_owned(),
            error: TransportError::Disconnected,
        },
        Instant::now(),
    );

    assert!(!alice.session.registry().has("bob-2"));
    assert!(alice.session.presence().get("bob-2").is_none());
    assert!(alice.session.voice().handle("bob-2").is_none());
    assert!(alice.session.voice().remote_streams().is_empty());
    let updates = alice.drain_updates();
    assert!(updates.contains(&SessionUpdate::CallEnded("bob-2".to_owned())));
    assert!(updates.contains(&SessionUpdate::PeerDisconnected("bob-2".to_owned())));
}

#[tokio::test]
async fn calls_from_the_larger_id_are_refused() {
    let granted: Arc<dyn MediaDevices> = Arc::new(SyntheticMedia::granted());
    let (_network, mut alice, bob) = voice_pair(granted.clone(), granted).await;
    let call = alice.session.voice().handle("bob-2").map(|h| h.call).unwrap();
    alice.session.handle_transport_event(
        TransportEvent::CallClosed {
            call,
            peer: "bob-2".to_owned(),
        },
        Instant::now(),
    );
    alice.drain_updates();

    let stream = bob.session.voice().local_stream().cloned().unwrap();
    bob.session.transport().call("alice-1", &stream);
    settle(&mut [&mut alice]).await;

    assert!(alice.session.voice().handle("bob-2").is_none());
    assert!(alice.drain_updates().iter().all(|u| !matches!(
        u,
        SessionUpdate::CallStarted { initiated: false, .. }
    )));
}
