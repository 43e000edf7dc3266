use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use vibespace_core::{
    Channel, PeerId, default_servers, derive_peer_id, find_channel, generate_peer_id,
};
use vibespace_node::{
    LocalProfile, MeshHandle, MeshSession, SessionUpdate, SyntheticMedia, WsTransport,
    bootstrap::claim_identity,
    config::{self, DEFAULT_RELAY_URL, SavedNodeConfig},
    spawn_session,
};

#[derive(Parser, Debug)]
#[command(name = "vibespace-node")]
struct NodeArgs {
    /// WebSocket URL of the rendezvous relay.
    #[arg(long)]
    relay_url: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    avatar: Option<String>,
    /// Derive a stable peer id from the name and this seed.
    #[arg(long)]
    seed: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Try to become one of the well-known rendezvous ids.
    #[arg(long)]
    claim_rendezvous: bool,
    #[arg(long, default_value = "general")]
    channel: String,
    #[arg(long)]
    video: bool,
    /// Persist the effective settings to the config file.
    #[arg(long)]
    save_config: bool,
}

enum Input {
    Say(String),
    Join(String),
    Mute(bool),
    Camera(bool),
    Peers,
    Quit,
    Unknown(String),
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(Input::Say(line.to_owned()));
    };
    let mut parts = command.split_whitespace();
    let input = match (parts.next(), parts.next()) {
        (Some("join"), Some(channel)) => Input::Join(channel.to_owned()),
        (Some("mute"), None) => Input::Mute(true),
        (Some("unmute"), None) => Input::Mute(false),
        (Some("camera"), Some("on")) => Input::Camera(true),
        (Some("camera"), Some("off")) => Input::Camera(false),
        (Some("peers"), None) => Input::Peers,
        (Some("quit"), None) => Input::Quit,
        _ => Input::Unknown(line.to_owned()),
    };
    Some(input)
}

fn resolve_channel(channel_id: &str) -> Channel {
    match find_channel(&default_servers(), channel_id) {
        Some(channel) => channel.clone(),
        None => {
            warn!(channel = %channel_id, "channel not in catalogue; treating as text");
            Channel::text(channel_id, channel_id)
        }
    }
}

fn log_update(update: &SessionUpdate) {
    match update {
        SessionUpdate::PeerConnected(peer) => info!(peer = %peer, "peer connected"),
        SessionUpdate::PeerDisconnected(peer) => info!(peer = %peer, "peer disconnected"),
        SessionUpdate::PresenceChanged(record) => info!(
            peer = %record.peer_id,
            name = %record.display_name,
            channel = ?record.channel_id,
            muted = record.muted,
            "presence"
        ),
        SessionUpdate::PresenceExpired(peer) => info!(peer = %peer, "presence expired"),
        SessionUpdate::MessageAppended {
            channel_id,
            message,
        } => println!("[{}] {}: {}", channel_id, message.author, message.content),
        SessionUpdate::VoiceReady => info!("voice ready"),
        SessionUpdate::MediaUnavailable(reason) => warn!("media unavailable: {}", reason),
        SessionUpdate::CallStarted { peer, initiated } => {
            info!(peer = %peer, initiated, "call started")
        }
        SessionUpdate::RemoteStreamAdded(stream) => {
            info!(peer = %stream.peer, stream = %stream.stream_id, "remote stream")
        }
        SessionUpdate::CallEnded(peer) => info!(peer = %peer, "call ended"),
    }
}

async fn print_peers(handle: &MeshHandle) {
    let Some(snapshot) = handle.snapshot().await else {
        return;
    };
    println!("connected: {}", snapshot.peers.join(", "));
    for record in snapshot.presence {
        println!(
            "  {} ({}) channel={} muted={} camera={}",
            record.display_name,
            record.peer_id,
            record.channel_id.as_deref().unwrap_or("-"),
            record.muted,
            record.camera_on
        );
    }
    if !snapshot.calls.is_empty() {
        println!("in call with: {}", snapshot.calls.join(", "));
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = NodeArgs::parse();
    let config_path = args.config.clone().unwrap_or_else(config::config_path);
    let saved = match config::load_config_from_path(&config_path) {
        Ok(saved) => saved.unwrap_or_default(),
        Err(err) => {
            warn!(path = %config_path.display(), "saved config invalid; using defaults: {}", err);
            SavedNodeConfig::default()
        }
    };

    let relay_url = args
        .relay_url
        .clone()
        .or_else(|| saved.relay_url.clone())
        .unwrap_or_else(|| DEFAULT_RELAY_URL.to_owned());
    let display_name = args
        .name
        .clone()
        .or_else(|| saved.display_name.clone())
        .unwrap_or_else(|| "anon".to_owned());
    let avatar = args
        .avatar
        .clone()
        .or_else(|| saved.avatar.clone())
        .unwrap_or_default();
    let seed = args.seed.clone().or_else(|| saved.identity_seed.clone());

    let mut mesh = saved.mesh_config();
    mesh.capture_video = args.video;

    if args.save_config {
        let effective = SavedNodeConfig {
            relay_url: Some(relay_url.clone()),
            display_name: Some(display_name.clone()),
            avatar: (!avatar.is_empty()).then(|| avatar.clone()),
            identity_seed: seed.clone(),
            ..saved.clone()
        };
        match config::save_config_to_path(&config_path, &effective) {
            Ok(()) => info!(path = %config_path.display(), "config saved"),
            Err(err) => warn!(path = %config_path.display(), "config save failed: {}", err),
        }
    }

    let session_id: PeerId = match seed.as_deref() {
        Some(seed) => derive_peer_id(&display_name, seed),
        None => generate_peer_id(&display_name),
    };

    let bound = if args.claim_rendezvous {
        claim_identity(&mesh.rendezvous, &session_id, |id: PeerId| {
            let url = relay_url.clone();
            async move { WsTransport::bind(&url, &id).await }
        })
        .await
    } else {
        WsTransport::bind(&relay_url, &session_id)
            .await
            .map(|bound| (session_id.clone(), bound))
    };
    let (peer_id, (transport, events)) = match bound {
        Ok(bound) => bound,
        Err(err) => {
            error!(relay_url = %relay_url, "failed to join relay: {}", err);
            std::process::exit(1);
        }
    };
    info!(peer = %peer_id, name = %display_name, "node ready");

    let profile = LocalProfile::new(peer_id, display_name).with_avatar(avatar);
    let (session, mut updates) = MeshSession::new(
        profile,
        mesh,
        transport,
        events,
        Arc::new(SyntheticMedia::granted()),
    );
    let (handle, session_task) = spawn_session(session);

    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            log_update(&update);
        }
    });

    let mut channel = resolve_channel(&args.channel);
    handle.join_channel(channel.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!("stdin read failed: {}", err);
                break;
            }
        };
        match parse_input(&line) {
            None => {}
            Some(Input::Say(text)) => {
                handle.send_message(&channel.id, &text);
            }
            Some(Input::Join(channel_id)) => {
                channel = resolve_channel(&channel_id);
                handle.join_channel(channel.clone());
            }
            Some(Input::Mute(muted)) => {
                handle.set_muted(muted);
            }
            Some(Input::Camera(on)) => {
                handle.set_camera(on);
            }
            Some(Input::Peers) => print_peers(&handle).await,
            Some(Input::Quit) => break,
            Some(Input::Unknown(text)) => {
                println!(
                    "unknown command: {text} (try /join, /mute, /unmute, /camera on|off, /peers, /quit)"
                )
            }
        }
    }

    handle.shutdown();
    if let Err(err) = session_task.await {
        warn!("session task ended abnormally: {}", err);
    }
}
