use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod catalog;
pub mod frame;

pub use catalog::{Server, default_servers, find_channel};
pub use frame::{
    ControlMessage, DataFrame, FrameType, LinkId, MAX_ENDPOINTS, MAX_RELAY_MESSAGE_BYTES,
    RelayFrame, Signal, SignalKind, decode_frame, encode_frame,
};

pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;
pub const MAX_PEER_ID_LEN: usize = 64;
const MAX_SLUG_LEN: usize = 32;

pub type PeerId = String;
pub type ChannelId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Text,
    Voice,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub kind: ChannelKind,
}

impl Channel {
    pub fn text(id: &str, name: &str) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            kind: ChannelKind::Text,
        }
    }

    pub fn voice(id: &str, name: &str) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            kind: ChannelKind::Voice,
        }
    }

    pub fn is_voice(&self) -> bool {
        self.kind == ChannelKind::Voice
    }
}

/// A peer's self-reported status snapshot, as carried by `PRESENCE`.
///
/// The receiver tracks its own local `last_seen` instant next to the record;
/// `sent_at_ms` is informational only and never used for expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub peer_id: PeerId,
    pub display_name: String,
    pub avatar: String,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub speaking: bool,
    #[serde(default)]
    pub camera_on: bool,
    #[serde(default)]
    pub sent_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub author: String,
    pub avatar: String,
    pub content: String,
    pub timestamp_ms: u64,
}

/// Payloads exchanged over a peer data channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum MeshPayload {
    #[serde(rename = "GOSSIP")]
    Gossip { peers: Vec<PeerId> },
    #[serde(rename = "PRESENCE")]
    Presence { payload: PresenceRecord },
    #[serde(rename = "MSG", rename_all = "camelCase")]
    Msg {
        channel_id: ChannelId,
        message: Message,
    },
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("identifier must not be empty")]
    EmptyIdentifier,
    #[error("identifier exceeds 64 bytes")]
    IdentifierTooLong,
    #[error("payload of {size} bytes exceeds {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("invalid frame length")]
    InvalidFrameLength,
    #[error("unsupported message type {0}")]
    UnsupportedMessageType(u8),
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub fn encode_payload(payload: &MeshPayload) -> Result<Vec<u8>, CoreError> {
    let bytes =
        serde_json::to_vec(payload).map_err(|err| CoreError::Serialization(err.to_string()))?;
    if bytes.len() > MAX_PAYLOAD_BYTES {
        return Err(CoreError::PayloadTooLarge {
            size: bytes.len(),
            max: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(bytes)
}

/// Unknown `type` tags and malformed JSON both surface as
/// [`CoreError::Serialization`]; callers treat that as "ignore".
pub fn decode_payload(bytes: &[u8]) -> Result<MeshPayload, CoreError> {
    if bytes.len() > MAX_PAYLOAD_BYTES {
        return Err(CoreError::PayloadTooLarge {
            size: bytes.len(),
            max: MAX_PAYLOAD_BYTES,
        });
    }
    serde_json::from_slice(bytes).map_err(|err| CoreError::Serialization(err.to_string()))
}

/// Call-initiator tie-break: the lexicographically smaller id places the call.
pub fn should_initiate(self_id: &str, peer_id: &str) -> bool {
    self_id < peer_id
}

pub fn validate_peer_id(peer_id: &str) -> Result<(), CoreError> {
    if peer_id.trim().is_empty() {
        return Err(CoreError::EmptyIdentifier);
    }
    if peer_id.len() > MAX_PEER_ID_LEN {
        return Err(CoreError::IdentifierTooLong);
    }
    Ok(())
}

/// Fresh identifier for a session: display-name slug plus 24 random bits.
pub fn generate_peer_id(display_name: &str) -> PeerId {
    let suffix: u32 = rand::rng().random_range(0..0x0100_0000);
    format!("{}-{:06x}", slug(display_name), suffix)
}

/// Stable identifier, re-derivable across sessions from the same inputs.
pub fn derive_peer_id(display_name: &str, seed: &str) -> PeerId {
    let mut hasher = Sha256::new();
    hasher.update(display_name.as_bytes());
    hasher.update([0_u8]);
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    format!("{}-{}", slug(display_name), hex::encode(&digest[0..3]))
}

pub fn now_unix_ms() -> u64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    duration.as_millis() as u64
}

fn slug(display_name: &str) -> String {
    let mut out = String::new();
    for ch in display_name.trim().chars() {
        if out.len() >= MAX_SLUG_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "peer".to_owned()
    } else {
        trimmed.to_owned()
    }
}
