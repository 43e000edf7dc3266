//! Frames exchanged between a node and the rendezvous relay.
//!
//! Layout: `len: u32 LE` (covers type byte + body), `type: u8`, body.
//! Control bodies are JSON; data bodies use a compact binary envelope.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{CoreError, PeerId};

pub const MAX_RELAY_MESSAGE_BYTES: usize = 128 * 1024;
pub const MAX_ENDPOINTS: usize = 64;

/// Identifier shared by both ends of one data link or call leg.
pub type LinkId = u64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalKind {
    Open { link: LinkId },
    Accept { link: LinkId },
    Close { link: LinkId },
    Call { call: LinkId, stream_id: String },
    Answer { call: LinkId, stream_id: String },
    HangUp { call: LinkId },
}

impl SignalKind {
    pub fn link_id(&self) -> LinkId {
        match self {
            SignalKind::Open { link }
            | SignalKind::Accept { link }
            | SignalKind::Close { link } => {
                *link
            }
            SignalKind::Call { call, .. }
            | SignalKind::Answer { call, .. }
            | SignalKind::HangUp { call } => *call,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signal {
    pub from: PeerId,
    pub to: PeerId,
    #[serde(flatten)]
    pub kind: SignalKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum ControlMessage {
    Claim { peer_id: PeerId },
    Claimed { peer_id: PeerId },
    IdTaken { peer_id: PeerId },
    Unavailable { peer_id: PeerId, link: LinkId },
    Departed { peer_id: PeerId },
    Signal(Signal),
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub from: PeerId,
    pub to: PeerId,
    pub link: LinkId,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Control(ControlMessage),
    Data(DataFrame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Control = 0,
    Data = 1,
}

pub fn encode_frame(frame: &RelayFrame) -> Result<Vec<u8>, CoreError> {
    let (frame_type, body) = match frame {
        RelayFrame::Control(control) => (
            FrameType::Control as u8,
            serde_json::to_vec(control).map_err(|err| CoreError::Serialization(err.to_string()))?,
        ),
        RelayFrame::Data(data) => (FrameType::Data as u8, encode_data_frame(data)?),
    };

    let frame_len = 1usize
        .checked_add(body.len())
        .ok_or(CoreError::InvalidFrameLength)?;
    let frame_len_u32 = u32::try_from(frame_len).map_err(|_| CoreError::InvalidFrameLength)?;

    let mut out = BytesMut::with_capacity(4 + frame_len);
    out.put_u32_le(frame_len_u32);
    out.put_u8(frame_type);
    out.extend_from_slice(&body);
    Ok(out.to_vec())
}

pub fn decode_frame(frame: &[u8]) -> Result<RelayFrame, CoreError> {
    if frame.len() < 5 {
        return Err(CoreError::InvalidFrameLength);
    }

    let mut cursor = frame;
    let expected_len = cursor.get_u32_le() as usize;
    if expected_len + 4 != frame.len() {
        return Err(CoreError::InvalidFrameLength);
    }

    let frame_type = cursor.get_u8();
    let body = cursor;

    match frame_type {
        x if x == FrameType::Control as u8 => {
            let control: ControlMessage = serde_json::from_slice(body)
                .map_err(|err| CoreError::Serialization(err.to_string()))?;
            Ok(RelayFrame::Control(control))
        }
        x if x == FrameType::Data as u8 => Ok(RelayFrame::Data(decode_data_frame(body)?)),
        other => Err(CoreError::UnsupportedMessageType(other)),
    }
}

fn encode_data_frame(data: &DataFrame) -> Result<Vec<u8>, CoreError> {
    // - from_len: u16, from bytes
    // - to_len: u16, to bytes
    // - link: u64
    // - payload_len: u32, payload bytes
    let from = data.from.as_bytes();
    let to = data.to.as_bytes();
    let from_len = u16::try_from(from.len()).map_err(|_| CoreError::InvalidFrameLength)?;
    let to_len = u16::try_from(to.len()).map_err(|_| CoreError::InvalidFrameLength)?;
    let payload_len =
        u32::try_from(data.payload.len()).map_err(|_| CoreError::InvalidFrameLength)?;

    let mut out =
        BytesMut::with_capacity(2 + from.len() + 2 + to.len() + 8 + 4 + data.payload.len());
    out.put_u16_le(from_len);
    out.extend_from_slice(from);
    out.put_u16_le(to_len);
    out.extend_from_slice(to);
    out.put_u64_le(data.link);
    out.put_u32_le(payload_len);
    out.extend_from_slice(&data.payload);
    Ok(out.to_vec())
}

fn decode_data_frame(mut bytes: &[u8]) -> Result<DataFrame, CoreError> {
    let from = take_str(&mut bytes)?;
    let to = take_str(&mut bytes)?;
    if bytes.len() < 8 + 4 {
        return Err(CoreError::InvalidFrameLength);
    }

    let link = bytes.get_u64_le();
    let payload_len = bytes.get_u32_le() as usize;
    if bytes.len() != payload_len {
        return Err(CoreError::InvalidFrameLength);
    }

    Ok(DataFrame {
        from,
        to,
        link,
        payload: bytes.to_vec(),
    })
}

fn take_str(bytes: &mut &[u8]) -> Result<String, CoreError> {
    if bytes.len() < 2 {
        return Err(CoreError::InvalidFrameLength);
    }
    let len = bytes.get_u16_le() as usize;
    if bytes.len() < len {
        return Err(CoreError::InvalidFrameLength);
    }
    let (head, tail) = bytes.split_at(len);
    let value = std::str::from_utf8(head)
        .map_err(|err| CoreError::Serialization(err.to_string()))?
        .to_owned();
    *bytes = tail;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_survives_encoding() {
        let frame = RelayFrame::Data(DataFrame {
            from: "alice-1".to_owned(),
            to: "bob-2".to_owned(),
            link: 42,
            payload: br#"{"type":"GOSSIP","peers":[]}"#.to_vec(),
        });
        let encoded = encode_frame(&frame).unwrap();
        assert_eq!(decode_frame(&encoded).unwrap(), frame);
    }

    #[test]
    fn signal_json_is_flat() {
        let control = ControlMessage::Signal(Signal {
            from: "a".to_owned(),
            to: "b".to_owned(),
            kind: SignalKind::Call {
                call: 9,
                stream_id: "mic".to_owned(),
            },
        });
        let value = serde_json::to_value(&control).unwrap();
        assert_eq!(value["type"], "Signal");
        assert_eq!(value["data"]["kind"], "call");
        assert_eq!(value["data"]["call"], 9);
        assert_eq!(value["data"]["from"], "a");

        let encoded = encode_frame(&RelayFrame::Control(control.clone())).unwrap();
        assert_eq!(decode_frame(&encoded).unwrap(), RelayFrame::Control(control));
    }

    #[test]
    fn truncated_and_unknown_frames_are_rejected() {
        assert!(matches!(
            decode_frame(&[0xFF, 0x00, 0xAB, 0xCD]),
            Err(CoreError::InvalidFrameLength)
        ));

        let mut bogus = encode_frame(&RelayFrame::Control(ControlMessage::Departed {
            peer_id: "x".to_owned(),
        }))
        .unwrap();
        bogus[4] = 7;
        assert!(matches!(
            decode_frame(&bogus),
            Err(CoreError::UnsupportedMessageType(7))
        ));

        let mut short = encode_frame(&RelayFrame::Data(DataFrame {
            from: "a".to_owned(),
            to: "b".to_owned(),
            link: 1,
            payload: vec![1, 2, 3],
        }))
        .unwrap();
        short.pop();
        assert!(decode_frame(&short).is_err());
    }

    #[test]
    fn signal_link_ids() {
        assert_eq!(SignalKind::Open { link: 3 }.link_id(), 3);
        assert_eq!(SignalKind::HangUp { call: 4 }.link_id(), 4);
    }
}
