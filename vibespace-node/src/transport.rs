//! Point-to-point transport seam.
//!
//! A transport binds one local identifier and offers data links and call legs
//! to other identifiers. Every outcome (open, data, close, failure, inbound
//! call, remote stream) is reported asynchronously as a [`TransportEvent`] on
//! the receiver handed out when the transport was bound; the methods here
//! never block.

use std::fmt;

use thiserror::Error;
use vibespace_core::PeerId;

use crate::media::{MediaStream, RemoteStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{:x}", self.0)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call#{:x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("identifier {0} is already claimed")]
    IdTaken(PeerId),
    #[error("peer {0} is unavailable")]
    PeerUnavailable(PeerId),
    #[error("{0} is not open")]
    NotOpen(ConnectionId),
    #[error("unknown {0}")]
    UnknownCall(CallId),
    #[error("relay error: {0}")]
    Relay(String),
    #[error("transport disconnected")]
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened {
        conn: ConnectionId,
        peer: PeerId,
        direction: Direction,
    },
    Data {
        conn: ConnectionId,
        peer: PeerId,
        payload: Vec<u8>,
    },
    Closed {
        conn: ConnectionId,
        peer: PeerId,
    },
    Failed {
        conn: ConnectionId,
        peer: PeerId,
        error: TransportError,
    },
    IncomingCall {
        call: CallId,
        peer: PeerId,
    },
    CallStream {
        call: CallId,
        peer: PeerId,
        stream: RemoteStream,
    },
    CallClosed {
        call: CallId,
        peer: PeerId,
    },
    CallFailed {
        call: CallId,
        peer: PeerId,
        error: TransportError,
    },
}

pub trait Transport: Send {
    fn local_id(&self) -> &str;

    /// Start dialing `peer`; the result arrives as `Opened` or `Failed`.
    fn connect(&self, peer: &str) -> ConnectionId;

    fn send(&self, conn: ConnectionId, payload: Vec<u8>) -> Result<(), TransportError>;

    fn close(&self, conn: ConnectionId);

    /// Place a call carrying `local`; the remote side sees `IncomingCall`.
    fn call(&self, peer: &str, local: &MediaStream) -> CallId;

    fn answer(&self, call: CallId, local: &MediaStream) -> Result<(), TransportError>;

    fn hang_up(&self, call: CallId);
}
